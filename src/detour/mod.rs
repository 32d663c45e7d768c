//! Native entry-point redirection.
//!
//! The last pipeline stage overwrites the first bytes of the original
//! function's compiled entry with an unconditional jump to the replacement.
//!
//! # Architecture
//!
//! Jump encoding is pure and pointer-width dependent: 64-bit targets get
//! `movabs rax, imm64; jmp rax` (12 bytes, reaches any address), 32-bit
//! targets get `push imm32; ret` (6 bytes). Before writing, the replacement
//! entry is peeked: if it already starts with a recognizable jump (a rel32
//! `jmp` emitted by a JIT thunk, or one of our own absolute jumps) the chain
//! is followed to its true destination, so repeated patching never stacks
//! jump-to-jump hops.
//!
//! The write itself relaxes page protection around the patched bytes
//! (`mprotect` on unix, `VirtualProtect` on windows); failures surface as
//! [`crate::Error::Install`] with the offending address. Nothing is ever
//! restored - the overwritten bytes are the installation.
//!
//! # Thread Safety
//!
//! Installation is a raw memory write; callers serialize installs per
//! function through the context's entry lock.

use std::sync::OnceLock;

use crate::file::io::read_le_at;
use crate::metadata::TypeSig;
use crate::{Error, Result};

/// Size of an installed jump in bytes on 64-bit targets.
pub const JUMP_SIZE_64: usize = 12;
/// Size of an installed jump in bytes on 32-bit targets.
pub const JUMP_SIZE_32: usize = 6;

/// Size of an installed jump on the compilation target.
#[cfg(target_pointer_width = "64")]
pub const JUMP_SIZE: usize = JUMP_SIZE_64;
/// Size of an installed jump on the compilation target.
#[cfg(not(target_pointer_width = "64"))]
pub const JUMP_SIZE: usize = JUMP_SIZE_32;

/// Encode an unconditional jump to `target` for the compilation target.
#[must_use]
pub fn encode_jump(target: usize) -> Vec<u8> {
    #[cfg(target_pointer_width = "64")]
    {
        let mut code = Vec::with_capacity(JUMP_SIZE_64);
        code.extend_from_slice(&[0x48, 0xB8]); // movabs rax, imm64
        code.extend_from_slice(&(target as u64).to_le_bytes());
        code.extend_from_slice(&[0xFF, 0xE0]); // jmp rax
        code
    }
    #[cfg(not(target_pointer_width = "64"))]
    {
        let mut code = Vec::with_capacity(JUMP_SIZE_32);
        code.push(0x68); // push imm32
        code.extend_from_slice(&(target as u32).to_le_bytes());
        code.push(0xC3); // ret
        code
    }
}

/// Decode the destination of a jump sitting at `address`, if `code` starts
/// with one of the recognized forms: `jmp rel32`, `movabs rax / jmp rax`, or
/// `push imm32 / ret`.
#[must_use]
pub fn peek_jump(address: usize, code: &[u8]) -> Option<usize> {
    if code.len() >= 5 && code[0] == 0xE9 {
        let mut offset = 1;
        let rel: i32 = read_le_at(code, &mut offset).ok()?;
        let base = i64::try_from(address).ok()? + 5;
        return usize::try_from(base + i64::from(rel)).ok();
    }

    if code.len() >= JUMP_SIZE_64
        && code[0] == 0x48
        && code[1] == 0xB8
        && code[10] == 0xFF
        && code[11] == 0xE0
    {
        let mut offset = 2;
        let imm: u64 = read_le_at(code, &mut offset).ok()?;
        return usize::try_from(imm).ok();
    }

    if code.len() >= JUMP_SIZE_32 && code[0] == 0x68 && code[5] == 0xC3 {
        let mut offset = 1;
        let imm: u32 = read_le_at(code, &mut offset).ok()?;
        return Some(imm as usize);
    }

    None
}

/// Follow any chain of recognized jumps starting at `address` to its final
/// destination. Bounded so a jump cycle cannot hang the installer.
///
/// # Safety
/// `address` and every address it chains to must point at readable memory of
/// at least [`JUMP_SIZE_64`] bytes.
#[must_use]
pub unsafe fn resolve_entry(address: usize) -> usize {
    let mut current = address;

    for _ in 0..8 {
        let code = unsafe { std::slice::from_raw_parts(current as *const u8, JUMP_SIZE_64) };
        match peek_jump(current, code) {
            Some(next) if next != current => current = next,
            _ => break,
        }
    }

    current
}

/// Overwrite the entry at `original` with a jump to `replacement`.
///
/// An existing jump at `replacement` is followed first so that re-patching
/// lands on the true destination instead of chaining.
///
/// # Errors
/// Returns [`crate::Error::Install`] when the platform refuses to make the
/// target page writable.
///
/// # Safety
/// `original` must be the entry of a compiled function at least
/// [`JUMP_SIZE`] bytes long that no thread is mid-executing through its
/// prologue, and `replacement` must point at readable memory.
pub unsafe fn install(original: usize, replacement: usize) -> Result<()> {
    let destination = unsafe { resolve_entry(replacement) };
    let code = encode_jump(destination);

    unprotect(original, code.len())?;
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), original as *mut u8, code.len());
    }
    Ok(())
}

#[cfg(unix)]
fn unprotect(address: usize, len: usize) -> Result<()> {
    // SAFETY: sysconf has no memory effects; mprotect gets a page-aligned
    // range covering the patched bytes.
    unsafe {
        let page = usize::try_from(libc::sysconf(libc::_SC_PAGESIZE)).unwrap_or(4096);
        let start = address & !(page - 1);
        let span = address + len - start;

        if libc::mprotect(
            start as *mut libc::c_void,
            span,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) != 0
        {
            return Err(Error::Install {
                address,
                message: std::io::Error::last_os_error().to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(windows)]
fn unprotect(address: usize, len: usize) -> Result<()> {
    use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE};

    let mut old = 0u32;
    // SAFETY: the range covers exactly the bytes about to be written.
    let ok = unsafe {
        VirtualProtect(
            address as *const core::ffi::c_void,
            len,
            PAGE_EXECUTE_READWRITE,
            &mut old,
        )
    };
    if ok == 0 {
        return Err(Error::Install {
            address,
            message: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn unprotect(_address: usize, _len: usize) -> Result<()> {
    Err(Error::NotSupported)
}

/// `true` when `return_type` is passed back through a hidden leading pointer
/// on this platform, which shifts every declared argument slot up by one.
///
/// Multi-field value types of size 3, 5, 6, 7 or 9 bytes and above cannot be
/// returned in registers; primitives and reference types always can.
#[must_use]
pub fn needs_return_buffer(return_type: &TypeSig) -> bool {
    static PLATFORM: OnceLock<bool> = OnceLock::new();
    let uses_buffer = *PLATFORM.get_or_init(|| cfg!(target_pointer_width = "64"));
    if !uses_buffer {
        return false;
    }

    match return_type.value_size() {
        Some(size) => matches!(size, 3 | 5 | 6 | 7) || size >= 9,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Token;

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn absolute_jump_round_trips() {
        let target = 0x7FFE_DEAD_BEEF_usize;
        let code = encode_jump(target);

        assert_eq!(code.len(), JUMP_SIZE_64);
        assert_eq!(&code[..2], &[0x48, 0xB8]);
        assert_eq!(&code[10..], &[0xFF, 0xE0]);
        assert_eq!(peek_jump(0x1000, &code), Some(target));
    }

    #[test]
    fn rel32_jump_is_recognized() {
        // jmp +0x10 at 0x2000 lands at 0x2015.
        let mut code = vec![0xE9];
        code.extend_from_slice(&0x10i32.to_le_bytes());
        assert_eq!(peek_jump(0x2000, &code), Some(0x2015));

        // Backward displacement.
        let mut back = vec![0xE9];
        back.extend_from_slice(&(-0x20i32).to_le_bytes());
        assert_eq!(peek_jump(0x2000, &back), Some(0x1FE5));
    }

    #[test]
    fn push_ret_jump_is_recognized() {
        let mut code = vec![0x68];
        code.extend_from_slice(&0x00AB_CDEFu32.to_le_bytes());
        code.push(0xC3);
        assert_eq!(peek_jump(0x3000, &code), Some(0x00AB_CDEF));
    }

    #[test]
    fn plain_code_is_not_a_jump() {
        assert_eq!(peek_jump(0x1000, &[0x90; 16]), None);
        assert_eq!(peek_jump(0x1000, &[0xE9]), None);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn chained_entries_resolve_to_the_final_destination() {
        // A buffer that itself holds a jump stands in for an already
        // detoured entry point.
        let tail = [0x90u8; 16];
        let tail_addr = tail.as_ptr() as usize;

        let mut hop = [0u8; 16];
        hop[..JUMP_SIZE_64].copy_from_slice(&encode_jump(tail_addr));
        let hop_addr = hop.as_ptr() as usize;

        let resolved = unsafe { resolve_entry(hop_addr) };
        assert_eq!(resolved, tail_addr);

        // A non-jump entry resolves to itself.
        assert_eq!(unsafe { resolve_entry(tail_addr) }, tail_addr);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn return_buffer_size_classes() {
        let value = |size| TypeSig::ValueType {
            token: Token::new(0x0200_0001),
            size,
        };

        for size in [3, 5, 6, 7, 9, 12, 24] {
            assert!(needs_return_buffer(&value(size)), "size {size}");
        }
        for size in [1, 2, 4, 8] {
            assert!(!needs_return_buffer(&value(size)), "size {size}");
        }

        assert!(!needs_return_buffer(&TypeSig::I4));
        assert!(!needs_return_buffer(&TypeSig::Object));
        assert!(!needs_return_buffer(&TypeSig::Void));
    }
}
