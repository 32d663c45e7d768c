//! CIL opcode byte constants and the per-opcode dispatch table (ECMA-335).
//!
//! Single-byte opcodes are named after their mnemonic (e.g. [`CALL`] = `0x28`).
//! Two-byte opcodes that use the `0xFE` prefix have their second byte stored
//! with an `FE_` prefix (e.g. [`FE_CEQ`] = `0x01` for the `ceq` instruction
//! `0xFE 0x01`). The [`FE_PREFIX`] constant holds the shared first byte.
//!
//! [`INSTRUCTIONS`] and [`INSTRUCTIONS_FE`] map each opcode byte to its
//! [`OpSpec`]: mnemonic, operand shape and control-flow effect. The decoder
//! and encoder are entirely table-driven off these two arrays.
#![allow(missing_docs)]

use crate::assembly::instruction::{FlowType, OperandType};

// ── Single-byte opcodes (0x00 – 0xE0) ──────────────────────────────────────

// Misc
pub const NOP: u8 = 0x00;
pub const BREAK: u8 = 0x01;

// Load/store argument shorthand
pub const LDARG_0: u8 = 0x02;
pub const LDARG_1: u8 = 0x03;
pub const LDARG_2: u8 = 0x04;
pub const LDARG_3: u8 = 0x05;

// Load/store local shorthand
pub const LDLOC_0: u8 = 0x06;
pub const LDLOC_1: u8 = 0x07;
pub const LDLOC_2: u8 = 0x08;
pub const LDLOC_3: u8 = 0x09;
pub const STLOC_0: u8 = 0x0A;
pub const STLOC_1: u8 = 0x0B;
pub const STLOC_2: u8 = 0x0C;
pub const STLOC_3: u8 = 0x0D;

// Load/store argument/local (short form)
pub const LDARG_S: u8 = 0x0E;
pub const LDARGA_S: u8 = 0x0F;
pub const STARG_S: u8 = 0x10;
pub const LDLOC_S: u8 = 0x11;
pub const LDLOCA_S: u8 = 0x12;
pub const STLOC_S: u8 = 0x13;

// Null / constant loaders
pub const LDNULL: u8 = 0x14;
pub const LDC_I4_M1: u8 = 0x15;
pub const LDC_I4_0: u8 = 0x16;
pub const LDC_I4_1: u8 = 0x17;
pub const LDC_I4_2: u8 = 0x18;
pub const LDC_I4_3: u8 = 0x19;
pub const LDC_I4_4: u8 = 0x1A;
pub const LDC_I4_5: u8 = 0x1B;
pub const LDC_I4_6: u8 = 0x1C;
pub const LDC_I4_7: u8 = 0x1D;
pub const LDC_I4_8: u8 = 0x1E;
pub const LDC_I4_S: u8 = 0x1F;
pub const LDC_I4: u8 = 0x20;
pub const LDC_I8: u8 = 0x21;
pub const LDC_R4: u8 = 0x22;
pub const LDC_R8: u8 = 0x23;

// Stack manipulation
pub const DUP: u8 = 0x25;
pub const POP: u8 = 0x26;

// Call / return
pub const JMP: u8 = 0x27;
pub const CALL: u8 = 0x28;
pub const CALLI: u8 = 0x29;
pub const RET: u8 = 0x2A;

// Branch (short form)
pub const BR_S: u8 = 0x2B;
pub const BRFALSE_S: u8 = 0x2C;
pub const BRTRUE_S: u8 = 0x2D;
pub const BEQ_S: u8 = 0x2E;
pub const BGE_S: u8 = 0x2F;
pub const BGT_S: u8 = 0x30;
pub const BLE_S: u8 = 0x31;
pub const BLT_S: u8 = 0x32;
pub const BNE_UN_S: u8 = 0x33;
pub const BGE_UN_S: u8 = 0x34;
pub const BGT_UN_S: u8 = 0x35;
pub const BLE_UN_S: u8 = 0x36;
pub const BLT_UN_S: u8 = 0x37;

// Branch (long form)
pub const BR: u8 = 0x38;
pub const BRFALSE: u8 = 0x39;
pub const BRTRUE: u8 = 0x3A;
pub const BEQ: u8 = 0x3B;
pub const BGE: u8 = 0x3C;
pub const BGT: u8 = 0x3D;
pub const BLE: u8 = 0x3E;
pub const BLT: u8 = 0x3F;
pub const BNE_UN: u8 = 0x40;
pub const BGE_UN: u8 = 0x41;
pub const BGT_UN: u8 = 0x42;
pub const BLE_UN: u8 = 0x43;
pub const BLT_UN: u8 = 0x44;

// Switch
pub const SWITCH: u8 = 0x45;

// Indirect load (ldind.*)
pub const LDIND_I1: u8 = 0x46;
pub const LDIND_U1: u8 = 0x47;
pub const LDIND_I2: u8 = 0x48;
pub const LDIND_U2: u8 = 0x49;
pub const LDIND_I4: u8 = 0x4A;
pub const LDIND_U4: u8 = 0x4B;
pub const LDIND_I8: u8 = 0x4C;
pub const LDIND_I: u8 = 0x4D;
pub const LDIND_R4: u8 = 0x4E;
pub const LDIND_R8: u8 = 0x4F;
pub const LDIND_REF: u8 = 0x50;

// Indirect store (stind.*)
pub const STIND_REF: u8 = 0x51;
pub const STIND_I1: u8 = 0x52;
pub const STIND_I2: u8 = 0x53;
pub const STIND_I4: u8 = 0x54;
pub const STIND_I8: u8 = 0x55;
pub const STIND_R4: u8 = 0x56;
pub const STIND_R8: u8 = 0x57;

// Arithmetic
pub const ADD: u8 = 0x58;
pub const SUB: u8 = 0x59;
pub const MUL: u8 = 0x5A;
pub const DIV: u8 = 0x5B;
pub const DIV_UN: u8 = 0x5C;
pub const REM: u8 = 0x5D;
pub const REM_UN: u8 = 0x5E;

// Bitwise / logical
pub const AND: u8 = 0x5F;
pub const OR: u8 = 0x60;
pub const XOR: u8 = 0x61;
pub const SHL: u8 = 0x62;
pub const SHR: u8 = 0x63;
pub const SHR_UN: u8 = 0x64;
pub const NEG: u8 = 0x65;
pub const NOT: u8 = 0x66;

// Conversion
pub const CONV_I1: u8 = 0x67;
pub const CONV_I2: u8 = 0x68;
pub const CONV_I4: u8 = 0x69;
pub const CONV_I8: u8 = 0x6A;
pub const CONV_R4: u8 = 0x6B;
pub const CONV_R8: u8 = 0x6C;
pub const CONV_U4: u8 = 0x6D;
pub const CONV_U8: u8 = 0x6E;

// Virtual call / object model
pub const CALLVIRT: u8 = 0x6F;
pub const CPOBJ: u8 = 0x70;
pub const LDOBJ: u8 = 0x71;
pub const LDSTR: u8 = 0x72;
pub const NEWOBJ: u8 = 0x73;
pub const CASTCLASS: u8 = 0x74;
pub const ISINST: u8 = 0x75;
pub const CONV_R_UN: u8 = 0x76;

// Boxing / unboxing
pub const UNBOX: u8 = 0x79;

// Exception
pub const THROW: u8 = 0x7A;

// Field access
pub const LDFLD: u8 = 0x7B;
pub const LDFLDA: u8 = 0x7C;
pub const STFLD: u8 = 0x7D;
pub const LDSFLD: u8 = 0x7E;
pub const LDSFLDA: u8 = 0x7F;
pub const STSFLD: u8 = 0x80;

// Object store
pub const STOBJ: u8 = 0x81;

// Overflow conversion (unsigned source)
pub const CONV_OVF_I1_UN: u8 = 0x82;
pub const CONV_OVF_I2_UN: u8 = 0x83;
pub const CONV_OVF_I4_UN: u8 = 0x84;
pub const CONV_OVF_I8_UN: u8 = 0x85;
pub const CONV_OVF_U1_UN: u8 = 0x86;
pub const CONV_OVF_U2_UN: u8 = 0x87;
pub const CONV_OVF_U4_UN: u8 = 0x88;
pub const CONV_OVF_U8_UN: u8 = 0x89;
pub const CONV_OVF_I_UN: u8 = 0x8A;
pub const CONV_OVF_U_UN: u8 = 0x8B;

// Boxing / arrays
pub const BOX: u8 = 0x8C;
pub const NEWARR: u8 = 0x8D;
pub const LDLEN: u8 = 0x8E;
pub const LDELEMA: u8 = 0x8F;

// Array element load
pub const LDELEM_I1: u8 = 0x90;
pub const LDELEM_U1: u8 = 0x91;
pub const LDELEM_I2: u8 = 0x92;
pub const LDELEM_U2: u8 = 0x93;
pub const LDELEM_I4: u8 = 0x94;
pub const LDELEM_U4: u8 = 0x95;
pub const LDELEM_I8: u8 = 0x96;
pub const LDELEM_I: u8 = 0x97;
pub const LDELEM_R4: u8 = 0x98;
pub const LDELEM_R8: u8 = 0x99;
pub const LDELEM_REF: u8 = 0x9A;

// Array element store
pub const STELEM_I: u8 = 0x9B;
pub const STELEM_I1: u8 = 0x9C;
pub const STELEM_I2: u8 = 0x9D;
pub const STELEM_I4: u8 = 0x9E;
pub const STELEM_I8: u8 = 0x9F;
pub const STELEM_R4: u8 = 0xA0;
pub const STELEM_R8: u8 = 0xA1;
pub const STELEM_REF: u8 = 0xA2;

// Generic array element access
pub const LDELEM: u8 = 0xA3;
pub const STELEM: u8 = 0xA4;
pub const UNBOX_ANY: u8 = 0xA5;

// Overflow conversion (signed source)
pub const CONV_OVF_I1: u8 = 0xB3;
pub const CONV_OVF_U1: u8 = 0xB4;
pub const CONV_OVF_I2: u8 = 0xB5;
pub const CONV_OVF_U2: u8 = 0xB6;
pub const CONV_OVF_I4: u8 = 0xB7;
pub const CONV_OVF_U4: u8 = 0xB8;
pub const CONV_OVF_I8: u8 = 0xB9;
pub const CONV_OVF_U8: u8 = 0xBA;

// Typed reference
pub const REFANYVAL: u8 = 0xC2;
pub const CKFINITE: u8 = 0xC3;
pub const MKREFANY: u8 = 0xC6;

// Token / conversion
pub const LDTOKEN: u8 = 0xD0;
pub const CONV_U2: u8 = 0xD1;
pub const CONV_U1: u8 = 0xD2;
pub const CONV_I: u8 = 0xD3;
pub const CONV_OVF_I: u8 = 0xD4;
pub const CONV_OVF_U: u8 = 0xD5;

// Overflow arithmetic
pub const ADD_OVF: u8 = 0xD6;
pub const ADD_OVF_UN: u8 = 0xD7;
pub const MUL_OVF: u8 = 0xD8;
pub const MUL_OVF_UN: u8 = 0xD9;
pub const SUB_OVF: u8 = 0xDA;
pub const SUB_OVF_UN: u8 = 0xDB;

// Exception handling
pub const ENDFINALLY: u8 = 0xDC;
pub const LEAVE: u8 = 0xDD;
pub const LEAVE_S: u8 = 0xDE;

// Indirect store / conversion
pub const STIND_I: u8 = 0xDF;
pub const CONV_U: u8 = 0xE0;

// ── Two-byte opcodes (0xFE prefix) ─────────────────────────────────────────
//
// The first byte is always FE_PREFIX; the constants below are the second byte.

pub const FE_PREFIX: u8 = 0xFE;

pub const FE_ARGLIST: u8 = 0x00;
pub const FE_CEQ: u8 = 0x01;
pub const FE_CGT: u8 = 0x02;
pub const FE_CGT_UN: u8 = 0x03;
pub const FE_CLT: u8 = 0x04;
pub const FE_CLT_UN: u8 = 0x05;
pub const FE_LDFTN: u8 = 0x06;
pub const FE_LDVIRTFTN: u8 = 0x07;
pub const FE_LDARG: u8 = 0x09;
pub const FE_LDARGA: u8 = 0x0A;
pub const FE_STARG: u8 = 0x0B;
pub const FE_LDLOC: u8 = 0x0C;
pub const FE_LDLOCA: u8 = 0x0D;
pub const FE_STLOC: u8 = 0x0E;
pub const FE_LOCALLOC: u8 = 0x0F;
pub const FE_ENDFILTER: u8 = 0x11;
pub const FE_UNALIGNED: u8 = 0x12;
pub const FE_VOLATILE: u8 = 0x13;
pub const FE_TAIL: u8 = 0x14;
pub const FE_INITOBJ: u8 = 0x15;
pub const FE_CONSTRAINED: u8 = 0x16;
pub const FE_CPBLK: u8 = 0x17;
pub const FE_INITBLK: u8 = 0x18;
pub const FE_RETHROW: u8 = 0x1A;
pub const FE_SIZEOF: u8 = 0x1C;
pub const FE_REFANYTYPE: u8 = 0x1D;
pub const FE_READONLY: u8 = 0x1E;

// ── Dispatch tables ────────────────────────────────────────────────────────

/// Static description of one opcode: mnemonic, operand shape, flow effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSpec {
    /// Canonical lower-case mnemonic
    pub mnemonic: &'static str,
    /// Shape of the encoded operand that follows the opcode byte(s)
    pub operand: OperandType,
    /// Effect on control flow
    pub flow: FlowType,
}

impl OpSpec {
    const fn new(mnemonic: &'static str, operand: OperandType, flow: FlowType) -> Self {
        OpSpec {
            mnemonic,
            operand,
            flow,
        }
    }
}

macro_rules! fill_table {
    ($table:ident, { $($op:expr => ($mn:literal, $operand:ident, $flow:ident);)* }) => {
        $(
            $table[($op) as usize] = Some(OpSpec::new($mn, OperandType::$operand, FlowType::$flow));
        )*
    };
}

const fn single_byte_table() -> [Option<OpSpec>; 256] {
    let mut t: [Option<OpSpec>; 256] = [None; 256];
    fill_table!(t, {
        NOP => ("nop", None, Sequential);
        BREAK => ("break", None, Sequential);
        LDARG_0 => ("ldarg.0", None, Sequential);
        LDARG_1 => ("ldarg.1", None, Sequential);
        LDARG_2 => ("ldarg.2", None, Sequential);
        LDARG_3 => ("ldarg.3", None, Sequential);
        LDLOC_0 => ("ldloc.0", None, Sequential);
        LDLOC_1 => ("ldloc.1", None, Sequential);
        LDLOC_2 => ("ldloc.2", None, Sequential);
        LDLOC_3 => ("ldloc.3", None, Sequential);
        STLOC_0 => ("stloc.0", None, Sequential);
        STLOC_1 => ("stloc.1", None, Sequential);
        STLOC_2 => ("stloc.2", None, Sequential);
        STLOC_3 => ("stloc.3", None, Sequential);
        LDARG_S => ("ldarg.s", UInt8, Sequential);
        LDARGA_S => ("ldarga.s", UInt8, Sequential);
        STARG_S => ("starg.s", UInt8, Sequential);
        LDLOC_S => ("ldloc.s", UInt8, Sequential);
        LDLOCA_S => ("ldloca.s", UInt8, Sequential);
        STLOC_S => ("stloc.s", UInt8, Sequential);
        LDNULL => ("ldnull", None, Sequential);
        LDC_I4_M1 => ("ldc.i4.m1", None, Sequential);
        LDC_I4_0 => ("ldc.i4.0", None, Sequential);
        LDC_I4_1 => ("ldc.i4.1", None, Sequential);
        LDC_I4_2 => ("ldc.i4.2", None, Sequential);
        LDC_I4_3 => ("ldc.i4.3", None, Sequential);
        LDC_I4_4 => ("ldc.i4.4", None, Sequential);
        LDC_I4_5 => ("ldc.i4.5", None, Sequential);
        LDC_I4_6 => ("ldc.i4.6", None, Sequential);
        LDC_I4_7 => ("ldc.i4.7", None, Sequential);
        LDC_I4_8 => ("ldc.i4.8", None, Sequential);
        LDC_I4_S => ("ldc.i4.s", Int8, Sequential);
        LDC_I4 => ("ldc.i4", Int32, Sequential);
        LDC_I8 => ("ldc.i8", Int64, Sequential);
        LDC_R4 => ("ldc.r4", Float32, Sequential);
        LDC_R8 => ("ldc.r8", Float64, Sequential);
        DUP => ("dup", None, Sequential);
        POP => ("pop", None, Sequential);
        JMP => ("jmp", Token, Call);
        CALL => ("call", Token, Call);
        CALLI => ("calli", Token, Call);
        RET => ("ret", None, Return);
        BR_S => ("br.s", Int8, UnconditionalBranch);
        BRFALSE_S => ("brfalse.s", Int8, ConditionalBranch);
        BRTRUE_S => ("brtrue.s", Int8, ConditionalBranch);
        BEQ_S => ("beq.s", Int8, ConditionalBranch);
        BGE_S => ("bge.s", Int8, ConditionalBranch);
        BGT_S => ("bgt.s", Int8, ConditionalBranch);
        BLE_S => ("ble.s", Int8, ConditionalBranch);
        BLT_S => ("blt.s", Int8, ConditionalBranch);
        BNE_UN_S => ("bne.un.s", Int8, ConditionalBranch);
        BGE_UN_S => ("bge.un.s", Int8, ConditionalBranch);
        BGT_UN_S => ("bgt.un.s", Int8, ConditionalBranch);
        BLE_UN_S => ("ble.un.s", Int8, ConditionalBranch);
        BLT_UN_S => ("blt.un.s", Int8, ConditionalBranch);
        BR => ("br", Int32, UnconditionalBranch);
        BRFALSE => ("brfalse", Int32, ConditionalBranch);
        BRTRUE => ("brtrue", Int32, ConditionalBranch);
        BEQ => ("beq", Int32, ConditionalBranch);
        BGE => ("bge", Int32, ConditionalBranch);
        BGT => ("bgt", Int32, ConditionalBranch);
        BLE => ("ble", Int32, ConditionalBranch);
        BLT => ("blt", Int32, ConditionalBranch);
        BNE_UN => ("bne.un", Int32, ConditionalBranch);
        BGE_UN => ("bge.un", Int32, ConditionalBranch);
        BGT_UN => ("bgt.un", Int32, ConditionalBranch);
        BLE_UN => ("ble.un", Int32, ConditionalBranch);
        BLT_UN => ("blt.un", Int32, ConditionalBranch);
        SWITCH => ("switch", Switch, Switch);
        LDIND_I1 => ("ldind.i1", None, Sequential);
        LDIND_U1 => ("ldind.u1", None, Sequential);
        LDIND_I2 => ("ldind.i2", None, Sequential);
        LDIND_U2 => ("ldind.u2", None, Sequential);
        LDIND_I4 => ("ldind.i4", None, Sequential);
        LDIND_U4 => ("ldind.u4", None, Sequential);
        LDIND_I8 => ("ldind.i8", None, Sequential);
        LDIND_I => ("ldind.i", None, Sequential);
        LDIND_R4 => ("ldind.r4", None, Sequential);
        LDIND_R8 => ("ldind.r8", None, Sequential);
        LDIND_REF => ("ldind.ref", None, Sequential);
        STIND_REF => ("stind.ref", None, Sequential);
        STIND_I1 => ("stind.i1", None, Sequential);
        STIND_I2 => ("stind.i2", None, Sequential);
        STIND_I4 => ("stind.i4", None, Sequential);
        STIND_I8 => ("stind.i8", None, Sequential);
        STIND_R4 => ("stind.r4", None, Sequential);
        STIND_R8 => ("stind.r8", None, Sequential);
        ADD => ("add", None, Sequential);
        SUB => ("sub", None, Sequential);
        MUL => ("mul", None, Sequential);
        DIV => ("div", None, Sequential);
        DIV_UN => ("div.un", None, Sequential);
        REM => ("rem", None, Sequential);
        REM_UN => ("rem.un", None, Sequential);
        AND => ("and", None, Sequential);
        OR => ("or", None, Sequential);
        XOR => ("xor", None, Sequential);
        SHL => ("shl", None, Sequential);
        SHR => ("shr", None, Sequential);
        SHR_UN => ("shr.un", None, Sequential);
        NEG => ("neg", None, Sequential);
        NOT => ("not", None, Sequential);
        CONV_I1 => ("conv.i1", None, Sequential);
        CONV_I2 => ("conv.i2", None, Sequential);
        CONV_I4 => ("conv.i4", None, Sequential);
        CONV_I8 => ("conv.i8", None, Sequential);
        CONV_R4 => ("conv.r4", None, Sequential);
        CONV_R8 => ("conv.r8", None, Sequential);
        CONV_U4 => ("conv.u4", None, Sequential);
        CONV_U8 => ("conv.u8", None, Sequential);
        CALLVIRT => ("callvirt", Token, Call);
        CPOBJ => ("cpobj", Token, Sequential);
        LDOBJ => ("ldobj", Token, Sequential);
        LDSTR => ("ldstr", Token, Sequential);
        NEWOBJ => ("newobj", Token, Call);
        CASTCLASS => ("castclass", Token, Sequential);
        ISINST => ("isinst", Token, Sequential);
        CONV_R_UN => ("conv.r.un", None, Sequential);
        UNBOX => ("unbox", Token, Sequential);
        THROW => ("throw", None, Throw);
        LDFLD => ("ldfld", Token, Sequential);
        LDFLDA => ("ldflda", Token, Sequential);
        STFLD => ("stfld", Token, Sequential);
        LDSFLD => ("ldsfld", Token, Sequential);
        LDSFLDA => ("ldsflda", Token, Sequential);
        STSFLD => ("stsfld", Token, Sequential);
        STOBJ => ("stobj", Token, Sequential);
        CONV_OVF_I1_UN => ("conv.ovf.i1.un", None, Sequential);
        CONV_OVF_I2_UN => ("conv.ovf.i2.un", None, Sequential);
        CONV_OVF_I4_UN => ("conv.ovf.i4.un", None, Sequential);
        CONV_OVF_I8_UN => ("conv.ovf.i8.un", None, Sequential);
        CONV_OVF_U1_UN => ("conv.ovf.u1.un", None, Sequential);
        CONV_OVF_U2_UN => ("conv.ovf.u2.un", None, Sequential);
        CONV_OVF_U4_UN => ("conv.ovf.u4.un", None, Sequential);
        CONV_OVF_U8_UN => ("conv.ovf.u8.un", None, Sequential);
        CONV_OVF_I_UN => ("conv.ovf.i.un", None, Sequential);
        CONV_OVF_U_UN => ("conv.ovf.u.un", None, Sequential);
        BOX => ("box", Token, Sequential);
        NEWARR => ("newarr", Token, Sequential);
        LDLEN => ("ldlen", None, Sequential);
        LDELEMA => ("ldelema", Token, Sequential);
        LDELEM_I1 => ("ldelem.i1", None, Sequential);
        LDELEM_U1 => ("ldelem.u1", None, Sequential);
        LDELEM_I2 => ("ldelem.i2", None, Sequential);
        LDELEM_U2 => ("ldelem.u2", None, Sequential);
        LDELEM_I4 => ("ldelem.i4", None, Sequential);
        LDELEM_U4 => ("ldelem.u4", None, Sequential);
        LDELEM_I8 => ("ldelem.i8", None, Sequential);
        LDELEM_I => ("ldelem.i", None, Sequential);
        LDELEM_R4 => ("ldelem.r4", None, Sequential);
        LDELEM_R8 => ("ldelem.r8", None, Sequential);
        LDELEM_REF => ("ldelem.ref", None, Sequential);
        STELEM_I => ("stelem.i", None, Sequential);
        STELEM_I1 => ("stelem.i1", None, Sequential);
        STELEM_I2 => ("stelem.i2", None, Sequential);
        STELEM_I4 => ("stelem.i4", None, Sequential);
        STELEM_I8 => ("stelem.i8", None, Sequential);
        STELEM_R4 => ("stelem.r4", None, Sequential);
        STELEM_R8 => ("stelem.r8", None, Sequential);
        STELEM_REF => ("stelem.ref", None, Sequential);
        LDELEM => ("ldelem", Token, Sequential);
        STELEM => ("stelem", Token, Sequential);
        UNBOX_ANY => ("unbox.any", Token, Sequential);
        CONV_OVF_I1 => ("conv.ovf.i1", None, Sequential);
        CONV_OVF_U1 => ("conv.ovf.u1", None, Sequential);
        CONV_OVF_I2 => ("conv.ovf.i2", None, Sequential);
        CONV_OVF_U2 => ("conv.ovf.u2", None, Sequential);
        CONV_OVF_I4 => ("conv.ovf.i4", None, Sequential);
        CONV_OVF_U4 => ("conv.ovf.u4", None, Sequential);
        CONV_OVF_I8 => ("conv.ovf.i8", None, Sequential);
        CONV_OVF_U8 => ("conv.ovf.u8", None, Sequential);
        REFANYVAL => ("refanyval", Token, Sequential);
        CKFINITE => ("ckfinite", None, Sequential);
        MKREFANY => ("mkrefany", Token, Sequential);
        LDTOKEN => ("ldtoken", Token, Sequential);
        CONV_U2 => ("conv.u2", None, Sequential);
        CONV_U1 => ("conv.u1", None, Sequential);
        CONV_I => ("conv.i", None, Sequential);
        CONV_OVF_I => ("conv.ovf.i", None, Sequential);
        CONV_OVF_U => ("conv.ovf.u", None, Sequential);
        ADD_OVF => ("add.ovf", None, Sequential);
        ADD_OVF_UN => ("add.ovf.un", None, Sequential);
        MUL_OVF => ("mul.ovf", None, Sequential);
        MUL_OVF_UN => ("mul.ovf.un", None, Sequential);
        SUB_OVF => ("sub.ovf", None, Sequential);
        SUB_OVF_UN => ("sub.ovf.un", None, Sequential);
        ENDFINALLY => ("endfinally", None, EndFinally);
        LEAVE => ("leave", Int32, Leave);
        LEAVE_S => ("leave.s", Int8, Leave);
        STIND_I => ("stind.i", None, Sequential);
        CONV_U => ("conv.u", None, Sequential);
    });
    t
}

const fn two_byte_table() -> [Option<OpSpec>; 256] {
    let mut t: [Option<OpSpec>; 256] = [None; 256];
    fill_table!(t, {
        FE_ARGLIST => ("arglist", None, Sequential);
        FE_CEQ => ("ceq", None, Sequential);
        FE_CGT => ("cgt", None, Sequential);
        FE_CGT_UN => ("cgt.un", None, Sequential);
        FE_CLT => ("clt", None, Sequential);
        FE_CLT_UN => ("clt.un", None, Sequential);
        FE_LDFTN => ("ldftn", Token, Sequential);
        FE_LDVIRTFTN => ("ldvirtftn", Token, Sequential);
        FE_LDARG => ("ldarg", UInt16, Sequential);
        FE_LDARGA => ("ldarga", UInt16, Sequential);
        FE_STARG => ("starg", UInt16, Sequential);
        FE_LDLOC => ("ldloc", UInt16, Sequential);
        FE_LDLOCA => ("ldloca", UInt16, Sequential);
        FE_STLOC => ("stloc", UInt16, Sequential);
        FE_LOCALLOC => ("localloc", None, Sequential);
        FE_ENDFILTER => ("endfilter", None, EndFilter);
        FE_UNALIGNED => ("unaligned.", UInt8, Sequential);
        FE_VOLATILE => ("volatile.", None, Sequential);
        FE_TAIL => ("tail.", None, Sequential);
        FE_INITOBJ => ("initobj", Token, Sequential);
        FE_CONSTRAINED => ("constrained.", Token, Sequential);
        FE_CPBLK => ("cpblk", None, Sequential);
        FE_INITBLK => ("initblk", None, Sequential);
        FE_RETHROW => ("rethrow", None, Throw);
        FE_SIZEOF => ("sizeof", Token, Sequential);
        FE_REFANYTYPE => ("refanytype", None, Sequential);
        FE_READONLY => ("readonly.", None, Sequential);
    });
    t
}

/// Dispatch table for single-byte opcodes, indexed by the opcode byte.
pub static INSTRUCTIONS: [Option<OpSpec>; 256] = single_byte_table();

/// Dispatch table for `0xFE`-prefixed opcodes, indexed by the second byte.
pub static INSTRUCTIONS_FE: [Option<OpSpec>; 256] = two_byte_table();

/// Looks up the [`OpSpec`] for an opcode, given its prefix byte (`0` or
/// [`FE_PREFIX`]) and opcode byte.
#[must_use]
pub fn lookup(prefix: u8, opcode: u8) -> Option<&'static OpSpec> {
    let table = if prefix == FE_PREFIX {
        &INSTRUCTIONS_FE
    } else {
        &INSTRUCTIONS
    };
    table[opcode as usize].as_ref()
}

/// The long form of a short branch opcode, `None` for anything else.
///
/// The short conditional and unconditional branches occupy `0x2B..=0x37` and
/// sit exactly `0x0D` below their long forms; `leave.s` is the one outlier.
#[must_use]
pub fn long_branch_form(opcode: u8) -> Option<u8> {
    match opcode {
        BR_S..=BLT_UN_S => Some(opcode + 0x0D),
        LEAVE_S => Some(LEAVE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_single_byte() {
        let spec = lookup(0, CALL).unwrap();
        assert_eq!(spec.mnemonic, "call");
        assert_eq!(spec.operand, OperandType::Token);
        assert_eq!(spec.flow, FlowType::Call);

        assert!(lookup(0, 0x24).is_none());
        assert!(lookup(0, 0xE1).is_none());
    }

    #[test]
    fn lookup_two_byte() {
        let spec = lookup(FE_PREFIX, FE_CEQ).unwrap();
        assert_eq!(spec.mnemonic, "ceq");

        let ldarg = lookup(FE_PREFIX, FE_LDARG).unwrap();
        assert_eq!(ldarg.operand, OperandType::UInt16);

        assert!(lookup(FE_PREFIX, 0x08).is_none());
    }

    #[test]
    fn branch_widening_pairs() {
        assert_eq!(long_branch_form(BR_S), Some(BR));
        assert_eq!(long_branch_form(BRFALSE_S), Some(BRFALSE));
        assert_eq!(long_branch_form(BLT_UN_S), Some(BLT_UN));
        assert_eq!(long_branch_form(LEAVE_S), Some(LEAVE));
        assert_eq!(long_branch_form(BR), None);
        assert_eq!(long_branch_form(CALL), None);
    }

    #[test]
    fn widened_mnemonics_match() {
        for short in BR_S..=BLT_UN_S {
            let long = long_branch_form(short).unwrap();
            let short_spec = lookup(0, short).unwrap();
            let long_spec = lookup(0, long).unwrap();
            assert_eq!(
                short_spec.mnemonic.trim_end_matches(".s"),
                long_spec.mnemonic
            );
            assert_eq!(short_spec.flow, long_spec.flow);
        }
    }
}
