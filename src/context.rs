//! The process-wide patching context.
//!
//! [`PatchContext`] owns everything global: the trait seams to the runtime
//! and the per-function installation state. All pipeline entry points hang
//! off it; there is no ambient singleton.
//!
//! # Architecture
//!
//! [`PatchContext::apply`] runs the whole pipeline for one function:
//!
//! 1. decode the original body through the resolver,
//! 2. sort each patch role (cached per function, invalidated when the
//!    registrations change structurally),
//! 3. run the transpiler chain,
//! 4. synthesize and encode the replacement body,
//! 5. materialize it through the code generator, and
//! 6. install the native detour from the original entry.
//!
//! The run is all-or-nothing: any error before step 6 leaves the process
//! untouched. Re-applying always restarts from the original decoded body
//! with the new full set; reverting a patch means applying the reduced set.
//!
//! # Thread Safety
//!
//! Per-function state lives in a [`DashMap`]; an apply holds the function's
//! entry for its whole run, so concurrent applies to the same function
//! serialize while different functions proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::assembly::decoder::decode_body;
use crate::assembly::{InstrId, Instruction, LabelGen};
use crate::detour;
use crate::metadata::{CodeGenerator, FunctionId, PatchStateStore, SymbolResolver};
use crate::patch::{PatchDescriptor, PatchImpl, PatchSet, PatchSorter};
use crate::synthesizer::{synthesize, SynthesisConfig};
use crate::transpiler::{run_chain, TranspileContext, TranspilerPass};
use crate::Result;

/// What a successful apply hands back.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// Native entry address of the materialized replacement
    pub replacement: usize,
    /// Final stream index of every instruction identity that survived,
    /// including the original body's decoded instructions
    pub instruction_map: HashMap<InstrId, usize>,
    /// Dependency edges the sorters had to break, one message per edge
    pub diagnostics: Vec<String>,
}

/// Cached per-function state: one sorter per role plus the last install.
#[derive(Default)]
struct FunctionState {
    prefixes: Option<PatchSorter>,
    postfixes: Option<PatchSorter>,
    finalizers: Option<PatchSorter>,
    transpilers: Option<PatchSorter>,
    replacement: Option<usize>,
}

/// The owner of all patching state and the three public entry points.
pub struct PatchContext {
    resolver: Arc<dyn SymbolResolver>,
    generator: Arc<dyn CodeGenerator>,
    store: Option<Arc<dyn PatchStateStore>>,
    state: DashMap<FunctionId, FunctionState>,
}

impl PatchContext {
    /// Create a context over the runtime's resolver and code generator.
    #[must_use]
    pub fn new(resolver: Arc<dyn SymbolResolver>, generator: Arc<dyn CodeGenerator>) -> Self {
        PatchContext {
            resolver,
            generator,
            store: None,
            state: DashMap::new(),
        }
    }

    /// Attach an opaque version store so repeated runs can skip functions
    /// that are already patched to the caller's current version.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn PatchStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Compose `set` against `id` and install the resulting detour.
    ///
    /// # Errors
    /// Any decode, configuration, materialization or installation error
    /// aborts the run with nothing installed.
    pub fn apply(&self, id: &FunctionId, set: &PatchSet) -> Result<ApplyOutcome> {
        let mut entry = self.state.entry(id.clone()).or_default();
        self.run_pipeline(id, set, &mut entry)
    }

    /// Like [`PatchContext::apply`], but skips the run entirely when the
    /// store already records `version` for this function. Returns `None`
    /// when skipped.
    ///
    /// # Errors
    /// Same failure modes as [`PatchContext::apply`].
    pub fn apply_versioned(
        &self,
        id: &FunctionId,
        set: &PatchSet,
        version: &[u8],
    ) -> Result<Option<ApplyOutcome>> {
        let mut entry = self.state.entry(id.clone()).or_default();

        if let Some(store) = &self.store {
            if store.load(id).as_deref() == Some(version) {
                return Ok(None);
            }
        }

        let outcome = self.run_pipeline(id, set, &mut entry)?;
        if let Some(store) = &self.store {
            store.store(id, version);
        }
        Ok(Some(outcome))
    }

    /// Decode `id`'s body into the editable stream without installing
    /// anything.
    ///
    /// # Errors
    /// Returns the resolver's error for an unknown function or
    /// [`crate::Error::Malformed`] for a damaged body.
    pub fn decode(&self, id: &FunctionId) -> Result<Vec<Instruction>> {
        let sig = self.resolver.signature(id)?;
        let body = self.resolver.body(id)?;
        let mut labels = LabelGen::new();
        decode_body(id, &sig, &body, self.resolver.as_ref(), &mut labels)
    }

    /// Install a raw detour between two native addresses, bypassing the
    /// composition pipeline entirely.
    ///
    /// # Errors
    /// Returns [`crate::Error::Install`] when the target page cannot be
    /// made writable.
    ///
    /// # Safety
    /// Same contract as [`detour::install`]: `original` must be a patchable
    /// compiled entry and `replacement` readable memory.
    pub unsafe fn detour(&self, original: usize, replacement: usize) -> Result<()> {
        unsafe { detour::install(original, replacement) }
    }

    /// The replacement entry last installed for `id`, if any.
    #[must_use]
    pub fn replacement(&self, id: &FunctionId) -> Option<usize> {
        self.state.get(id).and_then(|entry| entry.replacement)
    }

    fn run_pipeline(
        &self,
        id: &FunctionId,
        set: &PatchSet,
        entry: &mut FunctionState,
    ) -> Result<ApplyOutcome> {
        let sig = self.resolver.signature(id)?;
        let body = self.resolver.body(id)?;

        let mut labels = LabelGen::new();
        let decoded = decode_body(id, &sig, &body, self.resolver.as_ref(), &mut labels)?;

        let mut diagnostics = Vec::new();
        let prefixes = sorted_role(&mut entry.prefixes, &set.prefixes, &mut diagnostics);
        let postfixes = sorted_role(&mut entry.postfixes, &set.postfixes, &mut diagnostics);
        let finalizers = sorted_role(&mut entry.finalizers, &set.finalizers, &mut diagnostics);
        let transpilers = sorted_role(&mut entry.transpilers, &set.transpilers, &mut diagnostics);

        let passes: Vec<Arc<dyn TranspilerPass>> = transpilers
            .iter()
            .filter_map(|descriptor| match &descriptor.implementation {
                PatchImpl::Transpiler(pass) => Some(Arc::clone(pass)),
                PatchImpl::Hook(_) => None,
            })
            .collect();

        let mut ctx = TranspileContext {
            function: id,
            labels: &mut labels,
        };
        let transpiled = run_chain(&mut ctx, &passes, decoded)?;

        let config = SynthesisConfig {
            function: id.clone(),
            signature: sig.clone(),
            prefixes,
            postfixes,
            finalizers,
            return_buffer: detour::needs_return_buffer(&sig.return_type),
        };
        let synthesized = synthesize(&config, transpiled, &body, self.resolver.as_ref(), &mut labels)?;

        let replacement = self
            .generator
            .materialize(id, &sig, &synthesized.body)?;
        let original_entry = self.resolver.native_entry(id)?;

        // The point of no return; everything above was side-effect free.
        unsafe {
            detour::install(original_entry, replacement)?;
        }
        entry.replacement = Some(replacement);

        Ok(ApplyOutcome {
            replacement,
            instruction_map: synthesized.instruction_map,
            diagnostics,
        })
    }
}

/// Sort one role's array, reusing the cached sorter when the registrations
/// are structurally unchanged.
fn sorted_role(
    slot: &mut Option<PatchSorter>,
    patches: &[PatchDescriptor],
    diagnostics: &mut Vec<String>,
) -> Vec<PatchDescriptor> {
    let sorter = match slot {
        Some(existing) if existing.matches(patches) => existing,
        _ => slot.insert(PatchSorter::new(patches)),
    };

    let sorted = sorter.sort();
    diagnostics.extend_from_slice(sorter.diagnostics());
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::opcodes;
    use crate::metadata::{
        FunctionBody, FunctionSig, MemberHandle, Token, TypeSig,
    };
    use crate::patch::{HookMethod, PatchRole};

    struct TestResolver {
        entry: usize,
    }

    impl SymbolResolver for TestResolver {
        fn signature(&self, _id: &FunctionId) -> Result<FunctionSig> {
            Ok(FunctionSig {
                has_this: false,
                params: vec![],
                return_type: TypeSig::Void,
            })
        }
        fn body(&self, _id: &FunctionId) -> Result<FunctionBody> {
            Ok(FunctionBody {
                code: vec![opcodes::NOP, opcodes::RET],
                locals: vec![],
                exceptions: vec![],
                max_stack: 1,
            })
        }
        fn user_string(&self, _token: Token) -> Result<String> {
            Ok(String::new())
        }
        fn member(&self, _token: Token) -> Option<MemberHandle> {
            None
        }
        fn extern_stub(&self, _id: &FunctionId) -> Result<Token> {
            Ok(Token::new(0x0A00_00FF))
        }
        fn native_entry(&self, _id: &FunctionId) -> Result<usize> {
            Ok(self.entry)
        }
    }

    struct TestGenerator {
        entry: usize,
    }

    impl CodeGenerator for TestGenerator {
        fn materialize(
            &self,
            _id: &FunctionId,
            _sig: &FunctionSig,
            body: &FunctionBody,
        ) -> Result<usize> {
            assert!(!body.code.is_empty());
            Ok(self.entry)
        }
    }

    struct MemStore {
        blobs: DashMap<FunctionId, Vec<u8>>,
    }

    impl PatchStateStore for MemStore {
        fn load(&self, id: &FunctionId) -> Option<Vec<u8>> {
            self.blobs.get(id).map(|b| b.value().clone())
        }
        fn store(&self, id: &FunctionId, blob: &[u8]) {
            self.blobs.insert(id.clone(), blob.to_vec());
        }
    }

    fn scratch_buffer() -> usize {
        Box::leak(vec![0u8; 64].into_boxed_slice()).as_mut_ptr() as usize
    }

    fn target() -> FunctionId {
        FunctionId::new(Token::new(0x0600_0001), "Demo::Target")
    }

    fn context() -> (PatchContext, usize, usize) {
        let original = scratch_buffer();
        let replacement = scratch_buffer();
        let context = PatchContext::new(
            Arc::new(TestResolver { entry: original }),
            Arc::new(TestGenerator { entry: replacement }),
        );
        (context, original, replacement)
    }

    fn prefix_set() -> PatchSet {
        let mut set = PatchSet::new();
        set.add(PatchDescriptor::hook(
            "mod.a",
            0,
            PatchRole::Prefix,
            HookMethod {
                token: Token::new(0x0A00_0001),
                params: vec![],
                return_type: TypeSig::Void,
            },
        ));
        set
    }

    #[test]
    fn decode_only_installs_nothing() {
        let (context, original, _) = context();
        let decoded = context.decode(&target()).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].opcode, opcodes::RET);

        let untouched = unsafe { std::slice::from_raw_parts(original as *const u8, 4) };
        assert_eq!(untouched, &[0, 0, 0, 0]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn apply_installs_a_jump_to_the_replacement() {
        let (context, original, replacement) = context();
        let outcome = context.apply(&target(), &prefix_set()).unwrap();

        assert_eq!(outcome.replacement, replacement);
        assert!(outcome.diagnostics.is_empty());
        assert!(!outcome.instruction_map.is_empty());
        assert_eq!(context.replacement(&target()), Some(replacement));

        let written =
            unsafe { std::slice::from_raw_parts(original as *const u8, detour::JUMP_SIZE_64) };
        assert_eq!(crate::detour::peek_jump(original, written), Some(replacement));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn versioned_apply_skips_when_current() {
        let (context, _, _) = context();
        let context = context.with_store(Arc::new(MemStore {
            blobs: DashMap::new(),
        }));

        let first = context
            .apply_versioned(&target(), &prefix_set(), b"v1")
            .unwrap();
        assert!(first.is_some());

        let second = context
            .apply_versioned(&target(), &prefix_set(), b"v1")
            .unwrap();
        assert!(second.is_none());

        let upgraded = context
            .apply_versioned(&target(), &prefix_set(), b"v2")
            .unwrap();
        assert!(upgraded.is_some());
    }
}
