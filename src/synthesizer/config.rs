//! Per-run synthesis inputs and local-slot bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use crate::metadata::{FunctionId, FunctionSig, TypeSig};
use crate::patch::{ParamBinding, PatchDescriptor};

/// Everything one synthesis run needs to know up front: the target function,
/// its signature, the three hook arrays in execution order, and whether the
/// target uses the hidden return-buffer convention.
///
/// Built by the context from the sorted patch set and discarded after
/// materialization.
#[derive(Debug)]
pub struct SynthesisConfig {
    /// The function being replaced
    pub function: FunctionId,
    /// Its calling signature
    pub signature: FunctionSig,
    /// Prefix hooks in execution order
    pub prefixes: Vec<PatchDescriptor>,
    /// Postfix hooks in execution order
    pub postfixes: Vec<PatchDescriptor>,
    /// Finalizer hooks in execution order
    pub finalizers: Vec<PatchDescriptor>,
    /// `true` when a hidden leading pointer carries the return value, which
    /// shifts every declared argument slot up by one
    pub return_buffer: bool,
}

impl SynthesisConfig {
    /// `true` if any hook in any role declares a parameter with `binding`.
    #[must_use]
    pub fn any_binding(&self, binding: ParamBinding) -> bool {
        self.hooks()
            .any(|(_, hook)| hook.has_binding(binding))
    }

    /// All hooks across the three roles, paired with their owners.
    pub(crate) fn hooks(
        &self,
    ) -> impl Iterator<Item = (&Arc<str>, &crate::patch::HookMethod)> {
        self.prefixes
            .iter()
            .chain(&self.postfixes)
            .chain(&self.finalizers)
            .filter_map(|d| d.hook_method().map(|h| (&d.owner, h)))
    }
}

/// The synthesized locals a replacement body adds behind the original's own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalKind {
    /// Current result value of the original's return type
    Result,
    /// Boxed snapshot of the declared arguments
    ArgsArray,
    /// Whether the original body should still run
    RunOriginal,
    /// Whether the finalizers have already run
    Finalized,
    /// The captured or replacement exception
    Exception,
    /// Shared state of one owner
    State(Arc<str>),
}

/// Allocates synthesized local slots after the original's declared locals.
///
/// Allocation is idempotent per kind: asking twice returns the same slot.
#[derive(Debug)]
pub struct LocalTable {
    base: u16,
    types: Vec<TypeSig>,
    slots: HashMap<LocalKind, u16>,
}

impl LocalTable {
    /// Start a table whose slots begin after `original` locals.
    #[must_use]
    pub fn new(original: &[TypeSig]) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        LocalTable {
            base: original.len() as u16,
            types: Vec::new(),
            slots: HashMap::new(),
        }
    }

    /// The slot for `kind`, allocating it with type `ty` on first use.
    pub fn allocate(&mut self, kind: LocalKind, ty: TypeSig) -> u16 {
        if let Some(&slot) = self.slots.get(&kind) {
            return slot;
        }
        #[allow(clippy::cast_possible_truncation)]
        let slot = self.base + self.types.len() as u16;
        self.types.push(ty);
        self.slots.insert(kind, slot);
        slot
    }

    /// The slot for `kind`, if it was allocated.
    #[must_use]
    pub fn get(&self, kind: &LocalKind) -> Option<u16> {
        self.slots.get(kind).copied()
    }

    /// The original local table extended with the synthesized slots.
    #[must_use]
    pub fn into_locals(self, mut original: Vec<TypeSig>) -> Vec<TypeSig> {
        original.extend(self.types);
        original
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_idempotent() {
        let original = vec![TypeSig::I4, TypeSig::Object];
        let mut table = LocalTable::new(&original);

        let result = table.allocate(LocalKind::Result, TypeSig::I4);
        assert_eq!(result, 2);
        assert_eq!(table.allocate(LocalKind::Result, TypeSig::I4), 2);

        let state_a = table.allocate(LocalKind::State("mod.a".into()), TypeSig::Object);
        let state_b = table.allocate(LocalKind::State("mod.b".into()), TypeSig::Object);
        assert_eq!(state_a, 3);
        assert_eq!(state_b, 4);
        assert_eq!(table.get(&LocalKind::State("mod.a".into())), Some(3));
        assert_eq!(table.get(&LocalKind::RunOriginal), None);

        let locals = table.into_locals(original);
        assert_eq!(
            locals,
            vec![
                TypeSig::I4,
                TypeSig::Object,
                TypeSig::I4,
                TypeSig::Object,
                TypeSig::Object
            ]
        );
    }
}
