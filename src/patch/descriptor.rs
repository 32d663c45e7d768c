//! Patch registration model: priorities, roles, hook declarations.
//!
//! A [`PatchDescriptor`] is the immutable record of one registered patch:
//! who owns it, where it sits in the ordering (priority plus explicit
//! before/after constraints), what role it plays, and the implementation —
//! either a [`HookMethod`] to be called around the original or a
//! [`crate::transpiler::TranspilerPass`] that rewrites its body.
//!
//! Descriptors never change after registration; re-patching replaces the
//! whole [`PatchSet`] and re-runs the pipeline from the original body.

use std::fmt;
use std::sync::Arc;

use strum::Display;

use crate::metadata::{Token, TypeSig};
use crate::transpiler::TranspilerPass;

/// Ordering weight of a patch. Higher runs earlier within its role.
///
/// Any value is legal; the associated constants are the conventional bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Runs after everything else
    pub const LAST: Priority = Priority(0);
    /// Well below normal
    pub const VERY_LOW: Priority = Priority(100);
    /// Below normal
    pub const LOW: Priority = Priority(200);
    /// Slightly below normal
    pub const LOWER_THAN_NORMAL: Priority = Priority(300);
    /// The default
    pub const NORMAL: Priority = Priority(400);
    /// Slightly above normal
    pub const HIGHER_THAN_NORMAL: Priority = Priority(500);
    /// Above normal
    pub const HIGH: Priority = Priority(600);
    /// Well above normal
    pub const VERY_HIGH: Priority = Priority(700);
    /// Runs before everything else
    pub const FIRST: Priority = Priority(800);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a patch attaches relative to the original body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum PatchRole {
    /// Runs before the original; may veto it
    Prefix,
    /// Runs after the original; may observe or replace the result
    Postfix,
    /// Runs on every exit, normal or exceptional
    Finalizer,
    /// Rewrites the original instruction stream
    Transpiler,
}

/// What a hook parameter binds to at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamBinding {
    /// The `this` reference of the original invocation
    Instance,
    /// A handle for the original function itself
    Original,
    /// Declared argument of the original, by zero-based index
    Argument(u16),
    /// Snapshot of all arguments as an object array
    ArgsArray,
    /// The current result value
    Result,
    /// The by-reference return slot; only valid when the original returns
    /// by reference
    ResultRef,
    /// Per-owner shared state local
    State,
    /// The run-original flag
    RunOriginal,
    /// The captured exception; only meaningful in finalizers
    Exception,
}

/// One declared parameter of a hook method.
#[derive(Debug, Clone, PartialEq)]
pub struct HookParam {
    /// What the parameter binds to
    pub binding: ParamBinding,
    /// Declared parameter type; wrap in [`TypeSig::ByRef`] for ref/out
    pub ty: TypeSig,
}

impl HookParam {
    /// Declare a parameter binding.
    #[must_use]
    pub fn new(binding: ParamBinding, ty: TypeSig) -> Self {
        HookParam { binding, ty }
    }
}

/// A callable hook: its call token and declared shape.
#[derive(Debug, Clone, PartialEq)]
pub struct HookMethod {
    /// Token the synthesized `call` targets
    pub token: Token,
    /// Declared parameters in order
    pub params: Vec<HookParam>,
    /// Declared return type
    pub return_type: TypeSig,
}

impl HookMethod {
    /// `true` when running this hook can change how the original executes:
    /// it declares a boolean result, takes a by-reference parameter, or
    /// receives a declared argument through a non-value type.
    #[must_use]
    pub fn affects_original(&self) -> bool {
        if self.return_type == TypeSig::Boolean {
            return true;
        }
        self.params.iter().any(|param| {
            param.ty.is_by_ref()
                || (matches!(param.binding, ParamBinding::Argument(_)) && !param.ty.is_value_type())
        })
    }

    /// `true` if any parameter uses `binding`.
    #[must_use]
    pub fn has_binding(&self, binding: ParamBinding) -> bool {
        self.params.iter().any(|param| param.binding == binding)
    }
}

/// The implementation side of a descriptor.
#[derive(Clone)]
pub enum PatchImpl {
    /// A hook method called around the original
    Hook(HookMethod),
    /// A rewrite pass over the original body
    Transpiler(Arc<dyn TranspilerPass>),
}

impl fmt::Debug for PatchImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchImpl::Hook(hook) => f.debug_tuple("Hook").field(&hook.token).finish(),
            PatchImpl::Transpiler(pass) => f.debug_tuple("Transpiler").field(&pass.name()).finish(),
        }
    }
}

/// One registered patch. Immutable after construction.
#[derive(Debug, Clone)]
pub struct PatchDescriptor {
    /// Identifier of the registering party; ordering constraints name owners
    pub owner: Arc<str>,
    /// Registration sequence number, the stable tie-breaker
    pub index: u32,
    /// Ordering weight within the role
    pub priority: Priority,
    /// Owners whose patches must run after this one
    pub before: Vec<Arc<str>>,
    /// Owners whose patches must run before this one
    pub after: Vec<Arc<str>>,
    /// Role of this patch
    pub role: PatchRole,
    /// Hook or rewrite pass
    pub implementation: PatchImpl,
}

impl PatchDescriptor {
    /// Create a hook descriptor with default priority and no constraints.
    #[must_use]
    pub fn hook(owner: impl Into<Arc<str>>, index: u32, role: PatchRole, hook: HookMethod) -> Self {
        PatchDescriptor {
            owner: owner.into(),
            index,
            priority: Priority::default(),
            before: Vec::new(),
            after: Vec::new(),
            role,
            implementation: PatchImpl::Hook(hook),
        }
    }

    /// Create a transpiler descriptor with default priority and no constraints.
    #[must_use]
    pub fn transpiler(
        owner: impl Into<Arc<str>>,
        index: u32,
        pass: Arc<dyn TranspilerPass>,
    ) -> Self {
        PatchDescriptor {
            owner: owner.into(),
            index,
            priority: Priority::default(),
            before: Vec::new(),
            after: Vec::new(),
            role: PatchRole::Transpiler,
            implementation: PatchImpl::Transpiler(pass),
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a before constraint: `owner`'s patches must run after this one.
    #[must_use]
    pub fn with_before(mut self, owner: impl Into<Arc<str>>) -> Self {
        self.before.push(owner.into());
        self
    }

    /// Add an after constraint: `owner`'s patches must run before this one.
    #[must_use]
    pub fn with_after(mut self, owner: impl Into<Arc<str>>) -> Self {
        self.after.push(owner.into());
        self
    }

    /// The hook, for hook-role descriptors.
    #[must_use]
    pub fn hook_method(&self) -> Option<&HookMethod> {
        match &self.implementation {
            PatchImpl::Hook(hook) => Some(hook),
            PatchImpl::Transpiler(_) => None,
        }
    }

    /// Structural equality of the registration, used to decide whether a
    /// sorted result can be reused. Hook implementations compare by token,
    /// rewrite passes by identity.
    #[must_use]
    pub fn same_registration(&self, other: &PatchDescriptor) -> bool {
        if self.owner != other.owner
            || self.index != other.index
            || self.priority != other.priority
            || self.before != other.before
            || self.after != other.after
            || self.role != other.role
        {
            return false;
        }
        match (&self.implementation, &other.implementation) {
            (PatchImpl::Hook(a), PatchImpl::Hook(b)) => a.token == b.token,
            (PatchImpl::Transpiler(a), PatchImpl::Transpiler(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// The complete set of patches registered against one function, by role.
#[derive(Debug, Clone, Default)]
pub struct PatchSet {
    /// Prefix hooks
    pub prefixes: Vec<PatchDescriptor>,
    /// Postfix hooks
    pub postfixes: Vec<PatchDescriptor>,
    /// Finalizer hooks
    pub finalizers: Vec<PatchDescriptor>,
    /// Rewrite passes
    pub transpilers: Vec<PatchDescriptor>,
}

impl PatchSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        PatchSet::default()
    }

    /// Add a descriptor to the array matching its role.
    pub fn add(&mut self, descriptor: PatchDescriptor) {
        match descriptor.role {
            PatchRole::Prefix => self.prefixes.push(descriptor),
            PatchRole::Postfix => self.postfixes.push(descriptor),
            PatchRole::Finalizer => self.finalizers.push(descriptor),
            PatchRole::Transpiler => self.transpilers.push(descriptor),
        }
    }

    /// `true` when no patches are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
            && self.postfixes.is_empty()
            && self.finalizers.is_empty()
            && self.transpilers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn void_hook(token: u32) -> HookMethod {
        HookMethod {
            token: Token::new(token),
            params: vec![],
            return_type: TypeSig::Void,
        }
    }

    #[test]
    fn priority_bands_are_ordered() {
        assert!(Priority::FIRST > Priority::NORMAL);
        assert!(Priority::NORMAL > Priority::LAST);
        assert_eq!(Priority::default(), Priority::NORMAL);
        assert_eq!(Priority::NORMAL.0, 400);
        assert_eq!(Priority::LAST.0, 0);
        assert_eq!(Priority::FIRST.0, 800);
    }

    #[test]
    fn affects_original_rules() {
        let plain = HookMethod {
            token: Token::new(1),
            params: vec![HookParam::new(ParamBinding::Argument(0), TypeSig::I4)],
            return_type: TypeSig::Void,
        };
        assert!(!plain.affects_original());

        let veto = HookMethod {
            token: Token::new(2),
            params: vec![],
            return_type: TypeSig::Boolean,
        };
        assert!(veto.affects_original());

        let by_ref = HookMethod {
            token: Token::new(3),
            params: vec![HookParam::new(
                ParamBinding::Argument(0),
                TypeSig::ByRef(Box::new(TypeSig::I4)),
            )],
            return_type: TypeSig::Void,
        };
        assert!(by_ref.affects_original());

        let reference_arg = HookMethod {
            token: Token::new(4),
            params: vec![HookParam::new(ParamBinding::Argument(0), TypeSig::Object)],
            return_type: TypeSig::Void,
        };
        assert!(reference_arg.affects_original());

        // Injected values with reference types do not count; only declared
        // arguments can leak writes into the original invocation.
        let injected = HookMethod {
            token: Token::new(5),
            params: vec![HookParam::new(ParamBinding::Instance, TypeSig::Object)],
            return_type: TypeSig::Void,
        };
        assert!(!injected.affects_original());
    }

    #[test]
    fn set_routes_by_role() {
        let mut set = PatchSet::new();
        set.add(PatchDescriptor::hook("a", 0, PatchRole::Prefix, void_hook(1)));
        set.add(PatchDescriptor::hook("a", 1, PatchRole::Postfix, void_hook(2)));
        set.add(PatchDescriptor::hook("b", 2, PatchRole::Finalizer, void_hook(3)));

        assert_eq!(set.prefixes.len(), 1);
        assert_eq!(set.postfixes.len(), 1);
        assert_eq!(set.finalizers.len(), 1);
        assert!(set.transpilers.is_empty());
        assert!(!set.is_empty());
        assert!(PatchSet::new().is_empty());
    }

    #[test]
    fn registration_equality() {
        let a = PatchDescriptor::hook("mod.a", 0, PatchRole::Prefix, void_hook(1))
            .with_priority(Priority::HIGH)
            .with_before("mod.b");
        let same = PatchDescriptor::hook("mod.a", 0, PatchRole::Prefix, void_hook(1))
            .with_priority(Priority::HIGH)
            .with_before("mod.b");
        let different = PatchDescriptor::hook("mod.a", 0, PatchRole::Prefix, void_hook(2))
            .with_priority(Priority::HIGH)
            .with_before("mod.b");

        assert!(a.same_registration(&same));
        assert!(!a.same_registration(&different));
    }
}
