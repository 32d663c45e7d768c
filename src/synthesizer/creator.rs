//! Replacement-body construction.
//!
//! [`synthesize`] takes the target's transpiled instruction stream and the
//! sorted hook arrays and produces one new stream in a fixed shape:
//!
//! ```text
//! local inits
//! [try                                 when finalizers exist ]
//!     prefixes            (bool returns store the run flag)
//!     run-flag check      (when any prefix can veto)
//!     original body       (every ret becomes store + branch to the merge)
//!     merge nop
//!     postfixes           (void first, then pass-through chained)
//!     finalizers, finalized = true, rethrow stored exception
//!     leave
//! [catch: store exception, run finalizers swallowed, rethrow ]
//! load result / ret
//! ```
//!
//! The stream is then lowered through the encoder into a [`FunctionBody`]
//! ready for the code generator, together with a map from every surviving
//! instruction identity to its final stream index.
//!
//! Hook declaration mistakes surface as [`crate::Error::Configuration`]
//! naming the owning patch and the target function; nothing is ever
//! installed from a run that errors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::assembly::encoder::encode_body;
use crate::assembly::opcodes;
use crate::assembly::{
    ExceptionBlock, ExceptionBlockType, FlowType, InstrId, Instruction, Label, LabelGen, Operand,
};
use crate::metadata::{FunctionBody, SymbolResolver, TypeSig};
use crate::patch::{HookMethod, ParamBinding, PatchDescriptor};
use crate::synthesizer::config::{LocalKind, LocalTable, SynthesisConfig};
use crate::synthesizer::rewriter::rewrite_fault_blocks;
use crate::transpiler::shift_arguments;
use crate::{Error, Result};

/// The outcome of one synthesis run: the encoded replacement body plus the
/// final stream position of every instruction identity that survived into it.
#[derive(Debug)]
pub struct SynthesizedBody {
    /// Encoded replacement, ready for the code generator
    pub body: FunctionBody,
    /// First final stream index of each instruction identity
    pub instruction_map: HashMap<InstrId, usize>,
}

/// Build and encode the replacement body for one function.
///
/// `transpiled` is the original body after the transpiler chain; `original`
/// supplies its declared locals and stack depth.
///
/// # Errors
/// Returns [`crate::Error::Configuration`] for invalid hook declarations and
/// [`crate::Error::Malformed`] when the stream cannot be encoded.
pub fn synthesize(
    config: &SynthesisConfig,
    transpiled: Vec<Instruction>,
    original: &FunctionBody,
    resolver: &dyn SymbolResolver,
    labels: &mut LabelGen,
) -> Result<SynthesizedBody> {
    let mut body = transpiled;
    if config.return_buffer {
        shift_arguments(&mut body);
    }

    let mut declared_locals = original.locals.clone();
    rewrite_fault_blocks(&mut body, &mut declared_locals, labels)?;

    let mut creator = MethodCreator {
        config,
        resolver,
        labels,
        locals: LocalTable::new(&declared_locals),
        out: Vec::new(),
        pending_labels: Vec::new(),
    };

    creator.validate()?;
    let mut out = creator.run(body)?;

    let max_stack = stack_estimate(config, original.max_stack);
    let locals = creator.locals.into_locals(declared_locals);
    let encoded = encode_body(&mut out, locals, max_stack)?;

    let mut instruction_map = HashMap::new();
    for (index, instr) in out.iter().enumerate() {
        instruction_map.entry(instr.id).or_insert(index);
    }

    Ok(SynthesizedBody {
        body: encoded,
        instruction_map,
    })
}

/// Conservative operand-stack bound: the original's declared depth, the
/// widest hook call, or the argument-array build, whichever is deepest.
fn stack_estimate(config: &SynthesisConfig, original: u16) -> u16 {
    let hook_width = config
        .hooks()
        .map(|(_, hook)| hook.params.len())
        .max()
        .unwrap_or(0);
    #[allow(clippy::cast_possible_truncation)]
    let hook_width = hook_width.min(usize::from(u16::MAX - 2)) as u16 + 2;

    let array_width = if config.any_binding(ParamBinding::ArgsArray) {
        4
    } else {
        0
    };

    original.max(hook_width).max(array_width).max(2)
}

struct MethodCreator<'a> {
    config: &'a SynthesisConfig,
    resolver: &'a dyn SymbolResolver,
    labels: &'a mut LabelGen,
    locals: LocalTable,
    out: Vec<Instruction>,
    pending_labels: Vec<Label>,
}

impl MethodCreator<'_> {
    fn validate(&self) -> Result<()> {
        let returns_value = !self.config.signature.return_type.is_void();
        let declared = self.config.signature.params.len();

        for (owner, hook) in self.config.hooks() {
            for param in &hook.params {
                match param.binding {
                    ParamBinding::Result if !returns_value => {
                        return Err(self.configuration(
                            owner,
                            "a result parameter was requested from a void function",
                        ));
                    }
                    ParamBinding::ResultRef
                        if !self.config.signature.return_type.is_by_ref() =>
                    {
                        return Err(self.configuration(
                            owner,
                            "a result reference was requested but the function does not return by reference",
                        ));
                    }
                    ParamBinding::Argument(index) if usize::from(index) >= declared => {
                        return Err(self.configuration(
                            owner,
                            &format!(
                                "argument index {index} is out of range ({declared} declared)"
                            ),
                        ));
                    }
                    _ => {}
                }
            }
        }

        for descriptor in &self.config.prefixes {
            let Some(hook) = descriptor.hook_method() else {
                continue;
            };
            if !hook.return_type.is_void() && hook.return_type != TypeSig::Boolean {
                return Err(self.configuration(
                    &descriptor.owner,
                    "a prefix must return void or bool",
                ));
            }
        }

        for descriptor in &self.config.postfixes {
            let Some(hook) = descriptor.hook_method() else {
                continue;
            };
            if hook.return_type.is_void() {
                continue;
            }
            if !returns_value {
                return Err(self.configuration(
                    &descriptor.owner,
                    "a pass-through postfix cannot apply to a void function",
                ));
            }
            let first = hook.params.first();
            if first.map(|p| &p.ty) != Some(&hook.return_type) {
                return Err(self.configuration(
                    &descriptor.owner,
                    "a value-returning postfix must accept its own return type as first parameter",
                ));
            }
        }

        for descriptor in &self.config.finalizers {
            let Some(hook) = descriptor.hook_method() else {
                continue;
            };
            if !hook.return_type.is_void() && hook.return_type.is_value_type() {
                return Err(self.configuration(
                    &descriptor.owner,
                    "a finalizer must return void or a replacement exception",
                ));
            }
        }

        Ok(())
    }

    fn run(&mut self, body: Vec<Instruction>) -> Result<Vec<Instruction>> {
        let returns_value = !self.config.signature.return_type.is_void();
        let veto_possible = self
            .config
            .prefixes
            .iter()
            .filter_map(PatchDescriptor::hook_method)
            .any(HookMethod::affects_original);
        let has_finalizers = !self.config.finalizers.is_empty();
        let has_passthrough = self
            .config
            .postfixes
            .iter()
            .filter_map(PatchDescriptor::hook_method)
            .any(|hook| !hook.return_type.is_void());

        let result_needed = returns_value
            && (veto_possible
                || has_finalizers
                || has_passthrough
                || self.config.any_binding(ParamBinding::Result)
                || self.config.any_binding(ParamBinding::ResultRef));
        let run_flag_needed = veto_possible || self.config.any_binding(ParamBinding::RunOriginal);

        // Local slots and their initializers, all outside the protected
        // region so the catch handler can rely on them.
        if run_flag_needed {
            let slot = self
                .locals
                .allocate(LocalKind::RunOriginal, TypeSig::Boolean);
            self.emit(Instruction::ldc_i4(1));
            self.emit(Instruction::store_local(slot));
        }
        if result_needed {
            let ty = self.config.signature.return_type.clone();
            let slot = self.locals.allocate(LocalKind::Result, ty.clone());
            self.init_slot(slot, &ty);
        }
        if self.config.any_binding(ParamBinding::ArgsArray) {
            self.build_args_array()?;
        }
        for (owner, hook) in self.config.hooks() {
            if hook.has_binding(ParamBinding::State) {
                let slot = self
                    .locals
                    .allocate(LocalKind::State(Arc::clone(owner)), TypeSig::Object);
                self.emit(Instruction::op(opcodes::LDNULL));
                self.emit(Instruction::store_local(slot));
            }
        }
        if has_finalizers {
            let finalized = self
                .locals
                .allocate(LocalKind::Finalized, TypeSig::Boolean);
            self.emit(Instruction::ldc_i4(0));
            self.emit(Instruction::store_local(finalized));

            let exception = self.locals.allocate(LocalKind::Exception, TypeSig::Object);
            self.emit(Instruction::op(opcodes::LDNULL));
            self.emit(Instruction::store_local(exception));
        }

        let region_start = self.out.len();
        let end_label = self.labels.fresh();

        let saw_return = {
            self.add_prefixes(veto_possible)?;

            if veto_possible {
                let run = self.run_flag();
                self.emit(Instruction::load_local(run));
                self.emit(Instruction::branch(opcodes::BRFALSE, end_label));
            }

            self.add_original(body, end_label, returns_value)
        };

        let merge_needed = saw_return
            || veto_possible
            || has_finalizers
            || !self.config.postfixes.is_empty();

        if merge_needed {
            let mut merge = Instruction::nop();
            merge.attach_label(end_label);
            self.emit(merge);

            self.add_postfixes()?;

            let final_label = self.labels.fresh();
            if has_finalizers {
                self.add_finalizer_epilogue(final_label)?;

                // The protected region spans everything from the first
                // prefix to the catch handler's rethrow.
                let last = self.out.len() - 1;
                self.out[last]
                    .attach_block(ExceptionBlock::new(ExceptionBlockType::EndExceptionBlock));
                self.out[region_start].blocks.insert(
                    0,
                    ExceptionBlock::new(ExceptionBlockType::BeginExceptionBlock),
                );

                self.mark(final_label);
            }

            if result_needed {
                let result = self.result_slot();
                self.emit(Instruction::load_local(result));
            }
            self.emit(Instruction::op(opcodes::RET));
        }

        Ok(std::mem::take(&mut self.out))
    }

    /// Append `instr`, attaching any parked labels.
    fn emit(&mut self, mut instr: Instruction) {
        for label in self.pending_labels.drain(..) {
            instr.attach_label(label);
        }
        self.out.push(instr);
    }

    /// Attach `label` to the next emitted instruction.
    fn mark(&mut self, label: Label) {
        self.pending_labels.push(label);
    }

    fn run_flag(&self) -> u16 {
        self.locals.get(&LocalKind::RunOriginal).unwrap_or(0)
    }

    fn result_slot(&self) -> u16 {
        self.locals.get(&LocalKind::Result).unwrap_or(0)
    }

    fn configuration(&self, owner: &str, message: &str) -> Error {
        Error::Configuration {
            owner: owner.to_string(),
            function: self.config.function.to_string(),
            message: message.to_string(),
        }
    }

    /// Default-initialize a synthesized slot so that paths that bypass the
    /// original body still read a defined value.
    fn init_slot(&mut self, slot: u16, ty: &TypeSig) {
        match ty {
            TypeSig::Object | TypeSig::String | TypeSig::Class(_) => {
                self.emit(Instruction::op(opcodes::LDNULL));
                self.emit(Instruction::store_local(slot));
            }
            TypeSig::I8 | TypeSig::U8 => {
                self.emit(Instruction::ldc_i4(0));
                self.emit(Instruction::op(opcodes::CONV_I8));
                self.emit(Instruction::store_local(slot));
            }
            TypeSig::R4 => {
                self.emit(Instruction::ldc_i4(0));
                self.emit(Instruction::op(opcodes::CONV_R4));
                self.emit(Instruction::store_local(slot));
            }
            TypeSig::R8 => {
                self.emit(Instruction::ldc_i4(0));
                self.emit(Instruction::op(opcodes::CONV_R8));
                self.emit(Instruction::store_local(slot));
            }
            TypeSig::I | TypeSig::U => {
                self.emit(Instruction::ldc_i4(0));
                self.emit(Instruction::op(opcodes::CONV_I));
                self.emit(Instruction::store_local(slot));
            }
            TypeSig::ValueType { token, .. } => {
                self.emit(Instruction::load_local_addr(slot));
                self.emit(
                    Instruction::new(
                        opcodes::FE_PREFIX,
                        opcodes::FE_INITOBJ,
                        Operand::Token(*token),
                    )
                    .unwrap_or_else(|_| Instruction::nop()),
                );
            }
            // References into the caller's frame cannot be defaulted; the
            // body has to run before anyone reads them.
            TypeSig::ByRef(_) | TypeSig::Void => {}
            _ => {
                self.emit(Instruction::ldc_i4(0));
                self.emit(Instruction::store_local(slot));
            }
        }
    }

    /// Box the declared arguments into an object array local.
    fn build_args_array(&mut self) -> Result<()> {
        let owner = self
            .config
            .hooks()
            .find(|(_, hook)| hook.has_binding(ParamBinding::ArgsArray))
            .map(|(owner, _)| Arc::clone(owner))
            .unwrap_or_else(|| Arc::from(""));

        let Some(element) = self.resolver.boxing_token(&TypeSig::Object) else {
            return Err(self.configuration(
                &owner,
                "an arguments array was requested but the resolver provides no object type token",
            ));
        };

        let slot = self.locals.allocate(LocalKind::ArgsArray, TypeSig::Object);
        let params = self.config.signature.params.clone();

        #[allow(clippy::cast_possible_truncation)]
        self.emit(Instruction::ldc_i4(params.len() as i32));
        self.emit(Instruction::with_token(opcodes::NEWARR, element));

        for (index, ty) in params.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let declared = index as u16;
            self.emit(Instruction::op(opcodes::DUP));
            #[allow(clippy::cast_possible_truncation)]
            self.emit(Instruction::ldc_i4(index as i32));
            self.emit(Instruction::load_arg(self.declared_slot(declared)));
            if ty.is_value_type() {
                if let Some(token) = self.resolver.boxing_token(ty) {
                    self.emit(Instruction::with_token(opcodes::BOX, token));
                }
            }
            self.emit(Instruction::op(opcodes::STELEM_REF));
        }

        self.emit(Instruction::store_local(slot));
        Ok(())
    }

    /// Argument slot of declared parameter `index`, accounting for `this`
    /// and the hidden return-buffer pointer.
    fn declared_slot(&self, index: u16) -> u16 {
        self.config.signature.arg_slot(index) + u16::from(self.config.return_buffer)
    }

    fn add_prefixes(&mut self, veto_possible: bool) -> Result<()> {
        let prefixes = self.config.prefixes.clone();
        // Until some prefix stores the flag it is trivially true, so the
        // first veto-capable prefix runs unguarded.
        let mut flag_may_be_false = false;

        for descriptor in &prefixes {
            let Some(hook) = descriptor.hook_method() else {
                continue;
            };

            let guard = if veto_possible && flag_may_be_false && hook.affects_original() {
                let skip = self.labels.fresh();
                let run = self.run_flag();
                self.emit(Instruction::load_local(run));
                self.emit(Instruction::branch(opcodes::BRFALSE, skip));
                Some(skip)
            } else {
                None
            };

            self.emit_hook_call(hook, &descriptor.owner)?;

            if hook.return_type == TypeSig::Boolean {
                let run = self.run_flag();
                self.emit(Instruction::store_local(run));
                flag_may_be_false = true;
            }

            if let Some(skip) = guard {
                self.mark(skip);
            }
        }

        Ok(())
    }

    /// Append the transpiled original body, rewriting every return into a
    /// result store plus a branch to the merge point. Returns whether any
    /// return was seen; a body that provably ends in dead code has none.
    fn add_original(
        &mut self,
        body: Vec<Instruction>,
        end_label: Label,
        returns_value: bool,
    ) -> bool {
        let result = self.locals.get(&LocalKind::Result);
        let mut saw_return = false;

        for instr in body {
            if instr.flow != FlowType::Return {
                self.emit(instr);
                continue;
            }

            saw_return = true;
            let replacement = if returns_value && result.is_some() {
                let mut store = Instruction::store_local(self.result_slot());
                store.id = instr.id;
                store.labels = instr.labels;
                store.blocks = instr.blocks;
                self.emit(store);
                Instruction::branch(opcodes::BR, end_label)
            } else {
                // Void return, or the value rides the operand stack into
                // the merge point.
                let mut branch = Instruction::branch(opcodes::BR, end_label);
                branch.id = instr.id;
                branch.labels = instr.labels;
                branch.blocks = instr.blocks;
                branch
            };
            self.emit(replacement);
        }

        saw_return
    }

    fn add_postfixes(&mut self) -> Result<()> {
        let postfixes = self.config.postfixes.clone();

        for descriptor in &postfixes {
            let Some(hook) = descriptor.hook_method() else {
                continue;
            };
            if hook.return_type.is_void() {
                self.emit_hook_call(hook, &descriptor.owner)?;
            }
        }

        for descriptor in &postfixes {
            let Some(hook) = descriptor.hook_method() else {
                continue;
            };
            if hook.return_type.is_void() {
                continue;
            }

            // Pass-through: current result in, replacement result out.
            let result = self.result_slot();
            self.emit(Instruction::load_local(result));
            for param in hook.params.iter().skip(1) {
                self.emit_param_load(param.binding, &param.ty, &descriptor.owner)?;
            }
            self.emit(Instruction::with_token(opcodes::CALL, hook.token));
            self.emit(Instruction::store_local(result));
        }

        Ok(())
    }

    /// The finalizer tail: normal-path run inside the region, the catch
    /// handler with individually swallowed re-runs, and the rethrow that
    /// closes the region.
    fn add_finalizer_epilogue(&mut self, final_label: Label) -> Result<()> {
        let finalizers = self.config.finalizers.clone();
        let finalized = self
            .locals
            .get(&LocalKind::Finalized)
            .unwrap_or(0);
        let exception = self
            .locals
            .get(&LocalKind::Exception)
            .unwrap_or(0);

        // Normal exit: run every finalizer once, then surface a stored
        // replacement exception if one was produced.
        for descriptor in &finalizers {
            let Some(hook) = descriptor.hook_method() else {
                continue;
            };
            self.emit_hook_call(hook, &descriptor.owner)?;
            if !hook.return_type.is_void() {
                self.emit(Instruction::store_local(exception));
            }
        }
        self.emit(Instruction::ldc_i4(1));
        self.emit(Instruction::store_local(finalized));

        let no_throw = self.labels.fresh();
        self.emit(Instruction::load_local(exception));
        self.emit(Instruction::branch(opcodes::BRFALSE, no_throw));
        self.emit(Instruction::load_local(exception));
        self.emit(Instruction::op(opcodes::THROW));
        self.mark(no_throw);
        self.emit(Instruction::branch(opcodes::LEAVE, final_label));

        // Exceptional exit: capture, re-run once if the normal pass never
        // completed, and rethrow the original or its replacement.
        let mut capture = Instruction::store_local(exception);
        capture.attach_block(ExceptionBlock::catch(None));
        self.emit(capture);

        let skip_rerun = self.labels.fresh();
        self.emit(Instruction::load_local(finalized));
        self.emit(Instruction::branch(opcodes::BRTRUE, skip_rerun));

        for descriptor in &finalizers {
            let Some(hook) = descriptor.hook_method() else {
                continue;
            };

            // Each re-run is swallowed on its own so one failing finalizer
            // cannot keep the others from running.
            let after = self.labels.fresh();
            let start = self.out.len();
            self.emit_hook_call(hook, &descriptor.owner)?;
            if !hook.return_type.is_void() {
                self.emit(Instruction::store_local(exception));
            }
            self.emit(Instruction::branch(opcodes::LEAVE, after));

            let mut swallow = Instruction::op(opcodes::POP);
            swallow.attach_block(ExceptionBlock::catch(None));
            swallow.attach_block(ExceptionBlock::new(ExceptionBlockType::EndExceptionBlock));
            self.emit(swallow);

            self.out[start].blocks.insert(
                0,
                ExceptionBlock::new(ExceptionBlockType::BeginExceptionBlock),
            );
            self.mark(after);
        }

        self.mark(skip_rerun);
        self.emit(Instruction::load_local(exception));
        self.emit(Instruction::op(opcodes::THROW));

        Ok(())
    }

    fn emit_hook_call(&mut self, hook: &HookMethod, owner: &Arc<str>) -> Result<()> {
        for param in &hook.params {
            self.emit_param_load(param.binding, &param.ty, owner)?;
        }
        self.emit(Instruction::with_token(opcodes::CALL, hook.token));
        Ok(())
    }

    fn emit_param_load(
        &mut self,
        binding: ParamBinding,
        ty: &TypeSig,
        owner: &Arc<str>,
    ) -> Result<()> {
        match binding {
            ParamBinding::Instance => {
                if self.config.signature.has_this {
                    self.emit(Instruction::load_arg(0));
                } else {
                    self.emit(Instruction::op(opcodes::LDNULL));
                }
            }
            ParamBinding::Original => {
                self.emit(Instruction::with_token(
                    opcodes::LDTOKEN,
                    self.config.function.token(),
                ));
            }
            ParamBinding::Argument(index) => {
                let declared = &self.config.signature.params[usize::from(index)];
                let slot = self.declared_slot(index);
                if ty.is_by_ref() && !declared.is_by_ref() {
                    self.emit(Instruction::load_arg_addr(slot));
                } else {
                    self.emit(Instruction::load_arg(slot));
                }
            }
            ParamBinding::ArgsArray => {
                let slot = self
                    .locals
                    .get(&LocalKind::ArgsArray)
                    .unwrap_or(0);
                self.emit_slot(slot, ty.is_by_ref());
            }
            ParamBinding::Result => {
                let slot = self.result_slot();
                self.emit_slot(slot, ty.is_by_ref());
            }
            ParamBinding::ResultRef => {
                // The result slot of a by-ref-returning function holds the
                // reference itself.
                let slot = self.result_slot();
                self.emit(Instruction::load_local(slot));
            }
            ParamBinding::State => {
                let slot = self
                    .locals
                    .get(&LocalKind::State(Arc::clone(owner)))
                    .unwrap_or(0);
                self.emit_slot(slot, ty.is_by_ref());
            }
            ParamBinding::RunOriginal => {
                let slot = self.run_flag();
                self.emit_slot(slot, ty.is_by_ref());
            }
            ParamBinding::Exception => {
                if let Some(slot) = self.locals.get(&LocalKind::Exception) {
                    self.emit_slot(slot, ty.is_by_ref());
                } else {
                    self.emit(Instruction::op(opcodes::LDNULL));
                }
            }
        }
        Ok(())
    }

    fn emit_slot(&mut self, slot: u16, by_ref: bool) {
        if by_ref {
            self.emit(Instruction::load_local_addr(slot));
        } else {
            self.emit(Instruction::load_local(slot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FunctionId, FunctionSig, MemberHandle, Token};
    use crate::patch::{HookParam, PatchRole};

    struct TestResolver;

    impl SymbolResolver for TestResolver {
        fn signature(&self, _id: &FunctionId) -> Result<FunctionSig> {
            Ok(FunctionSig {
                has_this: false,
                params: vec![],
                return_type: TypeSig::Void,
            })
        }
        fn body(&self, _id: &FunctionId) -> Result<FunctionBody> {
            Ok(FunctionBody::default())
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
        fn boxing_token(&self, ty: &TypeSig) -> Option<Token> {
            match ty {
                TypeSig::Object => Some(Token::new(0x0100_0001)),
                other => other.token(),
            }
        }
        fn native_entry(&self, _id: &FunctionId) -> Result<usize> {
            Ok(0)
        }
    }

    fn config(return_type: TypeSig) -> SynthesisConfig {
        SynthesisConfig {
            function: FunctionId::new(Token::new(0x0600_0010), "Demo::Target"),
            signature: FunctionSig {
                has_this: true,
                params: vec![TypeSig::I4],
                return_type,
            },
            prefixes: vec![],
            postfixes: vec![],
            finalizers: vec![],
            return_buffer: false,
        }
    }

    fn int_body() -> Vec<Instruction> {
        vec![Instruction::ldc_i4(5), Instruction::op(opcodes::RET)]
    }

    fn hook(token: u32, params: Vec<HookParam>, return_type: TypeSig) -> HookMethod {
        HookMethod {
            token: Token::new(token),
            params,
            return_type,
        }
    }

    fn call_tokens(stream: &[Instruction]) -> Vec<Token> {
        stream
            .iter()
            .filter(|i| i.opcode == opcodes::CALL && i.prefix == 0)
            .filter_map(|i| match &i.operand {
                Operand::Token(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    fn run_creator(config: &SynthesisConfig, body: Vec<Instruction>) -> Vec<Instruction> {
        let mut labels = LabelGen::new();
        let mut creator = MethodCreator {
            config,
            resolver: &TestResolver,
            labels: &mut labels,
            locals: LocalTable::new(&[]),
            out: Vec::new(),
            pending_labels: Vec::new(),
        };
        creator.validate().unwrap();
        creator.run(body).unwrap()
    }

    #[test]
    fn veto_prefix_guards_the_original() {
        let mut cfg = config(TypeSig::I4);
        cfg.prefixes.push(PatchDescriptor::hook(
            "mod.veto",
            0,
            PatchRole::Prefix,
            hook(0x0A00_0001, vec![], TypeSig::Boolean),
        ));

        let out = run_creator(&cfg, int_body());

        // flag init, prefix call, flag store, flag check, body, merge, ret
        assert_eq!(call_tokens(&out), vec![Token::new(0x0A00_0001)]);

        let call_at = out
            .iter()
            .position(|i| i.opcode == opcodes::CALL)
            .unwrap();
        // Run flag is the first synthesized slot, the result the second.
        assert_eq!(out[call_at + 1].mnemonic, "stloc.0");

        let guard = &out[call_at + 3];
        assert_eq!(guard.opcode, opcodes::BRFALSE);
        assert!(matches!(guard.operand, Operand::Label(_)));

        // The original ret is gone; only the synthesized epilogue returns.
        let returns: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|(_, i)| i.flow == FlowType::Return)
            .map(|(n, _)| n)
            .collect();
        assert_eq!(returns, vec![out.len() - 1]);
        assert_eq!(out[out.len() - 2].mnemonic, "ldloc.1");
    }

    #[test]
    fn passthrough_postfixes_chain_in_order() {
        let mut cfg = config(TypeSig::I4);
        let p1 = hook(
            0x0A00_0011,
            vec![HookParam::new(ParamBinding::Result, TypeSig::I4)],
            TypeSig::I4,
        );
        let p2 = hook(
            0x0A00_0012,
            vec![HookParam::new(ParamBinding::Result, TypeSig::I4)],
            TypeSig::I4,
        );
        cfg.postfixes
            .push(PatchDescriptor::hook("mod.p1", 0, PatchRole::Postfix, p1));
        cfg.postfixes
            .push(PatchDescriptor::hook("mod.p2", 1, PatchRole::Postfix, p2));

        let out = run_creator(&cfg, int_body());
        assert_eq!(
            call_tokens(&out),
            vec![Token::new(0x0A00_0011), Token::new(0x0A00_0012)]
        );

        // Each call reads the result slot and writes it back.
        for token in [0x0A00_0011u32, 0x0A00_0012] {
            let at = out
                .iter()
                .position(|i| matches!(&i.operand, Operand::Token(t) if t.value() == token))
                .unwrap();
            assert_eq!(out[at - 1].mnemonic, "ldloc.0");
            assert_eq!(out[at + 1].mnemonic, "stloc.0");
        }
    }

    #[test]
    fn void_postfix_leaves_result_on_the_stack() {
        let mut cfg = config(TypeSig::I4);
        cfg.postfixes.push(PatchDescriptor::hook(
            "mod.observe",
            0,
            PatchRole::Postfix,
            hook(0x0A00_0021, vec![], TypeSig::Void),
        ));

        let out = run_creator(&cfg, int_body());

        // No bindings and no veto: no locals, the value stays on the stack.
        assert!(!out.iter().any(|i| i.mnemonic.starts_with("stloc")));
        assert_eq!(call_tokens(&out), vec![Token::new(0x0A00_0021)]);
        assert_eq!(out.last().unwrap().opcode, opcodes::RET);
    }

    #[test]
    fn argument_binding_loads_declared_slot() {
        let mut cfg = config(TypeSig::Void);
        cfg.prefixes.push(PatchDescriptor::hook(
            "mod.args",
            0,
            PatchRole::Prefix,
            hook(
                0x0A00_0031,
                vec![HookParam::new(ParamBinding::Argument(0), TypeSig::I4)],
                TypeSig::Void,
            ),
        ));

        let body = vec![Instruction::op(opcodes::RET)];
        let out = run_creator(&cfg, body);

        // Instance signature: declared parameter 0 is argument slot 1.
        assert_eq!(out[0].mnemonic, "ldarg.1");
        assert_eq!(out[1].opcode, opcodes::CALL);
    }

    #[test]
    fn return_buffer_shifts_declared_arguments() {
        let mut cfg = config(TypeSig::Void);
        cfg.return_buffer = true;
        cfg.prefixes.push(PatchDescriptor::hook(
            "mod.args",
            0,
            PatchRole::Prefix,
            hook(
                0x0A00_0032,
                vec![
                    HookParam::new(ParamBinding::Instance, TypeSig::Object),
                    HookParam::new(ParamBinding::Argument(0), TypeSig::I4),
                ],
                TypeSig::Void,
            ),
        ));

        let body = vec![Instruction::op(opcodes::RET)];
        let out = run_creator(&cfg, body);

        assert_eq!(out[0].mnemonic, "ldarg.0");
        assert_eq!(out[1].mnemonic, "ldarg.2");
    }

    #[test]
    fn finalizers_produce_an_encodable_protected_body() {
        let mut cfg = config(TypeSig::Void);
        cfg.finalizers.push(PatchDescriptor::hook(
            "mod.cleanup",
            0,
            PatchRole::Finalizer,
            hook(0x0A00_0041, vec![], TypeSig::Void),
        ));

        let body = vec![Instruction::nop(), Instruction::op(opcodes::RET)];
        let original_id = body[0].id;

        let mut labels = LabelGen::new();
        let synthesized = synthesize(
            &cfg,
            body,
            &FunctionBody::default(),
            &TestResolver,
            &mut labels,
        )
        .unwrap();

        // Outer protected region plus one swallow region in the catch arm.
        assert_eq!(synthesized.body.exceptions.len(), 2);
        assert!(synthesized.body.exceptions.iter().any(|clause| clause
            .flags
            .contains(crate::metadata::ExceptionClauseFlags::EXCEPTION)));
        assert!(synthesized.instruction_map.contains_key(&original_id));
    }

    #[test]
    fn synthesized_locals_extend_the_declared_table() {
        let mut cfg = config(TypeSig::I4);
        cfg.prefixes.push(PatchDescriptor::hook(
            "mod.veto",
            0,
            PatchRole::Prefix,
            hook(0x0A00_0060, vec![], TypeSig::Boolean),
        ));

        let original = FunctionBody {
            locals: vec![TypeSig::Object],
            ..Default::default()
        };

        let mut labels = LabelGen::new();
        let synthesized =
            synthesize(&cfg, int_body(), &original, &TestResolver, &mut labels).unwrap();

        // Declared local first, then the run flag and the result slot.
        assert_eq!(
            synthesized.body.locals,
            vec![TypeSig::Object, TypeSig::Boolean, TypeSig::I4]
        );
    }

    #[test]
    fn prefix_with_plain_return_type_is_rejected() {
        let mut cfg = config(TypeSig::Void);
        cfg.prefixes.push(PatchDescriptor::hook(
            "mod.bad",
            0,
            PatchRole::Prefix,
            hook(0x0A00_0051, vec![], TypeSig::I4),
        ));

        let mut labels = LabelGen::new();
        let result = synthesize(
            &cfg,
            vec![Instruction::op(opcodes::RET)],
            &FunctionBody::default(),
            &TestResolver,
            &mut labels,
        );
        assert!(matches!(result, Err(Error::Configuration { owner, .. }) if owner == "mod.bad"));
    }

    #[test]
    fn result_binding_on_void_function_is_rejected() {
        let mut cfg = config(TypeSig::Void);
        cfg.postfixes.push(PatchDescriptor::hook(
            "mod.bad",
            0,
            PatchRole::Postfix,
            hook(
                0x0A00_0052,
                vec![HookParam::new(ParamBinding::Result, TypeSig::I4)],
                TypeSig::Void,
            ),
        ));

        let mut labels = LabelGen::new();
        let result = synthesize(
            &cfg,
            vec![Instruction::op(opcodes::RET)],
            &FunctionBody::default(),
            &TestResolver,
            &mut labels,
        );
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn mismatched_passthrough_is_rejected() {
        let mut cfg = config(TypeSig::I4);
        cfg.postfixes.push(PatchDescriptor::hook(
            "mod.bad",
            0,
            PatchRole::Postfix,
            hook(
                0x0A00_0053,
                vec![HookParam::new(ParamBinding::Result, TypeSig::I8)],
                TypeSig::I4,
            ),
        ));

        let mut labels = LabelGen::new();
        let result = synthesize(
            &cfg,
            int_body(),
            &FunctionBody::default(),
            &TestResolver,
            &mut labels,
        );
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn dead_end_body_with_no_patches_gets_no_epilogue() {
        let cfg = config(TypeSig::I4);
        let body = vec![
            Instruction::op(opcodes::LDNULL),
            Instruction::op(opcodes::THROW),
        ];

        let out = run_creator(&cfg, body);
        assert_eq!(out.len(), 2);
        assert_eq!(out.last().unwrap().opcode, opcodes::THROW);
    }
}
