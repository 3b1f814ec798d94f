//! Host adapter for the `llvm-ir` crate: lowers llvm-ir functions into the
//! planner's instruction stream, and inserts the planned trace calls back into
//! the in-memory `Module`.
//!
//! Instruction ids count every instruction of a function, terminators
//! included, block by block in the order the blocks appear in the function.
//! This is the same order the taint analysis numbers them in.

use crate::config::Config;
use crate::error::Result;
use crate::injector::{instrument_functions, FormatId, FormatPool, InstrumentStats, TraceInjector};
use crate::ir::{InstKind, IrInstruction, IrValue, ValueClass};
use crate::taint_database::TaintDatabase;
use either::Either;
use itertools::Itertools;
use llvm_ir::constant;
use llvm_ir::function::{CallingConvention, Parameter};
use llvm_ir::instruction::{self, groups, BinaryOp, UnaryOp};
use llvm_ir::module::{DLLStorageClass, GlobalVariable, Linkage, ThreadLocalMode, UnnamedAddr, Visibility};
use llvm_ir::types::Types;
use llvm_ir::*;
use log::{debug, trace};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::convert::TryInto;
use std::hash::{Hash, Hasher};

/// Handle for a value in an llvm-ir function: the `Operand` to pass to the
/// trace call, identified by its local name, or by its constant's contents.
#[derive(Clone, Debug)]
pub struct LlvmValue {
    key: ValueKey,
    operand: Operand,
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
enum ValueKey {
    Local(Name),
    Constant(String),
    Metadata,
}

impl LlvmValue {
    fn local(name: &Name, ty: TypeRef) -> Self {
        Self {
            key: ValueKey::Local(name.clone()),
            operand: Operand::LocalOperand {
                name: name.clone(),
                ty,
            },
        }
    }

    /// The operand to pass to the trace call
    pub fn operand(&self) -> &Operand {
        &self.operand
    }
}

impl PartialEq for LlvmValue {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for LlvmValue {}

impl Hash for LlvmValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state)
    }
}

/// Collapse an LLVM type into the classes the planner knows how to record
pub fn classify(ty: &Type) -> ValueClass {
    match ty {
        Type::VoidType => ValueClass::Void,
        Type::IntegerType { .. } => ValueClass::Integer,
        Type::PointerType { .. } => ValueClass::Pointer,
        _ => ValueClass::Unsupported,
    }
}

fn source_name(name: &Name) -> Option<String> {
    match name {
        Name::Name(s) => Some((**s).clone()),
        Name::Number(_) => None,
    }
}

/// Lowers the instructions of one function
struct Lowering<'m> {
    types: &'m Types,
}

impl<'m> Lowering<'m> {
    /// Metadata operands can't be recorded, but they keep their place so
    /// that use `i` of a call is still argument `i + 1`.
    fn value(&self, op: &Operand) -> IrValue<LlvmValue> {
        match op {
            Operand::LocalOperand { name, ty } => IrValue::new(
                LlvmValue::local(name, ty.clone()),
                source_name(name),
                classify(ty),
            ),
            Operand::ConstantOperand(cref) => IrValue::unnamed(
                LlvmValue {
                    key: ValueKey::Constant(format!("{:?}", cref)),
                    operand: op.clone(),
                },
                classify(&self.types.type_of(op)),
            ),
            Operand::MetadataOperand => IrValue::unnamed(
                LlvmValue {
                    key: ValueKey::Metadata,
                    operand: op.clone(),
                },
                ValueClass::Unsupported,
            ),
        }
    }

    fn values<'o>(&self, ops: impl IntoIterator<Item = &'o Operand>) -> Vec<IrValue<LlvmValue>> {
        ops.into_iter().map(|op| self.value(op)).collect()
    }

    /// The value an instruction or invoke defines, unless it's void
    fn result(&self, name: &Name, ty: TypeRef) -> Option<IrValue<LlvmValue>> {
        match classify(&ty) {
            ValueClass::Void => None,
            class => Some(IrValue::new(LlvmValue::local(name, ty), source_name(name), class)),
        }
    }

    fn instruction(&self, inst: &Instruction) -> IrInstruction<LlvmValue> {
        let def = inst.try_get_result().and_then(|name| self.result(name, self.types.type_of(inst)));
        let (kind, uses) = if inst.is_binary_op() {
            let bop: groups::BinaryOp = inst.clone().try_into().unwrap();
            (InstKind::Other, self.values(vec![bop.get_operand0(), bop.get_operand1()]))
        } else if inst.is_unary_op() {
            let uop: groups::UnaryOp = inst.clone().try_into().unwrap();
            (InstKind::Other, self.values(vec![uop.get_operand()]))
        } else {
            match inst {
                Instruction::Call(call) => (
                    InstKind::Call,
                    self.values(call.arguments.iter().map(|(op, _)| op)),
                ),
                Instruction::ExtractElement(ee) => (InstKind::Other, self.values(vec![&ee.vector, &ee.index])),
                Instruction::InsertElement(ie) => (InstKind::Other, self.values(vec![&ie.vector, &ie.element, &ie.index])),
                Instruction::ShuffleVector(sv) => (InstKind::Other, self.values(vec![&sv.operand0, &sv.operand1])),
                Instruction::ExtractValue(ev) => (InstKind::Other, self.values(vec![&ev.aggregate])),
                Instruction::InsertValue(iv) => (InstKind::Other, self.values(vec![&iv.aggregate, &iv.element])),
                Instruction::Alloca(alloca) => (InstKind::Other, self.values(vec![&alloca.num_elements])),
                Instruction::Load(load) => (InstKind::Other, self.values(vec![&load.address])),
                Instruction::Store(store) => (InstKind::Other, self.values(vec![&store.value, &store.address])),
                Instruction::CmpXchg(cx) => (InstKind::Other, self.values(vec![&cx.address, &cx.expected, &cx.replacement])),
                Instruction::AtomicRMW(rmw) => (InstKind::Other, self.values(vec![&rmw.address, &rmw.value])),
                Instruction::GetElementPtr(gep) => (
                    InstKind::Other,
                    self.values(std::iter::once(&gep.address).chain(gep.indices.iter())),
                ),
                Instruction::ICmp(icmp) => (InstKind::Other, self.values(vec![&icmp.operand0, &icmp.operand1])),
                Instruction::FCmp(fcmp) => (InstKind::Other, self.values(vec![&fcmp.operand0, &fcmp.operand1])),
                Instruction::Phi(phi) => (InstKind::Other, self.values(phi.incoming_values.iter().map(|(op, _)| op))),
                Instruction::Select(select) => (
                    InstKind::Other,
                    self.values(vec![&select.condition, &select.true_value, &select.false_value]),
                ),
                Instruction::VAArg(va) => (InstKind::Other, self.values(vec![&va.arg_list])),
                _ => {
                    trace!("no recordable operands for {:?}", inst);
                    (InstKind::Other, vec![])
                },
            }
        };
        IrInstruction::new(kind, def, uses)
    }

    fn terminator(&self, term: &Terminator) -> IrInstruction<LlvmValue> {
        match term {
            Terminator::Ret(ret) => IrInstruction::ret(ret.return_operand.as_ref().map(|op| self.value(op))),
            Terminator::CondBr(condbr) => IrInstruction::other(None, self.values(vec![&condbr.condition])),
            Terminator::Switch(switch) => IrInstruction::other(None, self.values(vec![&switch.operand])),
            Terminator::IndirectBr(ibr) => IrInstruction::other(None, self.values(vec![&ibr.operand])),
            Terminator::Resume(resume) => IrInstruction::other(None, self.values(vec![&resume.operand])),
            Terminator::Invoke(invoke) => IrInstruction::call(
                self.result(&invoke.result, self.types.type_of(invoke)),
                self.values(invoke.arguments.iter().map(|(op, _)| op)),
            ),
            _ => IrInstruction::other(None, vec![]),
        }
    }

    /// The function's instruction stream, in instruction-id order
    fn function(&self, f: &Function) -> Vec<IrInstruction<LlvmValue>> {
        f.basic_blocks
            .iter()
            .flat_map(|bb| {
                bb.instrs
                    .iter()
                    .map(move |inst| self.instruction(inst))
                    .chain(std::iter::once(self.terminator(&bb.term)))
            })
            .collect()
    }
}

/// Lower `f`, a function of `module`, into the planner's instruction stream
pub fn instruction_stream(module: &Module, f: &Function) -> Vec<IrInstruction<LlvmValue>> {
    Lowering { types: &module.types }.function(f)
}

/// Map from instruction id to (basic block index, index within the block).
/// A terminator's index is the number of non-terminator instructions in its
/// block, which is where an instruction inserted before it goes.
fn instruction_positions(f: &Function) -> Vec<(usize, usize)> {
    f.basic_blocks
        .iter()
        .enumerate()
        .flat_map(|(bb_idx, bb)| (0 ..= bb.instrs.len()).map(move |i| (bb_idx, i)))
        .collect()
}

struct PendingCall {
    before: usize,
    format: FormatId,
    operands: Vec<Operand>,
}

/// A `TraceInjector` for llvm-ir modules. Calls are collected first and then
/// written into the `Module` by `apply`, so instruction ids stay valid no
/// matter how many calls are inserted.
pub struct LlvmInjector {
    trace_fn: String,
    formats: FormatPool,
    pending: HashMap<String, Vec<PendingCall>>,
}

impl LlvmInjector {
    pub fn new(config: &Config) -> Self {
        Self {
            trace_fn: config.trace_fn.clone(),
            formats: FormatPool::new(),
            pending: HashMap::new(),
        }
    }

    /// Name of the global holding the format string with the given id
    fn format_global_name(id: FormatId) -> Name {
        Name::from(format!(".trc.fmt.{}", id.0))
    }

    /// Write all collected calls into `module`, plus one private constant
    /// global per distinct format string. The trace entry point is declared
    /// as `void (i8*, ...)` if the module doesn't already have it.
    pub fn apply(self, module: &mut Module) {
        let i8_ty = module.types.i8();
        let i8_ptr_ty = module.types.pointer_to(i8_ty.clone());
        let trace_fn_ty = module.types.func_type(module.types.void(), vec![i8_ptr_ty.clone()], true);

        if !self.pending.is_empty() && module.get_func_by_name(&self.trace_fn).is_none() {
            debug!("Declaring trace entry point {:?}", self.trace_fn);
            let mut decl = Function::new(self.trace_fn.as_str());
            decl.parameters = vec![Parameter {
                name: Name::from(0),
                ty: i8_ptr_ty,
                attributes: vec![],
            }];
            decl.is_var_arg = true;
            decl.return_type = module.types.void();
            decl.linkage = Linkage::External;
            module.functions.push(decl);
        }

        let mut format_tys = HashMap::new();
        for (id, format) in self.formats.iter() {
            let mut bytes: Vec<u8> = format.bytes().collect();
            bytes.push(0);
            let array_ty = module.types.array_of(i8_ty.clone(), bytes.len());
            let global_ty = module.types.pointer_to(array_ty.clone());
            let initializer = ConstantRef::new(Constant::Array {
                element_type: i8_ty.clone(),
                elements: bytes
                    .into_iter()
                    .map(|b| ConstantRef::new(Constant::Int { bits: 8, value: b.into() }))
                    .collect(),
            });
            module.global_vars.push(GlobalVariable {
                name: Self::format_global_name(id),
                linkage: Linkage::Private,
                visibility: Visibility::Default,
                is_constant: true,
                ty: global_ty,
                addr_space: 0,
                dll_storage_class: DLLStorageClass::Default,
                thread_local_mode: ThreadLocalMode::NotThreadLocal,
                unnamed_addr: Some(UnnamedAddr::Global),
                initializer: Some(initializer),
                section: None,
                comdat: None,
                alignment: 1,
                debugloc: None,
            });
            format_tys.insert(id, array_ty);
        }

        let mut pending = self.pending;
        for f in module.functions.iter_mut() {
            let calls = match pending.remove(&f.name) {
                Some(calls) => calls,
                None => continue,
            };
            let positions = instruction_positions(f);
            // insert back to front so earlier positions stay put
            for call in calls.into_iter().sorted_by_key(|call| Reverse(call.before)) {
                let (bb_idx, inst_idx) = positions[call.before];
                let format_ptr = Constant::GetElementPtr(constant::GetElementPtr {
                    address: ConstantRef::new(Constant::GlobalReference {
                        name: Self::format_global_name(call.format),
                        ty: format_tys[&call.format].clone(),
                    }),
                    indices: vec![
                        ConstantRef::new(Constant::Int { bits: 64, value: 0 }),
                        ConstantRef::new(Constant::Int { bits: 64, value: 0 }),
                    ],
                    in_bounds: true,
                });
                let arguments = std::iter::once(Operand::ConstantOperand(ConstantRef::new(format_ptr)))
                    .chain(call.operands.into_iter())
                    .map(|op| (op, vec![]))
                    .collect();
                let trace_call = Instruction::Call(instruction::Call {
                    function: Either::Right(Operand::ConstantOperand(ConstantRef::new(
                        Constant::GlobalReference {
                            name: Name::from(self.trace_fn.as_str()),
                            ty: trace_fn_ty.clone(),
                        },
                    ))),
                    arguments,
                    return_attributes: vec![],
                    dest: None,
                    function_attributes: vec![],
                    is_tail_call: false,
                    calling_convention: CallingConvention::C,
                    debugloc: None,
                });
                f.basic_blocks[bb_idx].instrs.insert(inst_idx, trace_call);
            }
        }
    }
}

impl TraceInjector<LlvmValue> for LlvmInjector {
    fn insert_trace_call(&mut self, function: &str, before: usize, format: &str, operands: &[LlvmValue]) -> Result<()> {
        let format = self.formats.intern(format);
        self.pending.entry(function.into()).or_default().push(PendingCall {
            before,
            format,
            operands: operands.iter().map(|v| v.operand().clone()).collect(),
        });
        Ok(())
    }
}

/// Instrument every function of `module` that `db` has taint facts for.
///
/// If any function fails under `FailurePolicy::AbortRun`, the module is left
/// untouched.
pub fn instrument_module(module: &mut Module, db: &TaintDatabase, config: &Config) -> Result<InstrumentStats> {
    let lowered: Vec<(String, Vec<IrInstruction<LlvmValue>>)> = module
        .functions
        .iter()
        .filter(|f| !f.name.starts_with("llvm.") && !f.basic_blocks.is_empty())
        .filter(|f| db.lookup(&f.name).is_some())
        .map(|f| (f.name.clone(), instruction_stream(module, f)))
        .collect();
    debug!("Instrumenting {} function(s) of module {:?}", lowered.len(), module.name);

    let mut injector = LlvmInjector::new(config);
    let stats = instrument_functions(db, config, lowered, &mut injector)?;
    injector.apply(module);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan_function;
    use crate::taint_database::{CallSiteTaint, FunctionTaintFacts};
    use llvm_ir::terminator;

    fn local(types: &Types, name: &str) -> Operand {
        Operand::LocalOperand {
            name: Name::from(name),
            ty: types.i32(),
        }
    }

    fn callee(types: &Types, result_ty: TypeRef) -> Operand {
        Operand::ConstantOperand(ConstantRef::new(Constant::GlobalReference {
            name: Name::from("callee"),
            ty: types.func_type(result_ty, vec![], true),
        }))
    }

    fn call(types: &Types, args: Vec<Operand>) -> Instruction {
        Instruction::Call(instruction::Call {
            function: Either::Right(callee(types, types.void())),
            arguments: args.into_iter().map(|op| (op, vec![])).collect(),
            return_attributes: vec![],
            dest: None,
            function_attributes: vec![],
            is_tail_call: false,
            calling_convention: CallingConvention::C,
            debugloc: None,
        })
    }

    #[test]
    fn metadata_arguments_keep_their_position() {
        let types = Types::blank_for_testing();
        let lowering = Lowering { types: &types };
        let inst = lowering.instruction(&call(&types, vec![Operand::MetadataOperand, local(&types, "a")]));
        assert_eq!(inst.kind, InstKind::Call);
        assert_eq!(inst.uses.len(), 2);
        assert_eq!(inst.uses[0].class, ValueClass::Unsupported);
        assert_eq!(inst.uses[1].name.as_deref(), Some("a"));
        assert_eq!(inst.uses[1].handle.operand(), &local(&types, "a"));
    }

    #[test]
    fn call_with_metadata_argument_is_not_recorded() {
        let types = Types::blank_for_testing();
        let lowering = Lowering { types: &types };
        let instructions = vec![
            lowering.instruction(&call(&types, vec![Operand::MetadataOperand, local(&types, "a")])),
            lowering.terminator(&Terminator::Unreachable(terminator::Unreachable { debugloc: None })),
        ];
        let mut facts = FunctionTaintFacts::default();
        facts.tainted_instruction_ids.insert(0);
        // argument 2 is the local, but the metadata argument would also have
        // to be recorded
        facts.call_site_taint.insert(0, CallSiteTaint {
            in_taint_bits: 0,
            out_taint_bits: 0x4000_0000,
            callees: Default::default(),
        });
        let err = plan_function("f", &facts, &Config::default(), instructions).unwrap_err();
        assert!(matches!(err, crate::Error::Consistency { inst_id: 0, .. }));
    }

    #[test]
    fn invoke_result_is_its_def() {
        let types = Types::blank_for_testing();
        let lowering = Lowering { types: &types };
        let invoke = Terminator::Invoke(terminator::Invoke {
            function: Either::Right(callee(&types, types.i32())),
            arguments: vec![(local(&types, "a"), vec![])],
            return_attributes: vec![],
            result: Name::from("r"),
            return_label: Name::from("ok"),
            exception_label: Name::from("unwind"),
            function_attributes: vec![],
            calling_convention: CallingConvention::C,
            debugloc: None,
        });
        let inst = lowering.terminator(&invoke);
        assert_eq!(inst.kind, InstKind::Call);
        let def = inst.def.expect("invoke with a result should define it");
        assert_eq!(def.name.as_deref(), Some("r"));
        assert_eq!(def.class, ValueClass::Integer);
        assert_eq!(inst.uses.len(), 1);
    }
}
