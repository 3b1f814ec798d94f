use crate::arg_resolver::newly_tainted_arg;
use crate::config::Config;
use crate::error::Result;
use crate::ir::{InstKind, IrInstruction, IrValue, ValueHandle};
use crate::taint_database::FunctionTaintFacts;
use log::{debug, trace, warn};
use std::collections::HashMap;

/// What to record for one tainted instruction
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Decision<V> {
    /// Id of the tainted instruction
    pub inst_id: usize,
    /// Format string handed to the trace entry point,
    /// e.g. `{[42]Val3:%u=Val1:%u,}`
    pub format: String,
    /// Values to pass after the format string, in order
    pub operands: Vec<V>,
}

/// A `Decision`, together with where its trace call goes
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Emission<V> {
    /// Id of the instruction the trace call is inserted in front of. This is
    /// always the instruction right after the tainted one.
    pub before: usize,
    pub decision: Decision<V>,
}

/// The result of planning one function
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct FunctionPlan<V> {
    /// Decisions in program order, each attached to the instruction after the
    /// one that triggered it
    pub emissions: Vec<Emission<V>>,
    /// Decision for the function's last instruction, if that one was tainted.
    /// There is nothing to insert it in front of, so it is dropped.
    pub discarded: Option<Decision<V>>,
    /// Number of instructions visited
    pub num_instructions: usize,
}

impl<V> FunctionPlan<V> {
    /// All decisions made, including a discarded trailing one
    pub fn decisions(&self) -> impl Iterator<Item = &Decision<V>> {
        self.emissions
            .iter()
            .map(|e| &e.decision)
            .chain(self.discarded.iter())
    }
}

/// Scratch state for planning a single function. A fresh one is made for
/// every function, so value names never leak across functions.
///
/// Decisions go through a two-slot pipeline: the decision for instruction
/// `n` waits in `pending` while instruction `n` is being observed, and is
/// released exactly once, when instruction `n + 1` is reached.
pub struct PlannerState<V> {
    /// Map from unnamed value to its `Val<N>` number
    value_ids: HashMap<V, usize>,
    /// Decision waiting for the next instruction
    pending: Option<Decision<V>>,
}

impl<V: ValueHandle> PlannerState<V> {
    pub fn new() -> Self {
        Self {
            value_ids: HashMap::new(),
            pending: None,
        }
    }

    /// Name used for `value` in format strings: its source-level name if it
    /// has one, otherwise `Val<N>`, numbered from 1 in order of first
    /// appearance within the function.
    pub fn value_name(&mut self, value: &IrValue<V>) -> String {
        if let Some(name) = &value.name {
            return name.clone();
        }
        let next_id = self.value_ids.len() + 1;
        let id = *self.value_ids.entry(value.handle.clone()).or_insert(next_id);
        format!("Val{}", id)
    }

    /// Move to the next instruction: returns the decision that must be
    /// materialized in front of it, if any.
    pub fn advance(&mut self) -> Option<Decision<V>> {
        self.pending.take()
    }

    /// Park the decision for the instruction currently being observed.
    pub fn set_pending(&mut self, decision: Decision<V>) {
        debug_assert!(self.pending.is_none(), "pending decision was never released");
        self.pending = Some(decision);
    }

    /// End of the function: returns whatever is still pending
    pub fn finish(self) -> Option<Decision<V>> {
        self.pending
    }
}

impl<V: ValueHandle> Default for PlannerState<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Plans the trace calls for one function
pub struct FunctionPlanner<'a> {
    function: &'a str,
    facts: &'a FunctionTaintFacts,
    config: &'a Config,
}

impl<'a> FunctionPlanner<'a> {
    pub fn new(function: &'a str, facts: &'a FunctionTaintFacts, config: &'a Config) -> Self {
        Self { function, facts, config }
    }

    /// Walk `instructions` (the whole function, in program order) and decide
    /// what to record at each tainted one.
    ///
    /// Any inconsistency between the taint facts and the instructions is an
    /// error for the whole function; no partial plan is returned.
    pub fn plan<V: ValueHandle>(
        &self,
        instructions: impl IntoIterator<Item = IrInstruction<V>>,
    ) -> Result<FunctionPlan<V>> {
        debug!("Planning function {:?}", self.function);
        let mut state = PlannerState::new();
        let mut emissions = Vec::new();
        let mut num_instructions = 0;

        for (inst_id, inst) in instructions.into_iter().enumerate() {
            num_instructions += 1;
            if let Some(decision) = state.advance() {
                emissions.push(Emission { before: inst_id, decision });
            }
            if self.facts.is_inst_tainted(inst_id) {
                let decision = self.decide(&mut state, inst_id, &inst)?;
                trace!("{:?} [{}]: {}", self.function, inst_id, decision.format);
                state.set_pending(decision);
            }
        }

        let discarded = state.finish();
        if let Some(decision) = &discarded {
            debug!(
                "{:?}: dropping decision for final instruction {}, nothing follows it",
                self.function, decision.inst_id,
            );
        }
        if let Some(&last_tainted) = self.facts.tainted_instruction_ids.iter().next_back() {
            if last_tainted >= num_instructions {
                warn!(
                    "{:?}: tainted instruction id {} is past the end of the function ({} instructions)",
                    self.function, last_tainted, num_instructions,
                );
            }
        }

        Ok(FunctionPlan {
            emissions,
            discarded,
            num_instructions,
        })
    }

    /// Build the decision for the tainted instruction `inst`
    fn decide<V: ValueHandle>(
        &self,
        state: &mut PlannerState<V>,
        inst_id: usize,
        inst: &IrInstruction<V>,
    ) -> Result<Decision<V>> {
        let mut format = format!("{{[{}]", inst_id);
        let mut operands = Vec::new();

        let primary = if let Some(def) = &inst.def {
            Some(def)
        } else if inst.is_return() {
            format.push_str("Ret=");
            None
        } else {
            Some(self.newly_tainted_use(inst_id, inst)?)
        };

        if let Some(primary) = primary {
            let name = state.value_name(primary);
            format.push_str(&name);
            format.push(':');
            format.push_str(self.marker(inst_id, primary, &name)?);
            format.push('=');
            operands.push(primary.handle.clone());
        }

        let primary_handle = primary.map(|p| &p.handle);
        for used in &inst.uses {
            if Some(&used.handle) == primary_handle {
                continue;
            }
            let name = state.value_name(used);
            format.push_str(&name);
            format.push(':');
            format.push_str(self.marker(inst_id, used, &name)?);
            format.push(',');
            operands.push(used.handle.clone());
        }
        format.push('}');

        let limit = self.config.operand_limit();
        if operands.len() > limit {
            return Err(consistency_error!(
                self.function,
                inst_id,
                "recording needs {} values but a trace record holds at most {} ({})",
                operands.len(),
                limit,
                format,
            ));
        }

        Ok(Decision {
            inst_id,
            format,
            operands,
        })
    }

    /// For an instruction with no result: the argument the call newly
    /// tainted, according to the call site's taint bits
    fn newly_tainted_use<'i, V: ValueHandle>(
        &self,
        inst_id: usize,
        inst: &'i IrInstruction<V>,
    ) -> Result<&'i IrValue<V>> {
        if inst.kind != InstKind::Call {
            debug!(
                "{:?} [{}]: tainted instruction without a result is not a call; treating it as a call site",
                self.function, inst_id,
            );
        }
        let cst = self.facts.get_call_site_taint(inst_id).ok_or_else(|| {
            consistency_error!(self.function, inst_id, "instruction is tainted but has neither a result nor call-site taint facts")
        })?;
        let position = newly_tainted_arg(cst.in_taint_bits, cst.out_taint_bits).ok_or_else(|| {
            consistency_error!(
                self.function,
                inst_id,
                "call site taints no new argument (in {:#010x}, out {:#010x})",
                cst.in_taint_bits,
                cst.out_taint_bits,
            )
        })?;
        inst.uses.get(position as usize - 1).ok_or_else(|| {
            consistency_error!(
                self.function,
                inst_id,
                "call site taints argument {} but the call only has {} argument(s)",
                position,
                inst.uses.len(),
            )
        })
    }

    fn marker<V>(&self, inst_id: usize, value: &IrValue<V>, name: &str) -> Result<&'static str> {
        value.class.format_marker().ok_or_else(|| {
            consistency_error!(self.function, inst_id, "value {} has a type that cannot be recorded", name)
        })
    }
}

/// Plan one function: shorthand for `FunctionPlanner::new(..).plan(..)`
pub fn plan_function<V: ValueHandle>(
    function: &str,
    facts: &FunctionTaintFacts,
    config: &Config,
    instructions: impl IntoIterator<Item = IrInstruction<V>>,
) -> Result<FunctionPlan<V>> {
    FunctionPlanner::new(function, facts, config).plan(instructions)
}
