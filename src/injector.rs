use crate::config::{Config, FailurePolicy, MAX_TRACE_ARGS};
use crate::error::{Error, Result};
use crate::ir::{IrInstruction, ValueHandle};
use crate::planner::{Emission, FunctionPlan, FunctionPlanner};
use crate::taint_database::TaintDatabase;
use log::{debug, warn};
use std::collections::HashMap;

/// The host's code-insertion primitive.
pub trait TraceInjector<V> {
    /// Insert a call to the trace entry point immediately before instruction
    /// `before` of `function`. The call passes `format` (as a read-only
    /// constant shared by every call with the same format) followed by
    /// `operands`, in order.
    ///
    /// `before` is an instruction id in the original, uninstrumented
    /// numbering; calls inserted earlier don't shift it.
    ///
    /// A failure here is fatal to the whole run: it surfaces as
    /// `Error::Injection`, which `FailurePolicy::SkipFunction` doesn't cover.
    fn insert_trace_call(&mut self, function: &str, before: usize, format: &str, operands: &[V]) -> Result<()>;
}

/// Index of a format string in a `FormatPool`
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct FormatId(pub usize);

/// Deduplicated format strings for one module: equal strings, from any
/// function, share one entry.
#[derive(Clone, Debug, Default)]
pub struct FormatPool {
    ids: HashMap<String, FormatId>,
    formats: Vec<String>,
}

impl FormatPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the id for `format`, adding it to the pool if it's new
    pub fn intern(&mut self, format: &str) -> FormatId {
        if let Some(&id) = self.ids.get(format) {
            return id;
        }
        let id = FormatId(self.formats.len());
        self.formats.push(format.to_owned());
        self.ids.insert(format.to_owned(), id);
        id
    }

    pub fn get(&self, id: FormatId) -> Option<&str> {
        self.formats.get(id.0).map(|s| s.as_str())
    }

    /// Iterate over the pooled strings, in order of first use
    pub fn iter(&self) -> impl Iterator<Item = (FormatId, &str)> {
        self.formats.iter().enumerate().map(|(i, s)| (FormatId(i), s.as_str()))
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

/// A trace call recorded by a `RecordingInjector`
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct InjectedCall<V> {
    pub function: String,
    pub before: usize,
    pub format: FormatId,
    pub operands: Vec<V>,
}

/// A `TraceInjector` which doesn't touch any IR, but records the calls it
/// was asked to insert. Useful for hosts that apply the calls themselves
/// later, and for inspecting a run.
#[derive(Clone, Debug)]
pub struct RecordingInjector<V> {
    pub formats: FormatPool,
    pub calls: Vec<InjectedCall<V>>,
}

impl<V> RecordingInjector<V> {
    pub fn new() -> Self {
        Self {
            formats: FormatPool::new(),
            calls: Vec::new(),
        }
    }

    /// Iterate over the recorded calls for one function, with their format
    /// strings resolved
    pub fn calls_in<'s>(&'s self, function: &'s str) -> impl Iterator<Item = (usize, &'s str, &'s [V])> + 's {
        self.calls
            .iter()
            .filter(move |call| call.function == function)
            .map(move |call| {
                let format = self.formats.get(call.format).unwrap_or("");
                (call.before, format, call.operands.as_slice())
            })
    }
}

impl<V> Default for RecordingInjector<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TraceInjector<V> for RecordingInjector<V> {
    fn insert_trace_call(&mut self, function: &str, before: usize, format: &str, operands: &[V]) -> Result<()> {
        let format = self.formats.intern(format);
        self.calls.push(InjectedCall {
            function: function.into(),
            before,
            format,
            operands: operands.to_vec(),
        });
        Ok(())
    }
}

/// Counters describing an instrumentation run
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct InstrumentStats {
    /// Functions that had taint facts and were instrumented
    pub functions: usize,
    /// Decisions made, including ones that ended up not being injected
    pub decisions: usize,
    /// Trace calls actually inserted
    pub calls: usize,
    /// Functions abandoned under `FailurePolicy::SkipFunction`
    pub skipped_functions: Vec<String>,
}

impl InstrumentStats {
    fn absorb(&mut self, other: InstrumentStats) {
        self.functions += other.functions;
        self.decisions += other.decisions;
        self.calls += other.calls;
        self.skipped_functions.extend(other.skipped_functions);
    }
}

/// Plan and inject the trace calls for one function.
///
/// `instructions` must be the function's complete instruction stream in
/// program order. Functions with no taint facts are left alone.
///
/// If planning or the operand checks fail, nothing is injected. If the
/// injector itself fails part-way, the error is `Error::Injection` and the
/// run must not continue, since some calls may already be in place.
pub fn instrument_function<V: ValueHandle>(
    db: &TaintDatabase,
    config: &Config,
    function: &str,
    instructions: impl IntoIterator<Item = IrInstruction<V>>,
    injector: &mut impl TraceInjector<V>,
) -> Result<InstrumentStats> {
    let facts = match db.lookup(function) {
        Some(facts) => facts,
        None => {
            debug!("No taint facts for {:?}, leaving it alone", function);
            return Ok(InstrumentStats::default());
        },
    };
    debug!("Instrumenting function {:?}", function);
    let plan = FunctionPlanner::new(function, facts, config).plan(instructions)?;
    inject_plan(function, &plan, injector)
}

/// Instrument every function in `functions`, applying the configured
/// `FailurePolicy` to per-function failures.
pub fn instrument_functions<V, F, I>(
    db: &TaintDatabase,
    config: &Config,
    functions: F,
    injector: &mut impl TraceInjector<V>,
) -> Result<InstrumentStats>
where
    V: ValueHandle,
    F: IntoIterator<Item = (String, I)>,
    I: IntoIterator<Item = IrInstruction<V>>,
{
    let mut stats = InstrumentStats::default();
    for (function, instructions) in functions {
        match instrument_function(db, config, &function, instructions, injector) {
            Ok(fn_stats) => stats.absorb(fn_stats),
            Err(e) if e.is_per_function() && config.failure_policy == FailurePolicy::SkipFunction => {
                warn!("Skipping function {:?}: {}", function, e);
                stats.skipped_functions.push(function);
            },
            Err(e) => return Err(e),
        }
    }
    Ok(stats)
}

/// Hand every emission of `plan` to the injector
fn inject_plan<V: ValueHandle>(
    function: &str,
    plan: &FunctionPlan<V>,
    injector: &mut impl TraceInjector<V>,
) -> Result<InstrumentStats> {
    // check everything up front, so a bad emission can't leave the function
    // half-instrumented
    for emission in &plan.emissions {
        check_operand_count(function, emission)?;
    }

    let mut stats = InstrumentStats {
        functions: 1,
        decisions: plan.decisions().count(),
        ..InstrumentStats::default()
    };
    for Emission { before, decision } in &plan.emissions {
        if decision.operands.is_empty() {
            debug!(
                "{:?} [{}]: nothing to record for {}, no call inserted",
                function, decision.inst_id, decision.format,
            );
            continue;
        }
        injector
            .insert_trace_call(function, *before, &decision.format, &decision.operands)
            .map_err(|e| Error::Injection {
                function: function.into(),
                source: Box::new(e),
            })?;
        stats.calls += 1;
    }
    Ok(stats)
}

/// The trace entry point takes 1 to `MAX_TRACE_ARGS` values. An empty
/// operand list is allowed here, and means no call is made at all.
fn check_operand_count<V>(function: &str, emission: &Emission<V>) -> Result<()> {
    let count = emission.decision.operands.len();
    if count > MAX_TRACE_ARGS {
        Err(consistency_error!(
            function,
            emission.decision.inst_id,
            "trace entry point takes at most {} values, got {}",
            MAX_TRACE_ARGS,
            count,
        ))
    } else {
        Ok(())
    }
}
