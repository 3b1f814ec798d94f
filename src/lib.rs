#[macro_use]
mod error;
pub use error::{Error, Result};

pub mod arg_resolver;
mod config;
pub use config::{Config, FailurePolicy, DEFAULT_METADATA_PATH, DEFAULT_TRACE_FN, MAX_TRACE_ARGS};
pub mod injector;
pub use injector::{instrument_function, instrument_functions, FormatPool, InstrumentStats, RecordingInjector, TraceInjector};
pub mod ir;
pub use ir::{InstKind, IrInstruction, IrValue, ValueClass};
pub mod planner;
pub use planner::{plan_function, Decision, Emission, FunctionPlan, FunctionPlanner, PlannerState};
pub mod taint_database;
pub use taint_database::{CallSiteTaint, FunctionTaintFacts, TaintDatabase};
pub mod trace_sink;
pub use trace_sink::{TraceArg, TraceSink};

#[cfg(any(feature = "llvm-8", feature = "llvm-9", feature = "llvm-10", feature = "llvm-11"))]
pub mod llvm;
#[cfg(any(feature = "llvm-8", feature = "llvm-9", feature = "llvm-10", feature = "llvm-11"))]
pub use llvm::instrument_module;

/// Load the taint metadata named by `config` and instrument every function
/// in `functions` that it has facts for.
///
/// A malformed metadata file aborts the run before any function is touched.
pub fn load_and_instrument<V, F, I>(
    config: &Config,
    functions: F,
    injector: &mut impl TraceInjector<V>,
) -> Result<InstrumentStats>
where
    V: ir::ValueHandle,
    F: IntoIterator<Item = (String, I)>,
    I: IntoIterator<Item = IrInstruction<V>>,
{
    let db = TaintDatabase::load(&config.metadata_path)?;
    instrument_functions(&db, config, functions, injector)
}
