use std::path::PathBuf;

/// Name of the metadata file the taint analysis writes by default
pub const DEFAULT_METADATA_PATH: &str = "LdaBin.bin";

/// Name of the runtime entry point that injected calls target by default
pub const DEFAULT_TRACE_FN: &str = "TRC_track";

/// The trace entry point accepts a format string plus at most this many
/// values.
pub const MAX_TRACE_ARGS: usize = 3;

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// Where to read the binary taint metadata from.
    pub metadata_path: PathBuf,

    /// Symbol name of the trace entry point that instrumented code calls.
    pub trace_fn: String,

    /// Maximum number of values a single trace record may capture (the
    /// primary value plus the instruction's other used values).
    /// An instruction needing more than this is rejected, never truncated.
    /// Values above `MAX_TRACE_ARGS` are clamped to it.
    pub max_operands: usize,

    /// What to do when instrumenting one function fails.
    pub failure_policy: FailurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_path: PathBuf::from(DEFAULT_METADATA_PATH),
            trace_fn: DEFAULT_TRACE_FN.into(),
            max_operands: MAX_TRACE_ARGS,
            failure_policy: FailurePolicy::AbortRun,
        }
    }
}

impl Config {
    /// The operand limit actually enforced
    pub fn operand_limit(&self) -> usize {
        self.max_operands.min(MAX_TRACE_ARGS)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FailurePolicy {
    /// Any per-function failure aborts the entire instrumentation run.
    AbortRun,
    /// A per-function failure abandons that function (none of its planned
    /// calls are injected) and the run continues with the next function.
    /// Metadata format errors still abort the run.
    SkipFunction,
}
