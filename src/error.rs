use thiserror::Error;

/// Build an `Error::Consistency` for the given function and instruction id.
macro_rules! consistency_error {
    ($func:expr, $inst_id:expr, $msg:expr) => {
        crate::error::Error::Consistency {
            function: $func.to_string(),
            inst_id: $inst_id,
            message: $msg.to_string(),
        }
    };

    ($func:expr, $inst_id:expr, $fmt:expr, $($arg:tt)*) => {
        crate::error::Error::Consistency {
            function: $func.to_string(),
            inst_id: $inst_id,
            message: format!($fmt, $($arg)*),
        }
    };
}

/// Every failure this crate can report.
///
/// None of these are warnings: each one means the metadata, the host IR, or
/// the runtime sink broke its contract, and the trace it would produce can no
/// longer be trusted.
#[derive(Error, Debug)]
pub enum Error {
    /// The taint metadata file is malformed or truncated.
    /// Aborts the whole instrumentation run before any function is processed.
    #[error("Malformed taint metadata: {message}")]
    FileFormat {
        /// What was wrong, including which section was being read
        message: String,
    },

    /// The taint metadata file could not be opened, read, or written.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// The taint database and the instruction stream disagree, or a value
    /// has a type that cannot be recorded.
    /// Fatal for the function being instrumented.
    #[error("In function {function:?}, instruction {inst_id}: {message}")]
    Consistency {
        /// Function being instrumented
        function: String,
        /// Per-function instruction id the problem was found at
        inst_id: usize,
        /// What went wrong
        message: String,
    },

    /// The host's injector failed while inserting the trace calls of a
    /// function. Calls it already inserted can't be taken back, so the
    /// function may be partly instrumented and the run always aborts.
    #[error("Injecting trace calls into {function:?} failed: {source}")]
    Injection {
        /// Function being instrumented
        function: String,
        /// What the injector reported
        source: Box<Error>,
    },

    /// Every slot of the trace sink holds a record that was never drained.
    #[error("Trace sink is full ({capacity} slots)")]
    Capacity {
        /// Number of slots in the sink
        capacity: usize,
    },

    /// A `SlotHandle` was handed to a sink other than the one that issued it.
    #[error("Slot {index} was not acquired from this trace sink")]
    ForeignSlot {
        /// Index the handle refers to in its own sink
        index: usize,
    },

    /// `trace_sink::init` was called more than once.
    #[error("Trace sink was already initialized")]
    AlreadyInitialized,

    /// A record was pushed before `trace_sink::init` was called.
    #[error("Trace sink was used before being initialized")]
    NotInitialized,
}

impl Error {
    pub(crate) fn file_format(message: impl Into<String>) -> Self {
        Error::FileFormat {
            message: message.into(),
        }
    }

    /// Is this error fatal only to the function that raised it (as opposed to
    /// the whole run)
    pub fn is_per_function(&self) -> bool {
        matches!(self, Error::Consistency { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
