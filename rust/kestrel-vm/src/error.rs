use kestrel_core::ErrorCode;
use kestrel_dispatch::LookupError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VmError {
    /// A primitive or operation failed; the code is what running code sees.
    #[error("failed: {0}")]
    Failed(ErrorCode),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("stack overflow: call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("fiber terminated")]
    Terminated,
    #[error("unknown primitive {0}")]
    UnknownPrimitive(u16),
    #[error("interpreter has nothing to run")]
    Idle,
    #[error("interpreter is not suspended")]
    NotSuspended,
    #[error("cannot translate {name}: {reason}")]
    Untranslatable { name: String, reason: &'static str },
}

impl VmError {
    /// The numeric code handed to the language's failure machinery, if this
    /// error is visible to running code.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            VmError::Failed(code) => Some(*code),
            VmError::Lookup(e) => Some(e.error_code()),
            VmError::Terminated => Some(ErrorCode::FiberTerminated),
            VmError::StackOverflow(_)
            | VmError::UnknownPrimitive(_)
            | VmError::Idle
            | VmError::NotSuspended
            | VmError::Untranslatable { .. } => None,
        }
    }
}
