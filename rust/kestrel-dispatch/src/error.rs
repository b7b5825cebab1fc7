use kestrel_core::ErrorCode;
use thiserror::Error;

/// Failure to find a single most specific definition.
///
/// The two cases are kept apart all the way to the running fiber: callers
/// must be able to tell "nothing applies" from "several apply equally".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("no method definition of '{name}' applies to the arguments")]
    NoMethod { name: String },
    #[error("{count} definitions of '{name}' apply equally well to the arguments")]
    Ambiguous { name: String, count: usize },
    #[error("'{name}' takes {expected} arguments, got {actual}")]
    WrongArity {
        name: String,
        expected: usize,
        actual: usize,
    },
}

impl LookupError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LookupError::NoMethod { .. } => ErrorCode::NoMethodDefinition,
            LookupError::Ambiguous { .. } => ErrorCode::AmbiguousMethodDefinition,
            LookupError::WrongArity { .. } => ErrorCode::IncorrectNumberOfArguments,
        }
    }
}

/// Rejected changes to a method's definition set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("'{name}' takes {expected} arguments but the definition takes {actual}")]
    ArityMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("'{name}' already has a definition for {signature}")]
    DuplicateDefinition { name: String, signature: String },
    #[error("'{name}' has no definition for {signature}")]
    NoSuchDefinition { name: String, signature: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_distinguish_no_method_from_ambiguous() {
        let none = LookupError::NoMethod { name: "_+_".into() };
        let many = LookupError::Ambiguous {
            name: "_+_".into(),
            count: 2,
        };
        assert_ne!(none.to_string(), many.to_string());
        assert_ne!(none.error_code(), many.error_code());
    }
}
