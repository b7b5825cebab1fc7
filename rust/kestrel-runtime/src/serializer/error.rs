use kestrel_core::{CodeError, ErrorCode};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializerError {
    /// The sink failed; the stream written so far is unusable.
    #[error("failed to write serialized stream: {0}")]
    Io(#[from] io::Error),
    #[error("cannot serialize {kind}: {reason}")]
    UnsupportedValue {
        kind: &'static str,
        reason: &'static str,
    },
    #[error("atom '{atom}' is not visible from module '{module}'")]
    ForeignAtom { atom: String, module: String },
}

#[derive(Debug, Error)]
pub enum DeserializerError {
    #[error("failed to read serialized stream: {0}")]
    Io(io::Error),
    #[error("malformed stream at byte {offset}: {reason}")]
    Malformed { offset: u64, reason: Malformed },
}

impl DeserializerError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, DeserializerError::Malformed { .. })
    }

    pub fn malformed_reason(&self) -> Option<&Malformed> {
        match self {
            DeserializerError::Malformed { reason, .. } => Some(reason),
            DeserializerError::Io(_) => None,
        }
    }
}

/// What made a stream unreadable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Malformed {
    #[error("unknown operation {0}")]
    UnknownOperation(u8),
    #[error("stream ends inside an instruction")]
    UnexpectedEnd,
    #[error("invalid compressed integer prefix {0:#04x}")]
    BadCompressedInt(u8),
    #[error("back-reference {index} but only {written} objects were written")]
    BadBackReference { index: u32, written: usize },
    #[error("unknown special object {0}")]
    UnknownSpecialObject(u8),
    #[error("unknown special atom {0}")]
    UnknownSpecialAtom(u8),
    #[error("string operand is not valid utf-8")]
    InvalidUtf8,
    #[error("unknown module '{0}'")]
    UnknownModule(String),
    #[error("{operation} expects {expected} operand")]
    WrongKind {
        operation: &'static str,
        expected: &'static str,
    },
    #[error("map has a key without a value")]
    UnpairedMapKey,
    #[error("function captures {actual} outers but its code declares {expected}")]
    OuterCount { expected: usize, actual: usize },
    #[error("invalid compiled code: {0}")]
    BadCode(String),
    #[error("cannot assign variable: {0}")]
    BadAssignment(ErrorCode),
}

impl From<CodeError> for Malformed {
    fn from(e: CodeError) -> Self {
        Malformed::BadCode(e.to_string())
    }
}
