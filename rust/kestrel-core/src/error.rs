//! Numeric failure codes.
//!
//! Primitive and runtime failures are reported errno-style: the failing
//! operation hands one of these codes to the calling convention's failure
//! path, where the language's own guard machinery consumes it as an integer.

use strum::{Display, EnumIter, FromRepr, IntoStaticStr};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, FromRepr, IntoStaticStr,
)]
#[repr(u32)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCode {
    CannotDivideByZero = 1,
    CannotReadUnassignedVariable = 2,
    CannotStoreIncorrectlyTypedValue = 3,
    NoMethodDefinition = 4,
    AmbiguousMethodDefinition = 5,
    ForwardMethodDefinition = 6,
    AbstractMethodDefinition = 7,
    IncorrectArgumentType = 8,
    IncorrectNumberOfArguments = 9,
    ResultTypeMismatch = 10,
    SubscriptOutOfBounds = 11,
    CannotSwapMismatchedValue = 12,
    FiberTerminated = 13,
    IoError = 14,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::from_repr(code)
    }

    /// The failure value as seen by running code.
    pub fn as_value(self) -> crate::Value {
        crate::Value::from(self.code() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_codes_round_trip() {
        for code in ErrorCode::iter() {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
    }

    #[test]
    fn test_display_is_kebab_case() {
        assert_eq!(
            ErrorCode::CannotDivideByZero.to_string(),
            "cannot-divide-by-zero"
        );
    }
}
