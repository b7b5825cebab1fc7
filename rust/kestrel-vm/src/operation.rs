//! The closed catalog of level-two operations.
//!
//! Each operation declares the operand kinds it takes, in order. Behaviour
//! lives in two matches over this enum: [`crate::execute`] for the runtime
//! effect and [`crate::type_flow`] for static type propagation.

use crate::operand::OperandKind;
use strum::{Display, EnumIter, IntoStaticStr};

use OperandKind::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum L2Operation {
    /// First instruction of every chunk.
    EnterChunk,
    /// A named position; no runtime effect.
    Label,
    MoveConstant,
    MoveIntConstant,
    MoveFloatConstant,
    Move,
    /// Read one of the running function's captured outers.
    MoveOuter,
    BoxInt,
    JumpIfUnboxInt,
    BoxFloat,
    JumpIfUnboxFloat,
    AddIntToInt,
    SubtractIntFromInt,
    MultiplyIntByInt,
    DivideIntByInt,
    AddFloatToFloat,
    JumpIfLessThanInt,
    Jump,
    JumpIfKindOfConstant,
    JumpIfEqualsConstant,
    CreateTuple,
    TupleAtConstant,
    CreateVariable,
    GetVariable,
    SetVariable,
    CreateFunction,
    LookupByValues,
    Invoke,
    InvokeConstantFunction,
    RunInfalliblePrimitive,
    AttemptPrimitive,
    /// Join point: the first source written on the path taken.
    Phi,
    Return,
    ReportFailure,
    DecrementCounterAndReoptimize,
    InterpretLevelOne,
    Unreachable,
}

impl L2Operation {
    /// Operand kinds, in order.
    pub fn signature(self) -> &'static [OperandKind] {
        match self {
            L2Operation::EnterChunk
            | L2Operation::DecrementCounterAndReoptimize
            | L2Operation::InterpretLevelOne
            | L2Operation::Unreachable => &[],
            L2Operation::Label => &[Comment],
            L2Operation::MoveConstant => &[Constant, WriteBoxed],
            L2Operation::MoveIntConstant => &[Immediate, WriteInt],
            L2Operation::MoveFloatConstant => &[Constant, WriteFloat],
            L2Operation::Move => &[ReadBoxed, WriteBoxed],
            L2Operation::MoveOuter => &[Immediate, WriteBoxed],
            L2Operation::BoxInt => &[ReadInt, WriteBoxed],
            L2Operation::JumpIfUnboxInt => &[ReadBoxed, WriteInt, Pc, Pc],
            L2Operation::BoxFloat => &[ReadFloat, WriteBoxed],
            L2Operation::JumpIfUnboxFloat => &[ReadBoxed, WriteFloat, Pc, Pc],
            L2Operation::AddIntToInt
            | L2Operation::SubtractIntFromInt
            | L2Operation::MultiplyIntByInt
            | L2Operation::DivideIntByInt => &[ReadInt, ReadInt, WriteInt, Pc, Pc],
            L2Operation::AddFloatToFloat => &[ReadFloat, ReadFloat, WriteFloat],
            L2Operation::JumpIfLessThanInt => &[ReadInt, ReadInt, Pc, Pc],
            L2Operation::Jump => &[Pc],
            L2Operation::JumpIfKindOfConstant | L2Operation::JumpIfEqualsConstant => {
                &[ReadBoxed, Constant, Pc, Pc]
            }
            L2Operation::CreateTuple => &[ReadBoxedVector, WriteBoxed],
            L2Operation::TupleAtConstant => &[ReadBoxed, Immediate, WriteBoxed],
            L2Operation::CreateVariable => &[Constant, WriteBoxed],
            L2Operation::GetVariable => &[ReadBoxed, WriteBoxed],
            L2Operation::SetVariable => &[ReadBoxed, ReadBoxed],
            L2Operation::CreateFunction => &[Constant, ReadBoxedVector, WriteBoxed],
            L2Operation::LookupByValues => &[Selector, ReadBoxedVector, WriteBoxed],
            L2Operation::Invoke => &[ReadBoxed, ReadBoxedVector, WriteBoxed],
            L2Operation::InvokeConstantFunction => &[Constant, ReadBoxedVector, WriteBoxed],
            L2Operation::RunInfalliblePrimitive => &[Primitive, ReadBoxedVector, WriteBoxed],
            L2Operation::AttemptPrimitive => &[Primitive, ReadBoxedVector, WriteBoxed, Pc],
            L2Operation::Phi => &[ReadBoxedVector, WriteBoxed],
            L2Operation::Return | L2Operation::ReportFailure => &[ReadBoxed],
        }
    }

    /// Whether control may leave other than by falling through.
    pub fn alters_control_flow(self) -> bool {
        self.signature().contains(&Pc) || self.is_terminal()
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            L2Operation::Jump
                | L2Operation::JumpIfUnboxInt
                | L2Operation::JumpIfUnboxFloat
                | L2Operation::AddIntToInt
                | L2Operation::SubtractIntFromInt
                | L2Operation::MultiplyIntByInt
                | L2Operation::DivideIntByInt
                | L2Operation::JumpIfLessThanInt
                | L2Operation::JumpIfKindOfConstant
                | L2Operation::JumpIfEqualsConstant
                | L2Operation::Return
                | L2Operation::ReportFailure
                | L2Operation::InterpretLevelOne
                | L2Operation::Unreachable
        )
    }

    /// Whether removing an instruction whose outputs are unused would change
    /// observable behaviour.
    pub fn has_side_effect(self) -> bool {
        matches!(
            self,
            L2Operation::EnterChunk
                | L2Operation::SetVariable
                | L2Operation::GetVariable
                | L2Operation::LookupByValues
                | L2Operation::Invoke
                | L2Operation::InvokeConstantFunction
                | L2Operation::AttemptPrimitive
                | L2Operation::DecrementCounterAndReoptimize
                | L2Operation::TupleAtConstant
        ) || self.alters_control_flow()
    }

    /// Pure tests whose outcome type propagation may decide statically.
    pub fn is_pure_test(self) -> bool {
        matches!(
            self,
            L2Operation::JumpIfKindOfConstant
                | L2Operation::JumpIfEqualsConstant
                | L2Operation::JumpIfLessThanInt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_terminal_operations_alter_control_flow() {
        for op in L2Operation::iter() {
            if op.is_terminal() {
                assert!(op.alters_control_flow(), "{}", op);
            }
        }
    }

    #[test]
    fn test_branches_name_both_edges() {
        for op in L2Operation::iter().filter(|op| op.is_pure_test()) {
            let edges = op.signature().iter().filter(|k| **k == Pc).count();
            assert_eq!(edges, 2, "{}", op);
        }
    }
}
