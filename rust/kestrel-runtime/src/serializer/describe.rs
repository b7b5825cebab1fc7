//! Lists the instructions of a stream without rebuilding any values.

use super::error::{DeserializerError, Malformed};
use super::operation::{Operand, SerializerOperation, StreamReader};
use kestrel_core::{SpecialAtom, SpecialObject};
use serde::Serialize;
use std::fmt;
use strum::IntoEnumIterator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescribedInstruction {
    /// Byte offset of the opcode.
    pub offset: u64,
    /// Index of the object the instruction produces, if any.
    pub index: Option<u32>,
    pub operation: SerializerOperation,
    pub operands: Vec<Operand<u32>>,
    /// Name of the special object or atom, for special instructions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special: Option<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamDescription {
    pub instructions: Vec<DescribedInstruction>,
    pub objects: usize,
    /// Complete values in the stream.
    pub checkpoints: usize,
    pub bytes: u64,
}

impl fmt::Display for DescribedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>8}  ", self.offset)?;
        match self.index {
            Some(index) => write!(f, "{:>6}  ", format!("#{}", index))?,
            None => write!(f, "{:>6}  ", "")?,
        }
        write!(f, "{}", self.operation.name())?;
        for operand in &self.operands {
            match operand {
                Operand::Byte(b) => write!(f, " {}", b)?,
                Operand::Short(s) => write!(f, " {}", s)?,
                Operand::Int(i) => write!(f, " {}", i)?,
                Operand::Long(l) => write!(f, " {:#018x}", l)?,
                Operand::Bytes(b) => write!(f, " <{} bytes>", b.len())?,
                Operand::Utf8(s) => write!(f, " {:?}", s)?,
                Operand::Object(o) => write!(f, " #{}", o)?,
                Operand::Objects(os) => {
                    let refs: Vec<String> = os.iter().map(|o| format!("#{}", o)).collect();
                    write!(f, " [{}]", refs.join(", "))?
                }
            }
        }
        if let Some(special) = self.special {
            write!(f, "  ; {}", special)?;
        }
        Ok(())
    }
}

impl fmt::Display for StreamDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instruction in &self.instructions {
            writeln!(f, "{}", instruction)?;
        }
        write!(
            f,
            "{} instructions, {} objects, {} values, {} bytes",
            self.instructions.len(),
            self.objects,
            self.checkpoints,
            self.bytes
        )
    }
}

/// Decode `bytes` into its instruction listing, checking opcodes,
/// back-references and special ordinals along the way.
pub fn describe(bytes: &[u8]) -> Result<StreamDescription, DeserializerError> {
    let mut reader = StreamReader::new(bytes);
    let mut description = StreamDescription::default();
    loop {
        let offset = reader.offset();
        let Some((operation, operands)) = reader.instruction()? else {
            break;
        };
        let malformed = |reason| DeserializerError::Malformed { offset, reason };
        for index in operands.iter().flat_map(|o| o.objects().iter().copied()) {
            if index as usize >= description.objects {
                return Err(malformed(Malformed::BadBackReference {
                    index,
                    written: description.objects,
                }));
            }
        }
        let special = match (operation, operands.as_slice()) {
            (SerializerOperation::SpecialObject, [Operand::Byte(ordinal)]) => Some(
                SpecialObject::iter()
                    .nth(*ordinal as usize)
                    .map(<&'static str>::from)
                    .ok_or_else(|| malformed(Malformed::UnknownSpecialObject(*ordinal)))?,
            ),
            (SerializerOperation::SpecialAtom, [Operand::Byte(ordinal)]) => Some(
                SpecialAtom::iter()
                    .nth(*ordinal as usize)
                    .map(<&'static str>::from)
                    .ok_or_else(|| malformed(Malformed::UnknownSpecialAtom(*ordinal)))?,
            ),
            _ => None,
        };
        let index = operation.produces_object().then(|| {
            description.objects += 1;
            description.objects as u32 - 1
        });
        if operation == SerializerOperation::Checkpoint {
            description.checkpoints += 1;
        }
        description.instructions.push(DescribedInstruction {
            offset,
            index,
            operation,
            operands,
            special,
        });
    }
    description.bytes = reader.offset();
    Ok(description)
}
