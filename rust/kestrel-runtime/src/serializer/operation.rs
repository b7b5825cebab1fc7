//! Serializer opcodes and the operand wire format.
//!
//! Every instruction is an opcode byte followed by the operands its
//! [`SerializerOperation`] declares. Integers are big-endian. Object
//! references, counts and lengths use a compressed unsigned encoding:
//!
//! ```text
//!   0xxxxxxx                      0 ..= 0x7f
//!   10xxxxxx xxxxxxxx             0 ..= 0x3fff
//!   11000000 u32                  anything else
//! ```
//!
//! Object references are absolute indices into the objects produced so far
//! by the stream (across every value in it, not only the current one).

use super::error::{DeserializerError, Malformed};
use serde::Serialize;
use std::io::{self, Read, Write};
use strum::{EnumCount, EnumIter, FromRepr, IntoStaticStr};

/// Instruction opcodes. The discriminants are the stream format: append
/// only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr, IntoStaticStr, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SerializerOperation {
    SpecialObject = 0,
    SpecialAtom = 1,
    Checkpoint = 2,
    ByteInteger = 3,
    ShortInteger = 4,
    Int32 = 5,
    BigInteger = 6,
    Float = 7,
    String = 8,
    Tuple = 9,
    Set = 10,
    Map = 11,
    Atom = 12,
    ModulelessAtom = 13,
    Variable = 14,
    AssignVariable = 15,
    IntegerRangeType = 16,
    EnumerationType = 17,
    TupleType = 18,
    SetType = 19,
    MapType = 20,
    FunctionType = 21,
    VariableType = 22,
    ContinuationType = 23,
    CodeType = 24,
    MetaType = 25,
    CompiledCode = 26,
    Function = 27,
    Continuation = 28,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum OperandKind {
    Byte,
    Short,
    Int,
    Long,
    Bytes,
    Utf8,
    Object,
    Objects,
}

impl SerializerOperation {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Self::from_repr(opcode)
    }

    /// Whether replaying the instruction adds an object that later
    /// instructions may refer back to.
    pub fn produces_object(self) -> bool {
        !matches!(
            self,
            SerializerOperation::Checkpoint | SerializerOperation::AssignVariable
        )
    }

    pub fn operand_kinds(self) -> &'static [OperandKind] {
        use OperandKind::*;
        use SerializerOperation as Op;
        match self {
            Op::SpecialObject | Op::SpecialAtom | Op::ByteInteger => &[Byte],
            Op::Checkpoint => &[Object],
            Op::ShortInteger => &[Short],
            Op::Int32 => &[Int],
            Op::BigInteger => &[Bytes],
            Op::Float => &[Long],
            Op::String | Op::ModulelessAtom => &[Utf8],
            Op::Tuple | Op::Set | Op::Map | Op::EnumerationType => &[Objects],
            // Name, then issuing module name.
            Op::Atom => &[Utf8, Utf8],
            Op::Variable | Op::VariableType | Op::MetaType => &[Object],
            Op::AssignVariable => &[Object, Object],
            // Lower and upper bound; nil when unbounded.
            Op::IntegerRangeType => &[Object, Object],
            // Size bounds, leading element types, default type.
            Op::TupleType => &[Object, Object, Objects, Object],
            Op::SetType => &[Object, Object, Object],
            Op::MapType => &[Object, Object, Object, Object],
            Op::FunctionType | Op::ContinuationType | Op::CodeType => &[Objects, Object],
            // Name, function type, locals, outers, primitive or nil,
            // literals, level-one code.
            Op::CompiledCode => &[Utf8, Object, Short, Short, Object, Objects, Bytes],
            Op::Function => &[Object, Objects],
            // Caller or nil, function, pc, slots.
            Op::Continuation => &[Object, Object, Object, Objects],
        }
    }
}

/// One operand. `O` is how objects are named: the values themselves while
/// serializing, their stream indices once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand<O> {
    Byte(u8),
    Short(u16),
    Int(i32),
    Long(u64),
    Bytes(Vec<u8>),
    Utf8(String),
    Object(O),
    Objects(Vec<O>),
}

impl<O> Operand<O> {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::Byte(_) => OperandKind::Byte,
            Operand::Short(_) => OperandKind::Short,
            Operand::Int(_) => OperandKind::Int,
            Operand::Long(_) => OperandKind::Long,
            Operand::Bytes(_) => OperandKind::Bytes,
            Operand::Utf8(_) => OperandKind::Utf8,
            Operand::Object(_) => OperandKind::Object,
            Operand::Objects(_) => OperandKind::Objects,
        }
    }

    /// The objects this operand refers to, in stream order.
    pub fn objects(&self) -> &[O] {
        match self {
            Operand::Object(o) => std::slice::from_ref(o),
            Operand::Objects(os) => os,
            _ => &[],
        }
    }

    pub fn map<P>(&self, mut f: impl FnMut(&O) -> P) -> Operand<P> {
        match self.try_map(|o| Ok::<_, std::convert::Infallible>(f(o))) {
            Ok(mapped) => mapped,
            Err(never) => match never {},
        }
    }

    pub fn try_map<P, E>(&self, mut f: impl FnMut(&O) -> Result<P, E>) -> Result<Operand<P>, E> {
        Ok(match self {
            Operand::Byte(b) => Operand::Byte(*b),
            Operand::Short(s) => Operand::Short(*s),
            Operand::Int(i) => Operand::Int(*i),
            Operand::Long(l) => Operand::Long(*l),
            Operand::Bytes(b) => Operand::Bytes(b.clone()),
            Operand::Utf8(s) => Operand::Utf8(s.clone()),
            Operand::Object(o) => Operand::Object(f(o)?),
            Operand::Objects(os) => Operand::Objects(os.iter().map(f).collect::<Result<_, _>>()?),
        })
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

const TWO_BYTE_TAG: u8 = 0x80;
const FIVE_BYTE_TAG: u8 = 0xC0;

/// Counts bytes as it forwards them.
pub(crate) struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        CountingWriter { inner, written: 0 }
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }

    fn bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    pub(crate) fn u8(&mut self, v: u8) -> io::Result<()> {
        self.bytes(&[v])
    }

    pub(crate) fn compressed(&mut self, v: u32) -> io::Result<()> {
        if v < 0x80 {
            self.u8(v as u8)
        } else if v < 0x4000 {
            self.bytes(&[TWO_BYTE_TAG | (v >> 8) as u8, v as u8])
        } else {
            self.u8(FIVE_BYTE_TAG)?;
            self.bytes(&v.to_be_bytes())
        }
    }

    fn length(&mut self, len: usize) -> io::Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "operand too long"))?;
        self.compressed(len)
    }

    pub(crate) fn operand(&mut self, operand: &Operand<u32>) -> io::Result<()> {
        match operand {
            Operand::Byte(b) => self.u8(*b),
            Operand::Short(s) => self.bytes(&s.to_be_bytes()),
            Operand::Int(i) => self.bytes(&i.to_be_bytes()),
            Operand::Long(l) => self.bytes(&l.to_be_bytes()),
            Operand::Bytes(b) => {
                self.length(b.len())?;
                self.bytes(b)
            }
            Operand::Utf8(s) => {
                self.length(s.len())?;
                self.bytes(s.as_bytes())
            }
            Operand::Object(index) => self.compressed(*index),
            Operand::Objects(indices) => {
                self.length(indices.len())?;
                indices.iter().try_for_each(|i| self.compressed(*i))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// A reader that knows its offset and turns short reads into malformed
/// stream errors.
pub(crate) struct StreamReader<R: Read> {
    inner: R,
    offset: u64,
}

impl<R: Read> StreamReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        StreamReader { inner, offset: 0 }
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn malformed(&self, reason: Malformed) -> DeserializerError {
        DeserializerError::Malformed {
            offset: self.offset,
            reason,
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<(), DeserializerError> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.offset += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(self.malformed(Malformed::UnexpectedEnd))
            }
            Err(e) => Err(DeserializerError::Io(e)),
        }
    }

    /// The next opcode, or `None` at a clean end of stream.
    pub(crate) fn opcode(&mut self) -> Result<Option<u8>, DeserializerError> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    return Ok(Some(byte[0]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DeserializerError::Io(e)),
            }
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DeserializerError> {
        let mut buf = [0u8; N];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn compressed(&mut self) -> Result<u32, DeserializerError> {
        let [first] = self.array::<1>()?;
        match first {
            0x00..=0x7F => Ok(first as u32),
            0x80..=0xBF => {
                let [second] = self.array::<1>()?;
                Ok((((first & 0x3F) as u32) << 8) | second as u32)
            }
            FIVE_BYTE_TAG => Ok(u32::from_be_bytes(self.array::<4>()?)),
            other => Err(self.malformed(Malformed::BadCompressedInt(other))),
        }
    }

    fn byte_run(&mut self) -> Result<Vec<u8>, DeserializerError> {
        let len = self.compressed()? as u64;
        // Never trust the length for an allocation up front.
        let mut buf = Vec::new();
        let read = (&mut self.inner)
            .take(len)
            .read_to_end(&mut buf)
            .map_err(DeserializerError::Io)?;
        self.offset += read as u64;
        if (read as u64) < len {
            return Err(self.malformed(Malformed::UnexpectedEnd));
        }
        Ok(buf)
    }

    pub(crate) fn operand(&mut self, kind: OperandKind) -> Result<Operand<u32>, DeserializerError> {
        Ok(match kind {
            OperandKind::Byte => Operand::Byte(self.array::<1>()?[0]),
            OperandKind::Short => Operand::Short(u16::from_be_bytes(self.array()?)),
            OperandKind::Int => Operand::Int(i32::from_be_bytes(self.array()?)),
            OperandKind::Long => Operand::Long(u64::from_be_bytes(self.array()?)),
            OperandKind::Bytes => Operand::Bytes(self.byte_run()?),
            OperandKind::Utf8 => {
                let bytes = self.byte_run()?;
                let s = String::from_utf8(bytes).map_err(|_| self.malformed(Malformed::InvalidUtf8))?;
                Operand::Utf8(s)
            }
            OperandKind::Object => Operand::Object(self.compressed()?),
            OperandKind::Objects => {
                let count = self.compressed()?;
                let mut indices = Vec::new();
                for _ in 0..count {
                    indices.push(self.compressed()?);
                }
                Operand::Objects(indices)
            }
        })
    }

    /// Read one whole instruction: the operation and its operands.
    pub(crate) fn instruction(
        &mut self,
    ) -> Result<Option<(SerializerOperation, Vec<Operand<u32>>)>, DeserializerError> {
        let Some(opcode) = self.opcode()? else {
            return Ok(None);
        };
        let operation = SerializerOperation::from_opcode(opcode)
            .ok_or_else(|| self.malformed(Malformed::UnknownOperation(opcode)))?;
        let operands = operation
            .operand_kinds()
            .iter()
            .map(|kind| self.operand(*kind))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((operation, operands)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn encode(v: u32) -> Vec<u8> {
        let mut w = CountingWriter::new(Vec::new());
        w.compressed(v).unwrap();
        w.into_inner()
    }

    #[test]
    fn test_compressed_widths() {
        assert_eq!(encode(5), vec![5]);
        assert_eq!(encode(0x7F).len(), 1);
        assert_eq!(encode(0x80), vec![0x80, 0x80]);
        assert_eq!(encode(0x3FFF), vec![0xBF, 0xFF]);
        assert_eq!(encode(0x4000), vec![0xC0, 0, 0, 0x40, 0]);
        for v in [0, 0x7F, 0x80, 0x3FFF, 0x4000, u32::MAX] {
            let bytes = encode(v);
            let mut r = StreamReader::new(bytes.as_slice());
            assert_eq!(r.compressed().unwrap(), v);
            assert_eq!(r.offset(), bytes.len() as u64);
        }
    }

    #[test]
    fn test_bad_compressed_prefix() {
        let mut r = StreamReader::new(&[0xC1u8][..]);
        let err = r.compressed().unwrap_err();
        assert_eq!(err.malformed_reason(), Some(&Malformed::BadCompressedInt(0xC1)));
    }

    #[test]
    fn test_opcodes_round_trip_through_repr() {
        for op in SerializerOperation::iter() {
            assert_eq!(SerializerOperation::from_opcode(op.opcode()), Some(op));
        }
        assert_eq!(SerializerOperation::from_opcode(SerializerOperation::COUNT as u8), None);
    }

    #[test]
    fn test_byte_run_longer_than_stream() {
        // Claims 100 bytes, carries 2.
        let mut r = StreamReader::new(&[100u8, b'h', b'i'][..]);
        let err = r.operand(OperandKind::Utf8).unwrap_err();
        assert_eq!(err.malformed_reason(), Some(&Malformed::UnexpectedEnd));
    }

    #[test]
    fn test_truncated_instruction() {
        let bytes = [SerializerOperation::Int32.opcode(), 0, 1];
        let mut r = StreamReader::new(&bytes[..]);
        let err = r.instruction().unwrap_err();
        assert!(err.is_malformed());
        let mut empty = StreamReader::new(&[][..]);
        assert!(empty.instruction().unwrap().is_none());
    }
}
