use crate::bytecode::op::Op;
use crate::lang::value::Value;

/// A compiled unit of bytecode: the instruction byte stream, the constant
/// pool, and a source line per instruction byte (diagnostics only).
///
/// A chunk is mutable only while its function is being compiled; afterwards
/// the only writes are jump backpatches performed through [`Chunk::patch_u16`].
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    lines: Vec<u32>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: Op, line: u32) {
        self.write(op as u8, line);
    }

    /// Append a value to the constant pool and return its index.
    ///
    /// The pool is append-only; the compiler enforces the 256-entry limit
    /// before calling this.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Read a two-byte big-endian operand starting at `offset`.
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    /// Overwrite a two-byte placeholder with the now-known jump offset.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.code[offset] = hi;
        self.code[offset + 1] = lo;
    }

    /// Source line for the instruction byte at `offset`.
    pub fn line(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }
}
