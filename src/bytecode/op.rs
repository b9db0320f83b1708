// =============================================================================
// OP - Bytecode instructions
// =============================================================================

/// One instruction opcode.
///
/// Instructions are encoded as a one-byte opcode followed by zero or more
/// fixed-width operand bytes: one byte for small indices (constants, stack
/// slots, argument counts) and two big-endian bytes for jump offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // literals and constants
    Constant,
    Nil,
    True,
    False,

    // stack bookkeeping
    Pop,

    // variable access; every Set* leaves the assigned value on the stack
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,

    // properties
    GetProperty,
    SetProperty,
    GetSuper,

    // comparison and equality
    Equal,
    Greater,
    Less,

    // arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,

    // output
    Print,

    // control flow; offsets are relative, u16 big-endian
    Jump,
    JumpIfFalse,
    Loop,

    // calls
    Call,
    Invoke,
    SuperInvoke,

    // closures
    Closure,
    CloseUpvalue,

    Return,

    // classes
    Class,
    Inherit,
    Method,
}

impl Op {
    /// Decode a raw instruction byte. Returns `None` for bytes outside the
    /// instruction set, which on well-formed bytecode never happens.
    pub fn from_byte(byte: u8) -> Option<Op> {
        use Op::*;
        // Sized off the last variant so adding an opcode cannot desync it.
        const TABLE: [Op; Op::Method as usize + 1] = [
            Constant,
            Nil,
            True,
            False,
            Pop,
            GetLocal,
            SetLocal,
            GetGlobal,
            DefineGlobal,
            SetGlobal,
            GetUpvalue,
            SetUpvalue,
            GetProperty,
            SetProperty,
            GetSuper,
            Equal,
            Greater,
            Less,
            Add,
            Subtract,
            Multiply,
            Divide,
            Not,
            Negate,
            Print,
            Jump,
            JumpIfFalse,
            Loop,
            Call,
            Invoke,
            SuperInvoke,
            Closure,
            CloseUpvalue,
            Return,
            Class,
            Inherit,
            Method,
        ];
        TABLE.get(byte as usize).copied()
    }

    /// Mnemonic used by the disassembler.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Constant => "CONSTANT",
            Op::Nil => "NIL",
            Op::True => "TRUE",
            Op::False => "FALSE",
            Op::Pop => "POP",
            Op::GetLocal => "GET_LOCAL",
            Op::SetLocal => "SET_LOCAL",
            Op::GetGlobal => "GET_GLOBAL",
            Op::DefineGlobal => "DEFINE_GLOBAL",
            Op::SetGlobal => "SET_GLOBAL",
            Op::GetUpvalue => "GET_UPVALUE",
            Op::SetUpvalue => "SET_UPVALUE",
            Op::GetProperty => "GET_PROPERTY",
            Op::SetProperty => "SET_PROPERTY",
            Op::GetSuper => "GET_SUPER",
            Op::Equal => "EQUAL",
            Op::Greater => "GREATER",
            Op::Less => "LESS",
            Op::Add => "ADD",
            Op::Subtract => "SUBTRACT",
            Op::Multiply => "MULTIPLY",
            Op::Divide => "DIVIDE",
            Op::Not => "NOT",
            Op::Negate => "NEGATE",
            Op::Print => "PRINT",
            Op::Jump => "JUMP",
            Op::JumpIfFalse => "JUMP_IF_FALSE",
            Op::Loop => "LOOP",
            Op::Call => "CALL",
            Op::Invoke => "INVOKE",
            Op::SuperInvoke => "SUPER_INVOKE",
            Op::Closure => "CLOSURE",
            Op::CloseUpvalue => "CLOSE_UPVALUE",
            Op::Return => "RETURN",
            Op::Class => "CLASS",
            Op::Inherit => "INHERIT",
            Op::Method => "METHOD",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_opcode_round_trips_through_its_byte() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Op::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Op::from_byte(Op::Constant as u8), Some(Op::Constant));
        assert_eq!(Op::from_byte(Op::Method as u8), Some(Op::Method));
    }

    #[test]
    fn test_decode_table_covers_every_variant() {
        for byte in 0..=Op::Method as u8 {
            assert!(Op::from_byte(byte).is_some());
        }
    }

    #[test]
    fn test_bytes_past_the_instruction_set_decode_to_none() {
        assert_eq!(Op::from_byte(Op::Method as u8 + 1), None);
        assert_eq!(Op::from_byte(0xFF), None);
    }
}
