// =============================================================================
// DISASM - Human-readable bytecode listings
// =============================================================================

use std::fmt::Write;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::op::Op;
use crate::runtime::object::Heap;

/// Render a whole chunk, one instruction per line, with byte offsets and
/// source lines. Constant operands are shown with their resolved value, which
/// needs the heap for function and class references.
pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, heap, &mut out);
    }
    out
}

/// Render the instruction at `offset`, returning the offset of the next one.
pub fn disassemble_instruction(
    chunk: &Chunk,
    offset: usize,
    heap: &Heap,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.line(offset) == chunk.line(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line(offset));
    }

    let byte = chunk.code[offset];
    let Some(op) = Op::from_byte(byte) else {
        let _ = writeln!(out, "UNKNOWN {:#04x}", byte);
        return offset + 1;
    };

    match op {
        Op::Constant
        | Op::DefineGlobal
        | Op::GetGlobal
        | Op::SetGlobal
        | Op::GetProperty
        | Op::SetProperty
        | Op::GetSuper
        | Op::Class
        | Op::Method => constant_instruction(chunk, op, offset, heap, out),
        Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue | Op::Call => {
            byte_instruction(chunk, op, offset, out)
        }
        Op::Jump | Op::JumpIfFalse => jump_instruction(chunk, op, offset, 1, out),
        Op::Loop => jump_instruction(chunk, op, offset, -1, out),
        Op::Invoke | Op::SuperInvoke => invoke_instruction(chunk, op, offset, heap, out),
        Op::Closure => closure_instruction(chunk, offset, heap, out),
        _ => {
            let _ = writeln!(out, "{}", op.mnemonic());
            offset + 1
        }
    }
}

fn constant_instruction(
    chunk: &Chunk,
    op: Op,
    offset: usize,
    heap: &Heap,
    out: &mut String,
) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let shown = heap.show(&chunk.constants[idx]);
    let _ = writeln!(out, "{:<16} {:4} '{}'", op.mnemonic(), idx, shown);
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: Op, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<16} {:4}", op.mnemonic(), slot);
    offset + 2
}

fn jump_instruction(
    chunk: &Chunk,
    op: Op,
    offset: usize,
    sign: i64,
    out: &mut String,
) -> usize {
    let distance = chunk.read_u16(offset + 1) as i64;
    let target = offset as i64 + 3 + sign * distance;
    let _ = writeln!(out, "{:<16} {:4} -> {}", op.mnemonic(), offset, target);
    offset + 3
}

fn invoke_instruction(
    chunk: &Chunk,
    op: Op,
    offset: usize,
    heap: &Heap,
    out: &mut String,
) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    let shown = heap.show(&chunk.constants[idx]);
    let _ = writeln!(
        out,
        "{:<16} ({} args) {:4} '{}'",
        op.mnemonic(),
        arg_count,
        idx,
        shown
    );
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let value = &chunk.constants[idx];
    let _ = writeln!(out, "{:<16} {:4} {}", "CLOSURE", idx, heap.show(value));

    let mut offset = offset + 2;
    if let crate::lang::value::Value::Obj(handle) = value {
        for _ in 0..heap.function(*handle).upvalue_count {
            let is_local = chunk.code[offset];
            let index = chunk.code[offset + 1];
            let kind = if is_local == 1 { "local" } else { "upvalue" };
            let _ = writeln!(out, "{:04}    |                     {} {}", offset, kind, index);
            offset += 2;
        }
    }
    offset
}
