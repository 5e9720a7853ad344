//! Human-readable bytecode listings.
//!
//! Used by the `--trace` execution tracer (one instruction before each
//! dispatch) and by the compiler's code dump. Output is returned as a
//! string so callers choose the stream.

use fer_core::{Chunk, Heap, Op};

/// Disassemble a whole chunk under a header line.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut text = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(heap, chunk, offset);
        text.push_str(&line);
        text.push('\n');
        offset = next;
    }
    text
}

/// Disassemble the instruction at `offset`; returns the rendered line
/// and the offset of the next instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut line = format!("{offset:04} ");
    // Collapse runs of instructions on the same source line.
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        line.push_str("   | ");
    } else {
        line.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let Some(op) = Op::from_u8(chunk.code[offset]) else {
        line.push_str(&format!("Unknown opcode {}", chunk.code[offset]));
        return (line, offset + 1);
    };

    let (text, next) = match op {
        Op::Constant => constant_instruction(heap, chunk, "OP_CONSTANT", offset),
        Op::Nil => simple_instruction("OP_NIL", offset),
        Op::True => simple_instruction("OP_TRUE", offset),
        Op::False => simple_instruction("OP_FALSE", offset),
        Op::Pop => simple_instruction("OP_POP", offset),
        Op::GetLocal => byte_instruction(chunk, "OP_GET_LOCAL", offset),
        Op::SetLocal => byte_instruction(chunk, "OP_SET_LOCAL", offset),
        Op::GetGlobal => constant_instruction(heap, chunk, "OP_GET_GLOBAL", offset),
        Op::DefineGlobal => constant_instruction(heap, chunk, "OP_DEFINE_GLOBAL", offset),
        Op::DefineGlobalPerm => {
            constant_instruction(heap, chunk, "OP_DEFINE_GLOBAL_PERM", offset)
        }
        Op::SetGlobal => constant_instruction(heap, chunk, "OP_SET_GLOBAL", offset),
        Op::GetUpvalue => byte_instruction(chunk, "OP_GET_UPVALUE", offset),
        Op::SetUpvalue => byte_instruction(chunk, "OP_SET_UPVALUE", offset),
        Op::GetProperty => constant_instruction(heap, chunk, "OP_GET_PROPERTY", offset),
        Op::SetProperty => constant_instruction(heap, chunk, "OP_SET_PROPERTY", offset),
        Op::GetSuper => constant_instruction(heap, chunk, "OP_GET_SUPER", offset),
        Op::GetItem => simple_instruction("OP_GET_ITEM", offset),
        Op::SetItem => simple_instruction("OP_SET_ITEM", offset),
        Op::Equal => simple_instruction("OP_EQUAL", offset),
        Op::Greater => simple_instruction("OP_GREATER", offset),
        Op::Less => simple_instruction("OP_LESS", offset),
        Op::Add => simple_instruction("OP_ADD", offset),
        Op::Subtract => simple_instruction("OP_SUBTRACT", offset),
        Op::Multiply => simple_instruction("OP_MULTIPLY", offset),
        Op::Divide => simple_instruction("OP_DIVIDE", offset),
        Op::Not => simple_instruction("OP_NOT", offset),
        Op::Negate => simple_instruction("OP_NEGATE", offset),
        Op::Print => simple_instruction("OP_PRINT", offset),
        Op::Jump => jump_instruction(chunk, "OP_JUMP", 1, offset),
        Op::JumpIfFalse => jump_instruction(chunk, "OP_JUMP_IF_FALSE", 1, offset),
        Op::Loop => jump_instruction(chunk, "OP_LOOP", -1, offset),
        Op::Call => byte_instruction(chunk, "OP_CALL", offset),
        Op::Invoke => invoke_instruction(heap, chunk, "OP_INVOKE", offset),
        Op::SuperInvoke => invoke_instruction(heap, chunk, "OP_SUPER_INVOKE", offset),
        Op::Closure => closure_instruction(heap, chunk, offset),
        Op::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        Op::Return => simple_instruction("OP_RETURN", offset),
        Op::List => byte_instruction(chunk, "OP_LIST", offset),
        Op::Dictionary => byte_instruction(chunk, "OP_DICTIONARY", offset),
        Op::Class => constant_instruction(heap, chunk, "OP_CLASS", offset),
        Op::Inherit => simple_instruction("OP_INHERIT", offset),
        Op::Method => constant_instruction(heap, chunk, "OP_METHOD", offset),
    };
    line.push_str(&text);
    (line, next)
}

fn simple_instruction(name: &str, offset: usize) -> (String, usize) {
    (name.to_string(), offset + 1)
}

fn byte_instruction(chunk: &Chunk, name: &str, offset: usize) -> (String, usize) {
    let slot = chunk.code[offset + 1];
    (format!("{name:<16} {slot:4}"), offset + 2)
}

fn constant_instruction(heap: &Heap, chunk: &Chunk, name: &str, offset: usize) -> (String, usize) {
    let constant = chunk.code[offset + 1] as usize;
    let rendered = heap.format_value(chunk.constants[constant]);
    (format!("{name:<16} {constant:4} '{rendered}'"), offset + 2)
}

fn invoke_instruction(heap: &Heap, chunk: &Chunk, name: &str, offset: usize) -> (String, usize) {
    let constant = chunk.code[offset + 1] as usize;
    let argc = chunk.code[offset + 2];
    let rendered = heap.format_value(chunk.constants[constant]);
    (
        format!("{name:<16} ({argc} args) {constant:4} '{rendered}'"),
        offset + 3,
    )
}

fn jump_instruction(chunk: &Chunk, name: &str, sign: i64, offset: usize) -> (String, usize) {
    let jump = ((chunk.code[offset + 1] as i64) << 8) | chunk.code[offset + 2] as i64;
    let target = offset as i64 + 3 + sign * jump;
    (format!("{name:<16} {offset:4} -> {target}"), offset + 3)
}

/// `OP_CLOSURE` is variable-length: the function constant, then one
/// `(is_local, index)` pair per upvalue.
fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let constant = chunk.code[offset + 1] as usize;
    let value = chunk.constants[constant];
    let mut text = format!("{:<16} {:4} {}", "OP_CLOSURE", constant, heap.format_value(value));

    let upvalue_count = value
        .as_object()
        .map(|r| heap.function(r).upvalue_count)
        .unwrap_or(0);
    let mut next = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[next] == 1;
        let index = chunk.code[next + 1];
        text.push_str(&format!(
            "\n{:04}      |                     {} {}",
            next,
            if is_local { "local" } else { "upvalue" },
            index
        ));
        next += 2;
    }
    (text, next)
}
