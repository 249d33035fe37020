use std::fmt::Write;

use crate::chunk::Chunk;
use crate::gc::Heap;
use crate::opcode::OpCode;
use crate::value::{Obj, Value};

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let instruction = OpCode::from_u8(chunk.code[offset]);
    match instruction {
        OpCode::Constant => constant_instruction("Constant", heap, chunk, offset, out),
        OpCode::Nil => simple_instruction("Nil", offset, out),
        OpCode::True => simple_instruction("True", offset, out),
        OpCode::False => simple_instruction("False", offset, out),
        OpCode::Pop => simple_instruction("Pop", offset, out),
        OpCode::GetLocal => byte_instruction("GetLocal", chunk, offset, out),
        OpCode::SetLocal => byte_instruction("SetLocal", chunk, offset, out),
        OpCode::GetGlobal => constant_instruction("GetGlobal", heap, chunk, offset, out),
        OpCode::DefineGlobal => constant_instruction("DefineGlobal", heap, chunk, offset, out),
        OpCode::SetGlobal => constant_instruction("SetGlobal", heap, chunk, offset, out),
        OpCode::GetUpvalue => byte_instruction("GetUpvalue", chunk, offset, out),
        OpCode::SetUpvalue => byte_instruction("SetUpvalue", chunk, offset, out),
        OpCode::Equal => simple_instruction("Equal", offset, out),
        OpCode::Greater => simple_instruction("Greater", offset, out),
        OpCode::Less => simple_instruction("Less", offset, out),
        OpCode::Add => simple_instruction("Add", offset, out),
        OpCode::Sub => simple_instruction("Sub", offset, out),
        OpCode::Mul => simple_instruction("Mul", offset, out),
        OpCode::Div => simple_instruction("Div", offset, out),
        OpCode::Not => simple_instruction("Not", offset, out),
        OpCode::Negate => simple_instruction("Negate", offset, out),
        OpCode::Print => simple_instruction("Print", offset, out),
        OpCode::Jump => jump_instruction("Jump", 1, chunk, offset, out),
        OpCode::JumpIfFalse => jump_instruction("JumpIfFalse", 1, chunk, offset, out),
        OpCode::Loop => jump_instruction("Loop", -1, chunk, offset, out),
        OpCode::Call => byte_instruction("Call", chunk, offset, out),
        OpCode::Closure => closure_instruction(heap, chunk, offset, out),
        OpCode::CloseUpvalue => simple_instruction("CloseUpvalue", offset, out),
        OpCode::Return => simple_instruction("Return", offset, out),
    }
}

fn simple_instruction(name: &str, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{}", name);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:-16} {:4}", name, slot);
    offset + 2
}

fn constant_instruction(name: &str, heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let _ = writeln!(
        out,
        "{:-16} {:4} '{}'",
        name,
        constant,
        heap.format_value(chunk.constants[constant])
    );
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
    let target = (offset as i32) + 3 + sign * (jump as i32);
    let _ = writeln!(out, "{:-16} {:4} -> {}", name, offset, target);
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let value = chunk.constants[constant];
    let _ = writeln!(out, "{:-16} {:4} {}", "Closure", constant, heap.format_value(value));

    let mut offset = offset + 2;
    if let Value::Obj(r) = value {
        if let Obj::Fun(fun) = heap.get(r) {
            for _ in 0..fun.upvalue_count {
                let is_local = chunk.code[offset];
                let index = chunk.code[offset + 1];
                let _ = writeln!(
                    out,
                    "{:04}      |                     {} {}",
                    offset,
                    if is_local == 1 { "local" } else { "upvalue" },
                    index
                );
                offset += 2;
            }
        }
    }
    offset
}
