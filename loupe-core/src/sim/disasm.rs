// Disassembler for simulated code
//
// Decodes the fixed 4-byte encoding produced by the image linker.

use super::image::{opcode, operand_dest, syscall, INSTR_LEN};
use crate::backend::{Disassembler, Instruction};
use bytes::Buf;

#[derive(Debug, Default)]
pub struct SimDisassembler;

impl SimDisassembler {
    pub fn new() -> Self {
        Self
    }
}

fn syscall_name(number: u64) -> &'static str {
    match number {
        syscall::GO => "newproc",
        syscall::YIELD => "gosched",
        syscall::LOAD_PLUGIN => "dlopen",
        syscall::SPAWN => "execve",
        _ => "unknown",
    }
}

impl Disassembler for SimDisassembler {
    fn decode(&self, mem: &[u8], start: u64) -> Vec<Instruction> {
        let mut buf = mem;
        let mut pc = start;
        let mut out = Vec::new();

        while buf.remaining() >= INSTR_LEN as usize {
            let op = buf.get_u8();
            let operand = buf.get_uint(3);
            let mut dest = None;
            let text = match op {
                opcode::NOP => "NOP".to_string(),
                opcode::PROLOGUE => "PUSH BP".to_string(),
                opcode::POST_CALL => "MOV AX, [SP]".to_string(),
                opcode::STORE => "MOV [BP], AX".to_string(),
                opcode::RET => "RET".to_string(),
                opcode::CALL | opcode::JMP | opcode::JL => {
                    dest = operand_dest(operand);
                    let mnemonic = match op {
                        opcode::CALL => "CALL",
                        opcode::JMP => "JMP",
                        _ => "JL",
                    };
                    match dest {
                        Some(d) => format!("{} {:#x}", mnemonic, d),
                        None => format!("{} ?", mnemonic),
                    }
                }
                opcode::EXIT => format!("EXIT {}", operand),
                opcode::SYSCALL => format!("SYSCALL {}", syscall_name(operand)),
                opcode::PANIC => "UD2".to_string(),
                _ => "(bad)".to_string(),
            };
            out.push(Instruction {
                pc,
                len: INSTR_LEN as usize,
                text,
                dest,
                is_call: op == opcode::CALL,
                is_return: op == opcode::RET,
            });
            pc += INSTR_LEN;
        }
        out
    }
}
