// Strand Bytecode Chunk
// Contains bytecode and per-byte source line information

use super::opcode::Opcode;
use crate::error::{Fault, FaultResult};

/// A chunk of bytecode
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chunk {
    /// Raw bytecode
    pub code: Vec<u8>,
    /// Source line of each byte
    pub lines: Vec<u32>,
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

    /// Write a single byte with its source line
    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: Opcode, line: u32) {
        self.write(op as u8, line);
    }

    pub fn write_u8(&mut self, value: u8, line: u32) {
        self.write(value, line);
    }

    /// Write a u16 operand (big-endian)
    pub fn write_u16(&mut self, value: u16, line: u32) {
        for b in value.to_be_bytes() {
            self.write(b, line);
        }
    }

    pub fn write_u24(&mut self, value: u32, line: u32) {
        let bytes = value.to_be_bytes();
        for b in &bytes[1..] {
            self.write(*b, line);
        }
    }

    pub fn write_u32(&mut self, value: u32, line: u32) {
        for b in value.to_be_bytes() {
            self.write(b, line);
        }
    }

    /// Get the current code offset
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a block opcode and return the offset of its size operand
    pub fn begin_block(&mut self, op: Opcode, line: u32) -> usize {
        self.write_op(op, line);
        let offset = self.current_offset();
        self.write_u16(0, line);
        offset
    }

    /// Close a block opened with `begin_block`
    pub fn end_block(&mut self, offset: usize) {
        self.patch_u16(offset);
    }

    /// Emit a forward jump and return the offset of its operand
    pub fn write_jump(&mut self, op: Opcode, line: u32) -> usize {
        self.begin_block(op, line)
    }

    /// Point a forward jump at the current offset
    pub fn patch_jump(&mut self, offset: usize) {
        self.patch_u16(offset);
    }

    /// Emit a jump back to `target`
    pub fn write_loop(&mut self, target: usize, line: u32) {
        self.write_op(Opcode::Jump, line);
        let offset = target as i64 - (self.current_offset() as i64 + 2);
        self.write_u16(offset as i16 as u16, line);
    }

    fn patch_u16(&mut self, offset: usize) {
        let size = (self.code.len() - offset - 2) as u16;
        let bytes = size.to_be_bytes();
        self.code[offset] = bytes[0];
        self.code[offset + 1] = bytes[1];
    }

    pub fn opcode_at(&self, ip: i32) -> FaultResult<Opcode> {
        let byte = self.byte_at(ip)?;
        Opcode::try_from(byte).map_err(|opcode| Fault::BadOpcode { opcode, ip })
    }

    fn byte_at(&self, ip: i32) -> FaultResult<u8> {
        usize::try_from(ip)
            .ok()
            .and_then(|i| self.code.get(i).copied())
            .ok_or(Fault::Truncated(ip))
    }

    fn decode(&self, ip: &mut i32, width: usize) -> FaultResult<u32> {
        let mut value = 0u32;
        for _ in 0..width {
            *ip += 1;
            value = (value << 8) | self.byte_at(*ip)? as u32;
        }
        Ok(value)
    }

    // Decoders advance `ip` to the last byte they read

    pub fn decode8(&self, ip: &mut i32) -> FaultResult<u8> {
        Ok(self.decode(ip, 1)? as u8)
    }

    pub fn decode16(&self, ip: &mut i32) -> FaultResult<u16> {
        Ok(self.decode(ip, 2)? as u16)
    }

    pub fn decode24(&self, ip: &mut i32) -> FaultResult<u32> {
        self.decode(ip, 3)
    }

    pub fn decode32(&self, ip: &mut i32) -> FaultResult<u32> {
        self.decode(ip, 4)
    }

    /// Source line for the instruction at `ip`, 0 when unknown
    pub fn line_at(&self, ip: i32) -> u32 {
        usize::try_from(ip)
            .ok()
            .and_then(|i| self.lines.get(i).copied())
            .unwrap_or(0)
    }

    /// Disassemble the chunk for debugging
    pub fn disassemble(&self, name: &str) -> String {
        let mut out = format!("--- {} ---\n", name);
        let mut offset = 0usize;
        while offset < self.code.len() {
            let byte = self.code[offset];
            match Opcode::try_from(byte) {
                Ok(op) => {
                    let mut ip = offset as i32;
                    let operands: Vec<String> = op
                        .operand_widths()
                        .iter()
                        .map(|w| match self.decode(&mut ip, *w) {
                            Ok(v) => v.to_string(),
                            Err(_) => "?".to_string(),
                        })
                        .collect();
                    out.push_str(&format!(
                        "{:04} {:>4} {} {}\n",
                        offset,
                        self.line_at(offset as i32),
                        op,
                        operands.join(" ")
                    ));
                    offset += 1 + op.operands_size();
                }
                Err(_) => {
                    out.push_str(&format!("{:04}      ??? {}\n", offset, byte));
                    offset += 1;
                }
            }
        }
        out
    }
}
