use anyhow::{Context, Result};

use super::{
    Attribute, ConstantPool, parse_attributes, read_bytes_class, read_u16_class, read_u32_class,
    write_attributes, write_u16, write_u32,
};
use crate::opcodes;

pub(crate) const CODE: &str = "Code";
pub(crate) const STACK_MAP_TABLE: &str = "StackMapTable";
pub(crate) const LINE_NUMBER_TABLE: &str = "LineNumberTable";
pub(crate) const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
pub(crate) const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";

/// Exception table row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ExceptionEntry {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    /// Zero catches everything.
    pub(crate) catch_type: u16,
}

/// Decoded `Code` attribute.
#[derive(Clone, Debug)]
pub(crate) struct CodeAttribute {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<Attribute>,
}

impl CodeAttribute {
    pub(crate) fn parse(info: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let max_stack = read_u16_class(info, &mut offset)?;
        let max_locals = read_u16_class(info, &mut offset)?;
        let code_length = read_u32_class(info, &mut offset)? as usize;
        let code = read_bytes_class(info, &mut offset, code_length)?.to_vec();
        let table_length = read_u16_class(info, &mut offset)? as usize;
        let mut exception_table = Vec::with_capacity(table_length);
        for _ in 0..table_length {
            exception_table.push(ExceptionEntry {
                start_pc: read_u16_class(info, &mut offset)?,
                end_pc: read_u16_class(info, &mut offset)?,
                handler_pc: read_u16_class(info, &mut offset)?,
                catch_type: read_u16_class(info, &mut offset)?,
            });
        }
        let attributes = parse_attributes(info, &mut offset).context("parse code attributes")?;
        if offset != info.len() {
            anyhow::bail!("trailing bytes after code attribute");
        }
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut info = Vec::with_capacity(self.code.len() + 12);
        write_u16(&mut info, self.max_stack);
        write_u16(&mut info, self.max_locals);
        write_u32(&mut info, self.code.len() as u32);
        info.extend_from_slice(&self.code);
        write_u16(&mut info, self.exception_table.len() as u16);
        for entry in &self.exception_table {
            write_u16(&mut info, entry.start_pc);
            write_u16(&mut info, entry.end_pc);
            write_u16(&mut info, entry.handler_pc);
            write_u16(&mut info, entry.catch_type);
        }
        write_attributes(&mut info, &self.attributes);
        info
    }

    /// Move every code offset by `delta`, as after inserting bytes at offset zero.
    /// Offset-bearing sub-attributes this model does not understand are dropped.
    pub(crate) fn shift_offsets(&mut self, pool: &ConstantPool, delta: u16) -> Result<()> {
        for entry in &mut self.exception_table {
            entry.start_pc = shifted(entry.start_pc, delta)?;
            entry.end_pc = shifted(entry.end_pc, delta)?;
            entry.handler_pc = shifted(entry.handler_pc, delta)?;
        }
        let mut kept = Vec::with_capacity(self.attributes.len());
        for mut attribute in std::mem::take(&mut self.attributes) {
            let name = pool.utf8(attribute.name_index)?;
            match name.as_str() {
                LINE_NUMBER_TABLE => {
                    shift_table(&mut attribute.info, 4, delta)?;
                    kept.push(attribute);
                }
                LOCAL_VARIABLE_TABLE | LOCAL_VARIABLE_TYPE_TABLE => {
                    shift_table(&mut attribute.info, 10, delta)?;
                    kept.push(attribute);
                }
                _ => {}
            }
        }
        self.attributes = kept;
        Ok(())
    }
}

fn shifted(value: u16, delta: u16) -> Result<u16> {
    value
        .checked_add(delta)
        .context("code offset exceeds 65535 after shifting")
}

/// Shift the leading `start_pc` of every fixed-size row in a counted table.
fn shift_table(info: &mut [u8], row_size: usize, delta: u16) -> Result<()> {
    let mut offset = 0usize;
    let rows = read_u16_class(info, &mut offset)? as usize;
    for row in 0..rows {
        let at = 2 + row * row_size;
        let mut cursor = at;
        let start_pc = read_u16_class(info, &mut cursor)?;
        let moved = shifted(start_pc, delta)?.to_be_bytes();
        info[at] = moved[0];
        info[at + 1] = moved[1];
    }
    Ok(())
}

/// Length in bytes of the instruction at `offset`.
pub(crate) fn instruction_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = *code.get(offset).context("bytecode offset out of bounds")?;
    let length = match opcode {
        0x00..=0x0f => 1,
        opcodes::BIPUSH => 2,
        opcodes::SIPUSH => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        opcodes::IINC => 3,
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        opcodes::NEWARRAY => 2,
        opcodes::ANEWARRAY => 3,
        opcodes::ARRAYLENGTH | opcodes::ATHROW => 1,
        opcodes::CHECKCAST | opcodes::INSTANCEOF => 3,
        opcodes::MONITORENTER | opcodes::MONITOREXIT => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        opcodes::MULTIANEWARRAY => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    if offset + length > code.len() {
        anyhow::bail!("invalid bytecode length at offset {}", offset);
    }
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code
        .get(offset + 1)
        .copied()
        .context("missing wide opcode")?;
    if opcode == opcodes::IINC { Ok(6) } else { Ok(4) }
}

/// Alignment bytes after a switch opcode at `offset`.
pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

pub(crate) fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    Ok(read_u16(code, offset)? as i16)
}

pub(crate) fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode u32 out of bounds")?;
    Ok(i32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}
