//! Bytecode decoding and re-layout.
//!
//! Only instructions whose encoding depends on their position are decoded
//! into structured form (branches and switches); everything else is carried
//! as its original bytes. [`assemble`] lays out a sequence of original
//! instructions interleaved with injected straight-line snippets and returns
//! the old-to-new offset maps needed to fix up the exception table, frames and
//! debug tables.

use crate::classfile::ClassFileError;

pub mod opcodes {
    pub const NOP: u8 = 0x00;
    pub const ICONST_0: u8 = 0x03;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const DLOAD: u8 = 0x18;
    pub const ALOAD: u8 = 0x19;
    pub const ILOAD_0: u8 = 0x1a;
    pub const LLOAD_0: u8 = 0x1e;
    pub const FLOAD_0: u8 = 0x22;
    pub const DLOAD_0: u8 = 0x26;
    pub const ALOAD_0: u8 = 0x2a;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const LSTORE_0: u8 = 0x3f;
    pub const POP: u8 = 0x57;
    pub const IFEQ: u8 = 0x99;
    pub const IFNE: u8 = 0x9a;
    pub const IF_ICMPNE: u8 = 0xa0;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const RET: u8 = 0xa9;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const LRETURN: u8 = 0xad;
    pub const FRETURN: u8 = 0xae;
    pub const DRETURN: u8 = 0xaf;
    pub const ARETURN: u8 = 0xb0;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const INVOKEDYNAMIC: u8 = 0xba;
    pub const NEW: u8 = 0xbb;
    pub const ATHROW: u8 = 0xbf;
    pub const WIDE: u8 = 0xc4;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

use opcodes::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Position independent; the bytes include the opcode.
    Plain(Vec<u8>),
    /// Conditional branch, `goto` or `jsr` with a 16-bit offset.
    Branch { opcode: u8, target: u32 },
    /// `goto_w` / `jsr_w`.
    WideBranch { opcode: u8, target: u32 },
    TableSwitch { default: u32, low: i32, targets: Vec<u32> },
    LookupSwitch { default: u32, pairs: Vec<(i32, u32)> },
}

impl Instruction {
    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::Plain(bytes) => bytes[0],
            Instruction::Branch { opcode, .. } | Instruction::WideBranch { opcode, .. } => *opcode,
            Instruction::TableSwitch { .. } => TABLESWITCH,
            Instruction::LookupSwitch { .. } => LOOKUPSWITCH,
        }
    }

    pub fn is_return(&self) -> bool {
        (IRETURN..=RETURN).contains(&self.opcode())
    }

    /// Whether execution never falls through to the next instruction.
    pub fn ends_block(&self) -> bool {
        match self {
            Instruction::Plain(bytes) => matches!(bytes[0], IRETURN..=RETURN | ATHROW | RET),
            Instruction::Branch { opcode, .. } | Instruction::WideBranch { opcode, .. } => {
                matches!(*opcode, GOTO | GOTO_W)
            }
            Instruction::TableSwitch { .. } | Instruction::LookupSwitch { .. } => true,
        }
    }

    /// Constant pool index operand of an `invoke*`, field or type instruction.
    pub fn cp_index(&self) -> Option<u16> {
        match self {
            Instruction::Plain(bytes) if bytes.len() >= 3 => match bytes[0] {
                0xb2..=0xba | NEW | 0xbd | 0xc0 | 0xc1 | 0xc5 | LDC_W | 0x14 => {
                    Some(u16::from_be_bytes([bytes[1], bytes[2]]))
                }
                _ => None,
            },
            Instruction::Plain(bytes) if bytes[0] == LDC => Some(bytes[1] as u16),
            _ => None,
        }
    }

    /// Old offsets this instruction may transfer control to.
    pub fn targets(&self) -> Vec<u32> {
        match self {
            Instruction::Plain(_) => Vec::new(),
            Instruction::Branch { target, .. } | Instruction::WideBranch { target, .. } => vec![*target],
            Instruction::TableSwitch { default, targets, .. } => {
                std::iter::once(*default).chain(targets.iter().copied()).collect()
            }
            Instruction::LookupSwitch { default, pairs } => {
                std::iter::once(*default).chain(pairs.iter().map(|(_, t)| *t)).collect()
            }
        }
    }

    fn encoded_len(&self, pc: u32) -> u32 {
        match self {
            Instruction::Plain(bytes) => bytes.len() as u32,
            Instruction::Branch { .. } => 3,
            Instruction::WideBranch { .. } => 5,
            Instruction::TableSwitch { targets, .. } => 1 + switch_padding(pc) + 12 + 4 * targets.len() as u32,
            Instruction::LookupSwitch { pairs, .. } => 1 + switch_padding(pc) + 8 + 8 * pairs.len() as u32,
        }
    }
}

/// A decoded instruction together with its offset in the original code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub pc: u32,
    pub insn: Instruction,
}

fn switch_padding(pc: u32) -> u32 {
    (4 - (pc + 1) % 4) % 4
}

/// Length of fixed-size instructions, opcode included.
fn fixed_len(opcode: u8) -> Option<usize> {
    let len = match opcode {
        0x00..=0x0f => 1,
        BIPUSH => 2,
        SIPUSH => 3,
        LDC => 2,
        LDC_W | 0x14 => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        RET => 2,
        IRETURN..=RETURN => 1,
        0xb2..=0xb8 => 3,
        INVOKEINTERFACE | INVOKEDYNAMIC => 5,
        NEW => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | ATHROW => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        0xc5 => 4,
        _ => return None,
    };
    Some(len)
}

/// Decodes a whole Code array. Every branch target must land on an
/// instruction boundary.
pub fn decode(code: &[u8]) -> Result<Vec<Located>, ClassFileError> {
    let mut out = Vec::with_capacity(code.len() / 2);
    let mut pc = 0usize;
    let eof = ClassFileError::UnexpectedEof;

    while pc < code.len() {
        let opcode = code[pc];
        let at = pc as u32;
        let relative = |offset: i32| -> Result<u32, ClassFileError> {
            let target = at as i64 + offset as i64;
            if target < 0 || target >= code.len() as i64 {
                return Err(ClassFileError::InvalidOffset(target.max(0) as u32));
            }
            Ok(target as u32)
        };
        let read_i4 = |pos: usize| -> Result<i32, ClassFileError> {
            code.get(pos..pos + 4)
                .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or(ClassFileError::UnexpectedEof)
        };

        let (insn, len) = match opcode {
            IFEQ..=JSR | IFNULL | IFNONNULL => {
                let b = code.get(pc + 1..pc + 3).ok_or(eof.clone())?;
                let offset = i16::from_be_bytes([b[0], b[1]]) as i32;
                (Instruction::Branch { opcode, target: relative(offset)? }, 3)
            }
            GOTO_W | JSR_W => {
                let offset = read_i4(pc + 1)?;
                (Instruction::WideBranch { opcode, target: relative(offset)? }, 5)
            }
            TABLESWITCH => {
                let base = pc + 1 + switch_padding(at) as usize;
                let default = relative(read_i4(base)?)?;
                let low = read_i4(base + 4)?;
                let high = read_i4(base + 8)?;
                if high < low {
                    return Err(ClassFileError::InvalidAttribute("tableswitch bounds"));
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if base + 12 + count * 4 > code.len() {
                    return Err(eof);
                }
                let mut targets = Vec::with_capacity(count);
                for i in 0..count {
                    targets.push(relative(read_i4(base + 12 + i * 4)?)?);
                }
                (Instruction::TableSwitch { default, low, targets }, base + 12 + count * 4 - pc)
            }
            LOOKUPSWITCH => {
                let base = pc + 1 + switch_padding(at) as usize;
                let default = relative(read_i4(base)?)?;
                let npairs = read_i4(base + 4)?;
                if npairs < 0 {
                    return Err(ClassFileError::InvalidAttribute("lookupswitch pair count"));
                }
                let npairs = npairs as usize;
                if base + 8 + npairs * 8 > code.len() {
                    return Err(eof);
                }
                let mut pairs = Vec::with_capacity(npairs);
                for i in 0..npairs {
                    let key = read_i4(base + 8 + i * 8)?;
                    let target = relative(read_i4(base + 12 + i * 8)?)?;
                    pairs.push((key, target));
                }
                (Instruction::LookupSwitch { default, pairs }, base + 8 + npairs * 8 - pc)
            }
            WIDE => {
                let modified = *code.get(pc + 1).ok_or(eof.clone())?;
                let len = if modified == 0x84 { 6 } else { 4 };
                let bytes = code.get(pc..pc + len).ok_or(eof.clone())?;
                (Instruction::Plain(bytes.to_vec()), len)
            }
            _ => {
                let len = fixed_len(opcode).ok_or(ClassFileError::UnsupportedOpcode { opcode, pc: at })?;
                let bytes = code.get(pc..pc + len).ok_or(eof.clone())?;
                (Instruction::Plain(bytes.to_vec()), len)
            }
        };

        out.push(Located { pc: at, insn });
        pc += len;
    }

    let boundaries: std::collections::HashSet<u32> = out.iter().map(|l| l.pc).collect();
    for located in &out {
        for target in located.insn.targets() {
            if !boundaries.contains(&target) {
                return Err(ClassFileError::InvalidOffset(target));
            }
        }
    }
    Ok(out)
}

/// One unit of the new method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    /// The original instruction at this index of the decoded list.
    Original(usize),
    /// Injected code that runs before the next original instruction and is
    /// where branches to that instruction now land.
    Prefix(Vec<u8>),
    /// Injected code that is not a branch destination of the original code.
    Detached(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Layout {
    pub code: Vec<u8>,
    /// Start of every piece, followed by the end of the code.
    starts: Vec<u32>,
    /// Old pc to the new offset branches to it land on.
    labels: Vec<u32>,
    /// Old pc to the new offset of the instruction itself.
    insns: Vec<u32>,
    body_end: u32,
}

const UNMAPPED: u32 = u32::MAX;

impl Layout {
    /// Where control that used to reach `old_pc` arrives now. `old_pc` may
    /// equal the original code length, which maps to the end of the original
    /// body.
    pub fn label(&self, old_pc: u32) -> Result<u32, ClassFileError> {
        match self.labels.get(old_pc as usize) {
            Some(&pc) if pc != UNMAPPED => Ok(pc),
            _ => Err(ClassFileError::InvalidOffset(old_pc)),
        }
    }

    /// New offset of the original instruction that was at `old_pc`.
    pub fn instruction(&self, old_pc: u32) -> Result<u32, ClassFileError> {
        match self.insns.get(old_pc as usize) {
            Some(&pc) if pc != UNMAPPED => Ok(pc),
            _ => Err(ClassFileError::InvalidOffset(old_pc)),
        }
    }

    pub fn piece_start(&self, piece: usize) -> u32 {
        self.starts[piece]
    }

    pub fn piece_end(&self, piece: usize) -> u32 {
        self.starts[piece + 1]
    }

    /// End of the last original instruction.
    pub fn body_end(&self) -> u32 {
        self.body_end
    }
}

/// Lays out `pieces` and encodes them, relocating every branch.
pub fn assemble(insns: &[Located], code_len: u32, pieces: &[Piece]) -> Result<Layout, ClassFileError> {
    let mut starts = Vec::with_capacity(pieces.len() + 1);
    let mut labels = vec![UNMAPPED; code_len as usize + 1];
    let mut instr_pcs = vec![UNMAPPED; code_len as usize + 1];
    let mut pending_prefix: Option<u32> = None;
    let mut body_end = 0u32;
    let mut pc = 0u32;

    for piece in pieces {
        starts.push(pc);
        match piece {
            Piece::Prefix(bytes) => {
                pending_prefix.get_or_insert(pc);
                pc += bytes.len() as u32;
            }
            Piece::Detached(bytes) => {
                pending_prefix = None;
                pc += bytes.len() as u32;
            }
            Piece::Original(index) => {
                let located = insns.get(*index).ok_or(ClassFileError::InvalidOffset(*index as u32))?;
                let old = located.pc as usize;
                labels[old] = pending_prefix.take().unwrap_or(pc);
                instr_pcs[old] = pc;
                pc += located.insn.encoded_len(pc);
                body_end = pc;
            }
        }
        if pc as usize > u16::MAX as usize {
            return Err(ClassFileError::CodeTooLarge(pc as usize));
        }
    }
    starts.push(pc);
    labels[code_len as usize] = body_end;
    instr_pcs[code_len as usize] = body_end;

    let mut code = Vec::with_capacity(pc as usize);
    for (i, piece) in pieces.iter().enumerate() {
        let start = starts[i];
        match piece {
            Piece::Prefix(bytes) | Piece::Detached(bytes) => code.extend_from_slice(bytes),
            Piece::Original(index) => encode(&insns[*index].insn, start, &labels, &mut code)?,
        }
        debug_assert_eq!(code.len() as u32, starts[i + 1]);
    }

    Ok(Layout { code, starts, labels, insns: instr_pcs, body_end })
}

fn encode(insn: &Instruction, pc: u32, labels: &[u32], out: &mut Vec<u8>) -> Result<(), ClassFileError> {
    let offset_to = |target: u32| -> Result<i32, ClassFileError> {
        match labels.get(target as usize) {
            Some(&new) if new != UNMAPPED => Ok(new as i32 - pc as i32),
            _ => Err(ClassFileError::InvalidOffset(target)),
        }
    };

    match insn {
        Instruction::Plain(bytes) => out.extend_from_slice(bytes),
        Instruction::Branch { opcode, target } => {
            let offset = offset_to(*target)?;
            let offset = i16::try_from(offset).map_err(|_| ClassFileError::BranchOverflow { pc })?;
            out.push(*opcode);
            out.extend_from_slice(&offset.to_be_bytes());
        }
        Instruction::WideBranch { opcode, target } => {
            out.push(*opcode);
            out.extend_from_slice(&offset_to(*target)?.to_be_bytes());
        }
        Instruction::TableSwitch { default, low, targets } => {
            out.push(TABLESWITCH);
            out.extend(std::iter::repeat(0).take(switch_padding(pc) as usize));
            out.extend_from_slice(&offset_to(*default)?.to_be_bytes());
            out.extend_from_slice(&low.to_be_bytes());
            let high = *low as i64 + targets.len() as i64 - 1;
            out.extend_from_slice(&(high as i32).to_be_bytes());
            for &target in targets {
                out.extend_from_slice(&offset_to(target)?.to_be_bytes());
            }
        }
        Instruction::LookupSwitch { default, pairs } => {
            out.push(LOOKUPSWITCH);
            out.extend(std::iter::repeat(0).take(switch_padding(pc) as usize));
            out.extend_from_slice(&offset_to(*default)?.to_be_bytes());
            out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
            for &(key, target) in pairs {
                out.extend_from_slice(&key.to_be_bytes());
                out.extend_from_slice(&offset_to(target)?.to_be_bytes());
            }
        }
    }
    Ok(())
}

/// Builder for injected snippets.
#[derive(Debug, Default, Clone)]
pub struct Snippet {
    bytes: Vec<u8>,
}

impl Snippet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.bytes.push(opcode);
        self
    }

    pub fn op_u2(&mut self, opcode: u8, operand: u16) -> &mut Self {
        self.bytes.push(opcode);
        self.bytes.extend_from_slice(&operand.to_be_bytes());
        self
    }

    pub fn sipush(&mut self, value: i16) -> &mut Self {
        self.op_u2(SIPUSH, value as u16)
    }

    pub fn ldc_w(&mut self, index: u16) -> &mut Self {
        self.op_u2(LDC_W, index)
    }

    pub fn invokestatic(&mut self, methodref: u16) -> &mut Self {
        self.op_u2(INVOKESTATIC, methodref)
    }

    /// `xload` with the short, one-byte and `wide` encodings. `base` is the
    /// one-byte form (`iload`, `lload`, ...), `short_base` the `_0` form.
    pub fn load(&mut self, base: u8, short_base: u8, slot: u16) -> &mut Self {
        self.local_op(base, short_base, slot)
    }

    pub fn lstore(&mut self, slot: u16) -> &mut Self {
        self.local_op(LSTORE, LSTORE_0, slot)
    }

    pub fn lload(&mut self, slot: u16) -> &mut Self {
        self.local_op(LLOAD, LLOAD_0, slot)
    }

    fn local_op(&mut self, base: u8, short_base: u8, slot: u16) -> &mut Self {
        if slot <= 3 {
            self.bytes.push(short_base + slot as u8);
        } else if slot <= u8::MAX as u16 {
            self.bytes.push(base);
            self.bytes.push(slot as u8);
        } else {
            self.bytes.push(WIDE);
            self.bytes.push(base);
            self.bytes.extend_from_slice(&slot.to_be_bytes());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn build(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}
