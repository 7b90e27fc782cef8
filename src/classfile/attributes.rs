//! Decoders and encoders for the attributes the rewriter has to look inside.

use super::{parse_attributes, write_attributes, ClassFileError, RawAttribute, Reader, Writer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Zero catches everything.
    pub catch_type: u16,
}

impl CodeAttribute {
    pub fn parse(info: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(info);
        let max_stack = r.read_u2()?;
        let max_locals = r.read_u2()?;
        let code_length = r.read_u4()? as usize;
        let code = r.read_bytes(code_length)?.to_vec();
        let exception_table_length = r.read_u2()? as usize;
        let mut exception_table = Vec::with_capacity(exception_table_length);
        for _ in 0..exception_table_length {
            exception_table.push(ExceptionTableEntry {
                start_pc: r.read_u2()?,
                end_pc: r.read_u2()?,
                handler_pc: r.read_u2()?,
                catch_type: r.read_u2()?,
            });
        }
        let attributes = parse_attributes(&mut r)?;
        if r.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute("Code"));
        }
        Ok(Self { max_stack, max_locals, code, exception_table, attributes })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassFileError> {
        if self.code.is_empty() || self.code.len() > u16::MAX as usize {
            return Err(ClassFileError::CodeTooLarge(self.code.len()));
        }
        let mut w = Writer::with_capacity(self.code.len() + 64);
        w.u2(self.max_stack);
        w.u2(self.max_locals);
        w.u4(self.code.len() as u32);
        w.bytes(&self.code);
        w.u2(self.exception_table.len() as u16);
        for entry in &self.exception_table {
            w.u2(entry.start_pc);
            w.u2(entry.end_pc);
            w.u2(entry.handler_pc);
            w.u2(entry.catch_type);
        }
        write_attributes(&mut w, &self.attributes)?;
        Ok(w.into_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same { offset_delta: u16 },
    SameLocals1StackItem { offset_delta: u16, stack: VerificationType },
    Chop { offset_delta: u16, k: u8 },
    Append { offset_delta: u16, locals: Vec<VerificationType> },
    Full { offset_delta: u16, locals: Vec<VerificationType>, stack: Vec<VerificationType> },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Offset of the `new` instruction that created the value.
    Uninitialized(u16),
}

impl VerificationType {
    /// Local variable slots the type occupies.
    pub fn slots(&self) -> u16 {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }
}

/// Decodes a StackMapTable. The short and extended forms of `same` and
/// `same_locals_1_stack_item` collapse into one variant each.
pub fn parse_stack_map_table(info: &[u8]) -> Result<Vec<StackMapFrame>, ClassFileError> {
    let mut r = Reader::new(info);
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        let frame_type = r.read_u1()?;
        let frame = match frame_type {
            0..=63 => StackMapFrame::Same { offset_delta: frame_type as u16 },
            64..=127 => {
                let stack = parse_verification_type(&mut r)?;
                StackMapFrame::SameLocals1StackItem { offset_delta: (frame_type - 64) as u16, stack }
            }
            247 => {
                let offset_delta = r.read_u2()?;
                let stack = parse_verification_type(&mut r)?;
                StackMapFrame::SameLocals1StackItem { offset_delta, stack }
            }
            248..=250 => {
                let offset_delta = r.read_u2()?;
                StackMapFrame::Chop { offset_delta, k: 251u8 - frame_type }
            }
            251 => StackMapFrame::Same { offset_delta: r.read_u2()? },
            252..=254 => {
                let offset_delta = r.read_u2()?;
                let count = (frame_type - 251) as usize;
                let mut locals = Vec::with_capacity(count);
                for _ in 0..count {
                    locals.push(parse_verification_type(&mut r)?);
                }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = r.read_u2()?;
                let num_locals = r.read_u2()? as usize;
                let mut locals = Vec::with_capacity(num_locals);
                for _ in 0..num_locals {
                    locals.push(parse_verification_type(&mut r)?);
                }
                let num_stack = r.read_u2()? as usize;
                let mut stack = Vec::with_capacity(num_stack);
                for _ in 0..num_stack {
                    stack.push(parse_verification_type(&mut r)?);
                }
                StackMapFrame::Full { offset_delta, locals, stack }
            }
            _ => return Err(ClassFileError::InvalidAttribute("StackMapTable")),
        };
        entries.push(frame);
    }
    if r.remaining() != 0 {
        return Err(ClassFileError::InvalidAttribute("StackMapTable"));
    }
    Ok(entries)
}

fn parse_verification_type(r: &mut Reader) -> Result<VerificationType, ClassFileError> {
    let tag = r.read_u1()?;
    let info = match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(r.read_u2()?),
        8 => VerificationType::Uninitialized(r.read_u2()?),
        _ => return Err(ClassFileError::InvalidAttribute("StackMapTable")),
    };
    Ok(info)
}

/// Encodes frames using the most compact form each one allows.
pub fn write_stack_map_table(frames: &[StackMapFrame]) -> Vec<u8> {
    let mut w = Writer::with_capacity(frames.len() * 8 + 2);
    w.u2(frames.len() as u16);
    for frame in frames {
        match frame {
            StackMapFrame::Same { offset_delta } if *offset_delta < 64 => w.u1(*offset_delta as u8),
            StackMapFrame::Same { offset_delta } => {
                w.u1(251);
                w.u2(*offset_delta);
            }
            StackMapFrame::SameLocals1StackItem { offset_delta, stack } if *offset_delta < 64 => {
                w.u1(64 + *offset_delta as u8);
                write_verification_type(&mut w, stack);
            }
            StackMapFrame::SameLocals1StackItem { offset_delta, stack } => {
                w.u1(247);
                w.u2(*offset_delta);
                write_verification_type(&mut w, stack);
            }
            StackMapFrame::Chop { offset_delta, k } => {
                w.u1(251 - k);
                w.u2(*offset_delta);
            }
            StackMapFrame::Append { offset_delta, locals } => {
                w.u1(251 + locals.len() as u8);
                w.u2(*offset_delta);
                for local in locals {
                    write_verification_type(&mut w, local);
                }
            }
            StackMapFrame::Full { offset_delta, locals, stack } => {
                w.u1(255);
                w.u2(*offset_delta);
                w.u2(locals.len() as u16);
                for local in locals {
                    write_verification_type(&mut w, local);
                }
                w.u2(stack.len() as u16);
                for item in stack {
                    write_verification_type(&mut w, item);
                }
            }
        }
    }
    w.into_bytes()
}

fn write_verification_type(w: &mut Writer, ty: &VerificationType) {
    match ty {
        VerificationType::Top => w.u1(0),
        VerificationType::Integer => w.u1(1),
        VerificationType::Float => w.u1(2),
        VerificationType::Double => w.u1(3),
        VerificationType::Long => w.u1(4),
        VerificationType::Null => w.u1(5),
        VerificationType::UninitializedThis => w.u1(6),
        VerificationType::Object(index) => {
            w.u1(7);
            w.u2(*index);
        }
        VerificationType::Uninitialized(offset) => {
            w.u1(8);
            w.u2(*offset);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

pub fn parse_line_numbers(info: &[u8]) -> Result<Vec<LineNumberEntry>, ClassFileError> {
    let mut r = Reader::new(info);
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        entries.push(LineNumberEntry { start_pc: r.read_u2()?, line_number: r.read_u2()? });
    }
    Ok(entries)
}

pub fn write_line_numbers(entries: &[LineNumberEntry]) -> Vec<u8> {
    let mut w = Writer::with_capacity(entries.len() * 4 + 2);
    w.u2(entries.len() as u16);
    for entry in entries {
        w.u2(entry.start_pc);
        w.u2(entry.line_number);
    }
    w.into_bytes()
}

/// An entry of LocalVariableTable or LocalVariableTypeTable; the two share a
/// layout and differ only in what `descriptor_index` points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

pub fn parse_local_variables(info: &[u8]) -> Result<Vec<LocalVariableEntry>, ClassFileError> {
    let mut r = Reader::new(info);
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        entries.push(LocalVariableEntry {
            start_pc: r.read_u2()?,
            length: r.read_u2()?,
            name_index: r.read_u2()?,
            descriptor_index: r.read_u2()?,
            index: r.read_u2()?,
        });
    }
    Ok(entries)
}

pub fn write_local_variables(entries: &[LocalVariableEntry]) -> Vec<u8> {
    let mut w = Writer::with_capacity(entries.len() * 10 + 2);
    w.u2(entries.len() as u16);
    for entry in entries {
        w.u2(entry.start_pc);
        w.u2(entry.length);
        w.u2(entry.name_index);
        w.u2(entry.descriptor_index);
        w.u2(entry.index);
    }
    w.into_bytes()
}

/// Constant pool indexes of the type descriptors in a
/// Runtime(In)VisibleAnnotations payload.
pub fn annotation_type_indexes(info: &[u8]) -> Result<Vec<u16>, ClassFileError> {
    let mut r = Reader::new(info);
    let num = r.read_u2()? as usize;
    let mut types = Vec::with_capacity(num);
    for _ in 0..num {
        types.push(skip_annotation(&mut r)?);
    }
    Ok(types)
}

fn skip_annotation(r: &mut Reader) -> Result<u16, ClassFileError> {
    let type_index = r.read_u2()?;
    let num_pairs = r.read_u2()? as usize;
    for _ in 0..num_pairs {
        let _element_name_index = r.read_u2()?;
        skip_element_value(r)?;
    }
    Ok(type_index)
}

fn skip_element_value(r: &mut Reader) -> Result<(), ClassFileError> {
    let tag = r.read_u1()?;
    match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => r.skip(2),
        b'e' => r.skip(4),
        b'@' => skip_annotation(r).map(|_| ()),
        b'[' => {
            let num_values = r.read_u2()? as usize;
            for _ in 0..num_values {
                skip_element_value(r)?;
            }
            Ok(())
        }
        _ => Err(ClassFileError::InvalidAttribute("annotation")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_map_compact_forms_survive_reencoding() {
        let frames = vec![
            StackMapFrame::Same { offset_delta: 3 },
            StackMapFrame::Same { offset_delta: 300 },
            StackMapFrame::SameLocals1StackItem { offset_delta: 0, stack: VerificationType::Object(7) },
            StackMapFrame::Chop { offset_delta: 2, k: 1 },
            StackMapFrame::Append {
                offset_delta: 5,
                locals: vec![VerificationType::Long, VerificationType::Uninitialized(12)],
            },
            StackMapFrame::Full {
                offset_delta: 1,
                locals: vec![VerificationType::UninitializedThis],
                stack: vec![VerificationType::Null, VerificationType::Integer],
            },
        ];
        let bytes = write_stack_map_table(&frames);
        assert_eq!(bytes[2], 3);
        assert_eq!(bytes[3], 251);
        assert_eq!(parse_stack_map_table(&bytes).unwrap(), frames);
    }

    #[test]
    fn annotation_types_skip_nested_values() {
        let mut w = Writer::new();
        w.u2(2);
        // @A(x = {1, @B}) where the nested annotation also has a type index.
        w.u2(10);
        w.u2(1);
        w.u2(11);
        w.u1(b'[');
        w.u2(2);
        w.u1(b'I');
        w.u2(12);
        w.u1(b'@');
        w.u2(13);
        w.u2(0);
        // @C(e = SomeEnum.VALUE)
        w.u2(20);
        w.u2(1);
        w.u2(21);
        w.u1(b'e');
        w.u2(22);
        w.u2(23);
        assert_eq!(annotation_type_indexes(&w.into_bytes()).unwrap(), vec![10, 20]);
    }

    #[test]
    fn code_attribute_rejects_trailing_bytes() {
        let code = CodeAttribute {
            max_stack: 1,
            max_locals: 1,
            code: vec![0xb1],
            exception_table: vec![],
            attributes: vec![],
        };
        let mut bytes = code.to_bytes().unwrap();
        assert_eq!(CodeAttribute::parse(&bytes).unwrap(), code);
        bytes.push(0);
        assert!(CodeAttribute::parse(&bytes).is_err());
    }
}
