//! Append-only constant pool.
//!
//! Entries read from the class are kept both decoded (for lookups) and as the
//! exact bytes they were read from, which are written back untouched. New
//! entries go after them and reuse an existing equal entry when there is one.

use super::{ClassFileError, Reader, Writer};
use std::collections::HashMap;

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

/// A resolved field or method reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub owner: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
    pub interface: bool,
}

/// Dedup key for the entry kinds the rewriter appends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Utf8(String),
    Integer(i32),
    Class(u16),
    String(u16),
    NameAndType(u16, u16),
    Methodref(u16, u16),
    InterfaceMethodref(u16, u16),
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    /// Slot 0 and the second slot of longs and doubles are `None`.
    entries: Vec<Option<Constant>>,
    /// Utf8 entries whose decoded text does not re-encode to the stored bytes.
    inexact: Vec<u16>,
    original: Vec<u8>,
    appended: Vec<u8>,
    index: Option<HashMap<Key, u16>>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    /// An empty pool, for generating a class from scratch.
    pub fn new() -> Self {
        Self { entries: vec![None], inexact: Vec::new(), original: Vec::new(), appended: Vec::new(), index: None }
    }

    pub fn parse(r: &mut Reader) -> Result<Self, ClassFileError> {
        let count = r.read_u2()? as usize;
        let start = r.position();
        let mut entries: Vec<Option<Constant>> = Vec::with_capacity(count);
        let mut inexact = Vec::new();
        entries.push(None);

        while entries.len() < count {
            let index = entries.len() as u16;
            let tag = r.read_u1()?;
            let entry = match tag {
                TAG_UTF8 => {
                    let len = r.read_u2()? as usize;
                    let bytes = r.read_bytes(len)?;
                    let (text, exact) = decode_modified_utf8(bytes).ok_or(ClassFileError::InvalidUtf8(index))?;
                    if !exact {
                        inexact.push(index);
                    }
                    Constant::Utf8(text)
                }
                TAG_INTEGER => Constant::Integer(r.read_i4()?),
                TAG_FLOAT => Constant::Float(f32::from_bits(r.read_u4()?)),
                TAG_LONG | TAG_DOUBLE => {
                    let high = r.read_u4()? as u64;
                    let low = r.read_u4()? as u64;
                    let bits = (high << 32) | low;
                    let entry = if tag == TAG_LONG {
                        Constant::Long(bits as i64)
                    } else {
                        Constant::Double(f64::from_bits(bits))
                    };
                    entries.push(Some(entry));
                    entries.push(None);
                    continue;
                }
                TAG_CLASS => Constant::Class { name_index: r.read_u2()? },
                TAG_STRING => Constant::String { string_index: r.read_u2()? },
                TAG_FIELDREF => Constant::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
                TAG_METHODREF => Constant::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
                TAG_INTERFACE_METHODREF => {
                    Constant::InterfaceMethodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? }
                }
                TAG_NAME_AND_TYPE => Constant::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
                TAG_METHOD_HANDLE => Constant::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? },
                TAG_METHOD_TYPE => Constant::MethodType { descriptor_index: r.read_u2()? },
                TAG_DYNAMIC => {
                    Constant::Dynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? }
                }
                TAG_INVOKE_DYNAMIC => {
                    Constant::InvokeDynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? }
                }
                TAG_MODULE => Constant::Module { name_index: r.read_u2()? },
                TAG_PACKAGE => Constant::Package { name_index: r.read_u2()? },
                _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
            };
            entries.push(Some(entry));
        }

        // A long or double in the last slot overshoots the declared count.
        if entries.len() != count.max(1) {
            return Err(ClassFileError::InvalidConstantPoolIndex(count as u16));
        }

        let original = r.slice(start, r.position()).to_vec();
        Ok(Self { entries, inexact, original, appended: Vec::new(), index: None })
    }

    /// Number of slots including the unused slot 0, as written in the header.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// Whether entries were appended since parsing.
    pub fn is_modified(&self) -> bool {
        !self.appended.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.original.len() + self.appended.len()
    }

    pub fn write(&self, w: &mut Writer) -> Result<(), ClassFileError> {
        let count = u16::try_from(self.entries.len()).map_err(|_| ClassFileError::ConstantPoolOverflow)?;
        w.u2(count);
        w.bytes(&self.original);
        w.bytes(&self.appended);
        Ok(())
    }

    pub fn get(&self, index: u16) -> Result<&Constant, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantPoolIndex(index))
    }

    pub fn utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            Constant::Utf8(s) => Ok(s.as_str()),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), ClassFileError> {
        match self.get(index)? {
            Constant::NameAndType { name_index, descriptor_index } => {
                Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?))
            }
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>, ClassFileError> {
        let (class_index, nat_index, interface) = match self.get(index)? {
            Constant::Fieldref { class_index, name_and_type_index }
            | Constant::Methodref { class_index, name_and_type_index } => (*class_index, *name_and_type_index, false),
            Constant::InterfaceMethodref { class_index, name_and_type_index } => {
                (*class_index, *name_and_type_index, true)
            }
            _ => return Err(ClassFileError::InvalidConstantPoolIndex(index)),
        };
        let owner = self.class_name(class_index)?;
        let (name, descriptor) = self.name_and_type(nat_index)?;
        Ok(MemberRef { owner, name, descriptor, interface })
    }

    pub fn add_utf8(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let encoded = encode_modified_utf8(value);
        let len = u16::try_from(encoded.len()).map_err(|_| ClassFileError::InvalidAttribute("utf8 constant too long"))?;
        self.intern(Key::Utf8(value.to_string()), Constant::Utf8(value.to_string()), |w| {
            w.u1(TAG_UTF8);
            w.u2(len);
            w.bytes(&encoded);
        })
    }

    pub fn add_integer(&mut self, value: i32) -> Result<u16, ClassFileError> {
        self.intern(Key::Integer(value), Constant::Integer(value), |w| {
            w.u1(TAG_INTEGER);
            w.i4(value);
        })
    }

    pub fn add_class(&mut self, name: &str) -> Result<u16, ClassFileError> {
        let name_index = self.add_utf8(name)?;
        self.intern(Key::Class(name_index), Constant::Class { name_index }, |w| {
            w.u1(TAG_CLASS);
            w.u2(name_index);
        })
    }

    pub fn add_string(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let string_index = self.add_utf8(value)?;
        self.intern(Key::String(string_index), Constant::String { string_index }, |w| {
            w.u1(TAG_STRING);
            w.u2(string_index);
        })
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.intern(
            Key::NameAndType(name_index, descriptor_index),
            Constant::NameAndType { name_index, descriptor_index },
            |w| {
                w.u1(TAG_NAME_AND_TYPE);
                w.u2(name_index);
                w.u2(descriptor_index);
            },
        )
    }

    pub fn add_methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(
            Key::Methodref(class_index, name_and_type_index),
            Constant::Methodref { class_index, name_and_type_index },
            |w| {
                w.u1(TAG_METHODREF);
                w.u2(class_index);
                w.u2(name_and_type_index);
            },
        )
    }

    pub fn add_interface_methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(
            Key::InterfaceMethodref(class_index, name_and_type_index),
            Constant::InterfaceMethodref { class_index, name_and_type_index },
            |w| {
                w.u1(TAG_INTERFACE_METHODREF);
                w.u2(class_index);
                w.u2(name_and_type_index);
            },
        )
    }

    fn intern(&mut self, key: Key, constant: Constant, encode: impl FnOnce(&mut Writer)) -> Result<u16, ClassFileError> {
        if self.index.is_none() {
            self.index = Some(self.build_index());
        }
        if let Some(&existing) = self.index.as_ref().and_then(|index| index.get(&key)) {
            return Ok(existing);
        }
        if self.entries.len() >= u16::MAX as usize {
            return Err(ClassFileError::ConstantPoolOverflow);
        }

        let slot = self.entries.len() as u16;
        let mut w = Writer::with_capacity(8);
        encode(&mut w);
        self.appended.extend_from_slice(&w.into_bytes());
        self.entries.push(Some(constant));
        if let Some(index) = self.index.as_mut() {
            index.insert(key, slot);
        }
        Ok(slot)
    }

    fn build_index(&self) -> HashMap<Key, u16> {
        let mut index = HashMap::with_capacity(self.entries.len());
        for (slot, entry) in self.entries.iter().enumerate() {
            let Some(entry) = entry else { continue };
            let slot = slot as u16;
            let key = match entry {
                Constant::Utf8(s) if !self.inexact.contains(&slot) => Key::Utf8(s.clone()),
                Constant::Integer(v) => Key::Integer(*v),
                Constant::Class { name_index } => Key::Class(*name_index),
                Constant::String { string_index } => Key::String(*string_index),
                Constant::NameAndType { name_index, descriptor_index } => Key::NameAndType(*name_index, *descriptor_index),
                Constant::Methodref { class_index, name_and_type_index } => {
                    Key::Methodref(*class_index, *name_and_type_index)
                }
                Constant::InterfaceMethodref { class_index, name_and_type_index } => {
                    Key::InterfaceMethodref(*class_index, *name_and_type_index)
                }
                _ => continue,
            };
            // First occurrence wins, matching what javac would have referenced.
            index.entry(key).or_insert(slot);
        }
        index
    }
}

/// Decodes the JVM's modified UTF-8.
///
/// Returns the text and whether encoding it again reproduces `bytes`; lone
/// surrogates and overlong forms decode lossily and report `false`.
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<(String, bool)> {
    if bytes.iter().all(|&b| b != 0 && b < 0x80) {
        return std::str::from_utf8(bytes).ok().map(|s| (s.to_string(), true));
    }

    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            0x01..=0x7f => {
                units.push(b as u16);
                i += 1;
            }
            0xc0..=0xdf => {
                let b2 = *bytes.get(i + 1)?;
                if b2 & 0xc0 != 0x80 {
                    return None;
                }
                units.push((((b & 0x1f) as u16) << 6) | (b2 & 0x3f) as u16);
                i += 2;
            }
            0xe0..=0xef => {
                let b2 = *bytes.get(i + 1)?;
                let b3 = *bytes.get(i + 2)?;
                if b2 & 0xc0 != 0x80 || b3 & 0xc0 != 0x80 {
                    return None;
                }
                units.push((((b & 0x0f) as u16) << 12) | (((b2 & 0x3f) as u16) << 6) | (b3 & 0x3f) as u16);
                i += 3;
            }
            _ => return None,
        }
    }

    let text: String = char::decode_utf16(units.iter().copied())
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    let exact = encode_modified_utf8(&text) == bytes;
    Some((text, exact))
}

pub fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut buf = [0u16; 2];
    for c in text.chars() {
        for &unit in c.encode_utf16(&mut buf).iter() {
            match unit {
                0x0001..=0x007f => out.push(unit as u8),
                0x0000 | 0x0080..=0x07ff => {
                    out.push(0xc0 | (unit >> 6) as u8);
                    out.push(0x80 | (unit & 0x3f) as u8);
                }
                _ => {
                    out.push(0xe0 | (unit >> 12) as u8);
                    out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                    out.push(0x80 | (unit & 0x3f) as u8);
                }
            }
        }
    }
    out
}
