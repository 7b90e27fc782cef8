//! Class file model for load-time rewriting.
//!
//! The parser keeps everything it does not need to understand as raw bytes:
//! member and class attributes stay opaque until a caller decodes one of them
//! through [`attributes`]. Writing a parsed class back without edits yields the
//! original bytes, and the constant pool only ever grows at its tail, so every
//! index an untouched attribute refers to stays valid.

pub mod attributes;
pub mod constant_pool;
pub mod descriptor;
mod reader;

pub use constant_pool::{Constant, ConstantPool, MemberRef};
pub use reader::{Reader, Writer};

use thiserror::Error;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
pub const ACC_BRIDGE: u16 = 0x0040;
pub const ACC_VARARGS: u16 = 0x0080;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;
pub const ACC_ANNOTATION: u16 = 0x2000;
pub const ACC_ENUM: u16 = 0x4000;
pub const ACC_MODULE: u16 = 0x8000;

const MAGIC: u32 = 0xCAFE_BABE;

/// First class file version that carries StackMapTable frames.
pub const STACK_MAP_VERSION: u16 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassFileError {
    #[error("unexpected end of class data")]
    UnexpectedEof,
    #[error("invalid magic: {0:#x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool index: {0}")]
    InvalidConstantPoolIndex(u16),
    #[error("invalid constant pool tag: {0}")]
    InvalidConstantPoolTag(u8),
    #[error("malformed modified UTF-8 in constant pool entry {0}")]
    InvalidUtf8(u16),
    #[error("invalid attribute: {0}")]
    InvalidAttribute(&'static str),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("unsupported opcode {opcode:#04x} at pc {pc}")]
    UnsupportedOpcode { opcode: u8, pc: u32 },
    #[error("pc {0} is not an instruction boundary")]
    InvalidOffset(u32),
    #[error("branch at pc {pc} no longer fits a 16-bit offset")]
    BranchOverflow { pc: u32 },
    #[error("constant pool is full")]
    ConstantPoolOverflow,
    #[error("code length {0} exceeds the 65535 byte limit")]
    CodeTooLarge(usize),
}

/// An attribute kept as its name index and undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl RawAttribute {
    pub fn name<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.utf8(self.name_index)
    }
}

/// A field or method table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<RawAttribute>,
}

impl MemberInfo {
    pub fn name<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.utf8(self.name_index)
    }

    pub fn descriptor<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.utf8(self.descriptor_index)
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.access_flags & flag != 0
    }

    /// Position and payload of the first attribute called `name`.
    pub fn find_attribute(&self, cp: &ConstantPool, name: &str) -> Option<(usize, &RawAttribute)> {
        find_attribute(&self.attributes, cp, name)
    }

    /// Type descriptors of the visible and invisible annotations on this member.
    pub fn annotations(&self, cp: &ConstantPool) -> Result<Vec<String>, ClassFileError> {
        annotation_descriptors(&self.attributes, cp)
    }
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<RawAttribute>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }

        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;

        let constant_pool = ConstantPool::parse(&mut r)?;

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;

        let interfaces_count = r.read_u2()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(r.read_u2()?);
        }

        let fields = parse_members(&mut r)?;
        let methods = parse_members(&mut r)?;
        let attributes = parse_attributes(&mut r)?;

        if r.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute("trailing bytes after class"));
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassFileError> {
        let mut w = Writer::with_capacity(self.constant_pool.encoded_len() + 512);
        w.u4(MAGIC);
        w.u2(self.minor_version);
        w.u2(self.major_version);
        self.constant_pool.write(&mut w)?;
        w.u2(self.access_flags);
        w.u2(self.this_class);
        w.u2(self.super_class);
        w.u2(self.interfaces.len() as u16);
        for &interface in &self.interfaces {
            w.u2(interface);
        }
        write_members(&mut w, &self.fields)?;
        write_members(&mut w, &self.methods)?;
        write_attributes(&mut w, &self.attributes)?;
        Ok(w.into_bytes())
    }

    /// Internal (slash separated) name of this class.
    pub fn name(&self) -> Result<&str, ClassFileError> {
        self.constant_pool.class_name(self.this_class)
    }

    /// Internal name of the superclass; `None` only for `java/lang/Object`.
    pub fn super_name(&self) -> Result<Option<&str>, ClassFileError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> Result<Vec<&str>, ClassFileError> {
        self.interfaces
            .iter()
            .map(|&index| self.constant_pool.class_name(index))
            .collect()
    }

    pub fn annotations(&self) -> Result<Vec<String>, ClassFileError> {
        annotation_descriptors(&self.attributes, &self.constant_pool)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    /// Index of the method with exactly this name and descriptor.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods.iter().position(|m| {
            m.name(&self.constant_pool).map(|n| n == name).unwrap_or(false)
                && m.descriptor(&self.constant_pool).map(|d| d == descriptor).unwrap_or(false)
        })
    }
}

/// The part of a class file ahead of its fields: enough to place the class
/// in the hierarchy without reading its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassHeader {
    pub access_flags: u16,
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
}

impl ClassHeader {
    pub fn scan(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }
        r.skip(4)?;
        let cp = ConstantPool::parse(&mut r)?;
        let access_flags = r.read_u2()?;
        let name = cp.class_name(r.read_u2()?)?.to_string();
        let super_index = r.read_u2()?;
        let super_name = if super_index == 0 {
            None
        } else {
            Some(cp.class_name(super_index)?.to_string())
        };
        let count = r.read_u2()?;
        let mut interfaces = Vec::with_capacity(count as usize);
        for _ in 0..count {
            interfaces.push(cp.class_name(r.read_u2()?)?.to_string());
        }
        Ok(Self { access_flags, name, super_name, interfaces })
    }
}

pub(crate) fn find_attribute<'a>(
    attributes: &'a [RawAttribute],
    cp: &ConstantPool,
    name: &str,
) -> Option<(usize, &'a RawAttribute)> {
    attributes
        .iter()
        .enumerate()
        .find(|(_, attr)| attr.name(cp).map(|n| n == name).unwrap_or(false))
}

fn annotation_descriptors(attrs: &[RawAttribute], cp: &ConstantPool) -> Result<Vec<String>, ClassFileError> {
    let mut out = Vec::new();
    for attr in attrs {
        match attr.name(cp)? {
            "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                for type_index in attributes::annotation_type_indexes(&attr.info)? {
                    out.push(cp.utf8(type_index)?.to_string());
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

fn parse_members(r: &mut Reader) -> Result<Vec<MemberInfo>, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        let access_flags = r.read_u2()?;
        let name_index = r.read_u2()?;
        let descriptor_index = r.read_u2()?;
        let attributes = parse_attributes(r)?;
        members.push(MemberInfo { access_flags, name_index, descriptor_index, attributes });
    }
    Ok(members)
}

pub(crate) fn parse_attributes(r: &mut Reader) -> Result<Vec<RawAttribute>, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut attrs = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = r.read_u2()?;
        let length = r.read_u4()? as usize;
        let info = r.read_bytes(length)?.to_vec();
        attrs.push(RawAttribute { name_index, info });
    }
    Ok(attrs)
}

fn write_members(w: &mut Writer, members: &[MemberInfo]) -> Result<(), ClassFileError> {
    w.u2(members.len() as u16);
    for member in members {
        w.u2(member.access_flags);
        w.u2(member.name_index);
        w.u2(member.descriptor_index);
        write_attributes(w, &member.attributes)?;
    }
    Ok(())
}

pub(crate) fn write_attributes(w: &mut Writer, attributes: &[RawAttribute]) -> Result<(), ClassFileError> {
    w.u2(attributes.len() as u16);
    for attr in attributes {
        let len = u32::try_from(attr.info.len()).map_err(|_| ClassFileError::InvalidAttribute("attribute too large"))?;
        w.u2(attr.name_index);
        w.u4(len);
        w.bytes(&attr.info);
    }
    Ok(())
}
