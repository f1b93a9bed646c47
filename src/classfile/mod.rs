//! Round-trippable class file model.
//!
//! Only the parts the rewriter touches are structured; everything else is kept
//! as raw bytes so unmodified content is written back unchanged.

pub(crate) mod annotations;
pub(crate) mod code;

use anyhow::{Context, Result};

/// Access flag marking an interface.
pub(crate) const ACC_INTERFACE: u16 = 0x0200;
pub(crate) const ACC_STATIC: u16 = 0x0008;

/// First class file major version whose methods carry stack map tables.
pub(crate) const STACK_MAP_MAJOR_VERSION: u16 = 50;

/// Constant pool entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Constant {
    /// Modified UTF-8 bytes, stored undecoded.
    Utf8(Vec<u8>),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref(u16, u16),
    Methodref(u16, u16),
    InterfaceMethodref(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
    Module(u16),
    Package(u16),
    /// Index zero and the slot after a long or double.
    Unusable,
}

/// A field, method or interface member reference resolved to names.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MemberRef {
    pub(crate) class_name: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// Constant pool with 1-based indexing.
#[derive(Clone, Debug)]
pub(crate) struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub(crate) fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    /// Number of slots including the unusable index zero.
    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, index: u16) -> Result<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => {
                anyhow::bail!("invalid constant pool index {index}")
            }
            Some(entry) => Ok(entry),
        }
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Utf8(bytes) => Ok(String::from_utf8_lossy(bytes).to_string()),
            _ => anyhow::bail!("unexpected utf8 entry at {index}"),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Class(name_index) => self.utf8(*name_index),
            _ => anyhow::bail!("unexpected class entry at {index}"),
        }
    }

    pub(crate) fn name_and_type(&self, index: u16) -> Result<(String, String)> {
        match self.get(index)? {
            Constant::NameAndType(name_index, descriptor_index) => {
                Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?))
            }
            _ => anyhow::bail!("unexpected name and type entry at {index}"),
        }
    }

    pub(crate) fn member_ref(&self, index: u16) -> Result<MemberRef> {
        let (class_index, name_and_type) = match self.get(index)? {
            Constant::Fieldref(class_index, nat)
            | Constant::Methodref(class_index, nat)
            | Constant::InterfaceMethodref(class_index, nat) => (*class_index, *nat),
            _ => anyhow::bail!("unexpected member ref entry at {index}"),
        };
        let class_name = self.class_name(class_index).context("resolve member owner")?;
        let (name, descriptor) = self.name_and_type(name_and_type)?;
        Ok(MemberRef {
            class_name,
            name,
            descriptor,
        })
    }

    fn push(&mut self, entry: Constant) -> Result<u16> {
        let wide = matches!(entry, Constant::Long(_) | Constant::Double(_));
        let needed = if wide { 2 } else { 1 };
        if self.entries.len() + needed > u16::MAX as usize {
            anyhow::bail!("constant pool is full");
        }
        let index = self.entries.len() as u16;
        self.entries.push(entry);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    fn find(&self, wanted: &Constant) -> Option<u16> {
        self.entries
            .iter()
            .position(|entry| entry == wanted)
            .map(|index| index as u16)
    }

    fn intern(&mut self, entry: Constant) -> Result<u16> {
        match self.find(&entry) {
            Some(index) => Ok(index),
            None => self.push(entry),
        }
    }

    /// Index of a utf8 entry with this value, appending one when absent.
    pub(crate) fn add_utf8(&mut self, value: &str) -> Result<u16> {
        self.intern(Constant::Utf8(encode_modified_utf8(value)))
    }

    pub(crate) fn add_class(&mut self, name: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        self.intern(Constant::Class(name_index))
    }

    pub(crate) fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.intern(Constant::NameAndType(name_index, descriptor_index))
    }

    pub(crate) fn add_method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let class_index = self.add_class(class)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::Methodref(class_index, name_and_type))
    }

    fn parse(data: &[u8], offset: &mut usize) -> Result<Self> {
        let count = read_u16_class(data, offset)?;
        let mut pool = Self::new();
        let mut index = 1u16;
        while index < count {
            let tag = read_u8_class(data, offset)?;
            let entry = match tag {
                1 => {
                    let len = read_u16_class(data, offset)? as usize;
                    Constant::Utf8(read_bytes_class(data, offset, len)?.to_vec())
                }
                3 => Constant::Integer(read_u32_class(data, offset)?),
                4 => Constant::Float(read_u32_class(data, offset)?),
                5 | 6 => {
                    let high = read_u32_class(data, offset)? as u64;
                    let low = read_u32_class(data, offset)? as u64;
                    let bits = (high << 32) | low;
                    if tag == 5 {
                        Constant::Long(bits)
                    } else {
                        Constant::Double(bits)
                    }
                }
                7 => Constant::Class(read_u16_class(data, offset)?),
                8 => Constant::String(read_u16_class(data, offset)?),
                9 | 10 | 11 | 12 | 17 | 18 => {
                    let first = read_u16_class(data, offset)?;
                    let second = read_u16_class(data, offset)?;
                    match tag {
                        9 => Constant::Fieldref(first, second),
                        10 => Constant::Methodref(first, second),
                        11 => Constant::InterfaceMethodref(first, second),
                        12 => Constant::NameAndType(first, second),
                        17 => Constant::Dynamic(first, second),
                        _ => Constant::InvokeDynamic(first, second),
                    }
                }
                15 => {
                    let kind = read_u8_class(data, offset)?;
                    Constant::MethodHandle(kind, read_u16_class(data, offset)?)
                }
                16 => Constant::MethodType(read_u16_class(data, offset)?),
                19 => Constant::Module(read_u16_class(data, offset)?),
                20 => Constant::Package(read_u16_class(data, offset)?),
                _ => anyhow::bail!("unsupported constant pool tag: {}", tag),
            };
            let wide = matches!(entry, Constant::Long(_) | Constant::Double(_));
            pool.entries.push(entry);
            if wide {
                pool.entries.push(Constant::Unusable);
                index += 1;
            }
            index += 1;
        }
        Ok(pool)
    }

    fn write(&self, bytes: &mut Vec<u8>) {
        write_u16(bytes, self.entries.len() as u16);
        for entry in &self.entries[1..] {
            match entry {
                Constant::Utf8(value) => {
                    bytes.push(1);
                    write_u16(bytes, value.len() as u16);
                    bytes.extend_from_slice(value);
                }
                Constant::Integer(value) => {
                    bytes.push(3);
                    write_u32(bytes, *value);
                }
                Constant::Float(value) => {
                    bytes.push(4);
                    write_u32(bytes, *value);
                }
                Constant::Long(value) => {
                    bytes.push(5);
                    bytes.extend_from_slice(&value.to_be_bytes());
                }
                Constant::Double(value) => {
                    bytes.push(6);
                    bytes.extend_from_slice(&value.to_be_bytes());
                }
                Constant::Class(index) => write_tagged_u16(bytes, 7, *index),
                Constant::String(index) => write_tagged_u16(bytes, 8, *index),
                Constant::Fieldref(a, b) => write_tagged_pair(bytes, 9, *a, *b),
                Constant::Methodref(a, b) => write_tagged_pair(bytes, 10, *a, *b),
                Constant::InterfaceMethodref(a, b) => write_tagged_pair(bytes, 11, *a, *b),
                Constant::NameAndType(a, b) => write_tagged_pair(bytes, 12, *a, *b),
                Constant::MethodHandle(kind, index) => {
                    bytes.push(15);
                    bytes.push(*kind);
                    write_u16(bytes, *index);
                }
                Constant::MethodType(index) => write_tagged_u16(bytes, 16, *index),
                Constant::Dynamic(a, b) => write_tagged_pair(bytes, 17, *a, *b),
                Constant::InvokeDynamic(a, b) => write_tagged_pair(bytes, 18, *a, *b),
                Constant::Module(index) => write_tagged_u16(bytes, 19, *index),
                Constant::Package(index) => write_tagged_u16(bytes, 20, *index),
                Constant::Unusable => {}
            }
        }
    }
}

fn write_tagged_u16(bytes: &mut Vec<u8>, tag: u8, value: u16) {
    bytes.push(tag);
    write_u16(bytes, value);
}

fn write_tagged_pair(bytes: &mut Vec<u8>, tag: u8, first: u16, second: u16) {
    bytes.push(tag);
    write_u16(bytes, first);
    write_u16(bytes, second);
}

/// Attribute with its payload left undecoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Attribute {
    pub(crate) name_index: u16,
    pub(crate) info: Vec<u8>,
}

/// Field or method declaration.
#[derive(Clone, Debug)]
pub(crate) struct Member {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<Attribute>,
}

impl Member {
    pub(crate) fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

/// Parsed class file.
#[derive(Clone, Debug)]
pub(crate) struct ClassFile {
    pub(crate) minor_version: u16,
    pub(crate) major_version: u16,
    pub(crate) pool: ConstantPool,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interfaces: Vec<u16>,
    pub(crate) fields: Vec<Member>,
    pub(crate) methods: Vec<Member>,
    pub(crate) attributes: Vec<Attribute>,
}

impl ClassFile {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let magic = read_u32_class(data, &mut offset)?;
        if magic != 0xCAFEBABE {
            anyhow::bail!("invalid class file magic");
        }
        let minor_version = read_u16_class(data, &mut offset)?;
        let major_version = read_u16_class(data, &mut offset)?;
        let pool = ConstantPool::parse(data, &mut offset).context("parse constant pool")?;
        let access_flags = read_u16_class(data, &mut offset)?;
        let this_class = read_u16_class(data, &mut offset)?;
        let super_class = read_u16_class(data, &mut offset)?;
        let interface_count = read_u16_class(data, &mut offset)? as usize;
        let mut interfaces = Vec::with_capacity(interface_count);
        for _ in 0..interface_count {
            interfaces.push(read_u16_class(data, &mut offset)?);
        }
        let fields = parse_members(data, &mut offset).context("parse fields")?;
        let methods = parse_members(data, &mut offset).context("parse methods")?;
        let attributes = parse_attributes(data, &mut offset).context("parse class attributes")?;
        if offset != data.len() {
            anyhow::bail!("trailing bytes after class file");
        }
        Ok(Self {
            minor_version,
            major_version,
            pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0xCAFEBABE);
        write_u16(&mut bytes, self.minor_version);
        write_u16(&mut bytes, self.major_version);
        self.pool.write(&mut bytes);
        write_u16(&mut bytes, self.access_flags);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, self.interfaces.len() as u16);
        for interface in &self.interfaces {
            write_u16(&mut bytes, *interface);
        }
        write_members(&mut bytes, &self.fields);
        write_members(&mut bytes, &self.methods);
        write_attributes(&mut bytes, &self.attributes);
        bytes
    }

    /// Internal name of this class.
    pub(crate) fn name(&self) -> Result<String> {
        self.pool.class_name(self.this_class).context("resolve class name")
    }

    /// Internal name of the superclass; `None` only for the root type.
    pub(crate) fn super_name(&self) -> Result<Option<String>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.pool
            .class_name(self.super_class)
            .map(Some)
            .context("resolve super class name")
    }

    pub(crate) fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub(crate) fn member_name(&self, member: &Member) -> Result<String> {
        self.pool.utf8(member.name_index).context("resolve member name")
    }

    pub(crate) fn member_descriptor(&self, member: &Member) -> Result<String> {
        self.pool
            .utf8(member.descriptor_index)
            .context("resolve member descriptor")
    }

    pub(crate) fn attribute_name(&self, attribute: &Attribute) -> Result<String> {
        self.pool
            .utf8(attribute.name_index)
            .context("resolve attribute name")
    }
}

/// Class access flags, read without decoding members.
pub(crate) fn read_access_flags(data: &[u8]) -> Result<u16> {
    let mut offset = 0usize;
    if read_u32_class(data, &mut offset)? != 0xCAFEBABE {
        anyhow::bail!("invalid class file magic");
    }
    offset += 4;
    ConstantPool::parse(data, &mut offset).context("parse constant pool")?;
    read_u16_class(data, &mut offset)
}

fn parse_members(data: &[u8], offset: &mut usize) -> Result<Vec<Member>> {
    let count = read_u16_class(data, offset)? as usize;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        let access_flags = read_u16_class(data, offset)?;
        let name_index = read_u16_class(data, offset)?;
        let descriptor_index = read_u16_class(data, offset)?;
        let attributes = parse_attributes(data, offset)?;
        members.push(Member {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }
    Ok(members)
}

fn write_members(bytes: &mut Vec<u8>, members: &[Member]) {
    write_u16(bytes, members.len() as u16);
    for member in members {
        write_u16(bytes, member.access_flags);
        write_u16(bytes, member.name_index);
        write_u16(bytes, member.descriptor_index);
        write_attributes(bytes, &member.attributes);
    }
}

pub(crate) fn parse_attributes(data: &[u8], offset: &mut usize) -> Result<Vec<Attribute>> {
    let count = read_u16_class(data, offset)? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = read_u16_class(data, offset)?;
        let length = read_u32_class(data, offset)? as usize;
        let info = read_bytes_class(data, offset, length)?.to_vec();
        attributes.push(Attribute { name_index, info });
    }
    Ok(attributes)
}

pub(crate) fn write_attributes(bytes: &mut Vec<u8>, attributes: &[Attribute]) {
    write_u16(bytes, attributes.len() as u16);
    for attribute in attributes {
        write_u16(bytes, attribute.name_index);
        write_u32(bytes, attribute.info.len() as u32);
        bytes.extend_from_slice(&attribute.info);
    }
}

/// Encode a string the way class files store utf8 constants.
pub(crate) fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(value.len());
    for ch in value.chars() {
        let code = ch as u32;
        match code {
            0 => bytes.extend_from_slice(&[0xC0, 0x80]),
            0x01..=0x7F => bytes.push(code as u8),
            0x80..=0xFFFF => {
                let mut buffer = [0u8; 4];
                bytes.extend_from_slice(ch.encode_utf8(&mut buffer).as_bytes());
            }
            _ => {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units).iter() {
                    let unit = *unit as u32;
                    bytes.push((0xE0 | (unit >> 12)) as u8);
                    bytes.push((0x80 | ((unit >> 6) & 0x3F)) as u8);
                    bytes.push((0x80 | (unit & 0x3F)) as u8);
                }
            }
        }
    }
    bytes
}

pub(crate) fn read_u8_class(data: &[u8], offset: &mut usize) -> Result<u8> {
    let byte = *data.get(*offset).context("class file out of bounds")?;
    *offset += 1;
    Ok(byte)
}

pub(crate) fn read_u16_class(data: &[u8], offset: &mut usize) -> Result<u16> {
    let bytes = read_bytes_class(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32_class(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes = read_bytes_class(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_bytes_class<'a>(
    data: &'a [u8],
    offset: &mut usize,
    len: usize,
) -> Result<&'a [u8]> {
    let start = *offset;
    let end = start.checked_add(len).context("class file out of bounds")?;
    let slice = data.get(start..end).context("class file out of bounds")?;
    *offset = end;
    Ok(slice)
}

pub(crate) fn skip_class_bytes(data: &[u8], offset: &mut usize, len: usize) -> Result<()> {
    read_bytes_class(data, offset, len)?;
    Ok(())
}

pub(crate) fn write_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes());
}
