//! Minimal class file writer for unit tests.

use crate::classfile::annotations::VISIBLE_ANNOTATIONS;

pub(crate) struct ClassFileBuilder {
    cp: Vec<CpEntry>,
    major_version: u16,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    methods: Vec<MethodDef>,
    class_annotations: Vec<u16>,
    code_index: u16,
    annotations_index: u16,
}

impl ClassFileBuilder {
    pub(crate) fn new(class_name: &str, super_name: &str) -> Self {
        let mut builder = Self {
            cp: Vec::new(),
            major_version: 52,
            access_flags: 0x0021,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            methods: Vec::new(),
            class_annotations: Vec::new(),
            code_index: 0,
            annotations_index: 0,
        };
        builder.code_index = builder.add_utf8("Code");
        builder.annotations_index = builder.add_utf8(VISIBLE_ANNOTATIONS);
        builder.this_class = builder.add_class(class_name);
        builder.super_class = builder.add_class(super_name);
        builder
    }

    pub(crate) fn add_utf8(&mut self, value: &str) -> u16 {
        self.cp.push(CpEntry::Utf8(value.to_string()));
        self.cp.len() as u16
    }

    pub(crate) fn add_class(&mut self, name: &str) -> u16 {
        let name_index = self.add_utf8(name);
        self.cp.push(CpEntry::Class(name_index));
        self.cp.len() as u16
    }

    pub(crate) fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.cp
            .push(CpEntry::NameAndType(name_index, descriptor_index));
        self.cp.len() as u16
    }

    pub(crate) fn add_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, descriptor);
        self.cp
            .push(CpEntry::MethodRef(class_index, name_and_type));
        self.cp.len() as u16
    }

    pub(crate) fn add_long_constant(&mut self, value: u64) -> u16 {
        self.cp.push(CpEntry::Long(value));
        let index = self.cp.len() as u16;
        self.cp.push(CpEntry::Reserved);
        index
    }

    pub(crate) fn set_major_version(&mut self, major_version: u16) {
        self.major_version = major_version;
    }

    pub(crate) fn add_interface(&mut self, name: &str) {
        let index = self.add_class(name);
        self.interfaces.push(index);
    }

    pub(crate) fn annotate_class(&mut self, descriptor: &str) {
        let index = self.add_utf8(descriptor);
        self.class_annotations.push(index);
    }

    /// Add a public method with a body; returns its position.
    pub(crate) fn add_method(
        &mut self,
        name: &str,
        descriptor: &str,
        code: Vec<u8>,
        max_stack: u16,
        max_locals: u16,
    ) -> usize {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.methods.push(MethodDef {
            access_flags: 0x0001,
            name_index,
            descriptor_index,
            body: Some(Body {
                code,
                max_stack,
                max_locals,
            }),
            annotations: Vec::new(),
        });
        self.methods.len() - 1
    }

    pub(crate) fn add_abstract_method(&mut self, name: &str, descriptor: &str) -> usize {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.methods.push(MethodDef {
            access_flags: 0x0401,
            name_index,
            descriptor_index,
            body: None,
            annotations: Vec::new(),
        });
        self.methods.len() - 1
    }

    /// Public void test method `name()V` that returns immediately.
    pub(crate) fn add_test_method(&mut self, name: &str, annotation: &str) -> usize {
        let index = self.add_method(name, "()V", vec![0xb1], 0, 1);
        self.annotate_method(index, annotation);
        index
    }

    pub(crate) fn make_static(&mut self, method: usize) {
        self.methods[method].access_flags |= 0x0008;
    }

    pub(crate) fn annotate_method(&mut self, method: usize, descriptor: &str) {
        let index = self.add_utf8(descriptor);
        self.methods[method].annotations.push(index);
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0xCAFEBABE);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, self.major_version);
        write_u16(&mut bytes, (self.cp.len() + 1) as u16);
        for entry in &self.cp {
            entry.write(&mut bytes);
        }
        write_u16(&mut bytes, self.access_flags);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, self.interfaces.len() as u16);
        for interface in &self.interfaces {
            write_u16(&mut bytes, *interface);
        }
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, self.methods.len() as u16);
        for method in &self.methods {
            write_u16(&mut bytes, method.access_flags);
            write_u16(&mut bytes, method.name_index);
            write_u16(&mut bytes, method.descriptor_index);
            let attribute_count =
                u16::from(method.body.is_some()) + u16::from(!method.annotations.is_empty());
            write_u16(&mut bytes, attribute_count);
            if let Some(body) = &method.body {
                write_u16(&mut bytes, self.code_index);
                write_u32(&mut bytes, 12 + body.code.len() as u32);
                write_u16(&mut bytes, body.max_stack);
                write_u16(&mut bytes, body.max_locals);
                write_u32(&mut bytes, body.code.len() as u32);
                bytes.extend_from_slice(&body.code);
                write_u16(&mut bytes, 0);
                write_u16(&mut bytes, 0);
            }
            if !method.annotations.is_empty() {
                write_markers(&mut bytes, self.annotations_index, &method.annotations);
            }
        }
        if self.class_annotations.is_empty() {
            write_u16(&mut bytes, 0);
        } else {
            write_u16(&mut bytes, 1);
            write_markers(&mut bytes, self.annotations_index, &self.class_annotations);
        }
        bytes
    }
}

fn write_markers(bytes: &mut Vec<u8>, name_index: u16, types: &[u16]) {
    write_u16(bytes, name_index);
    write_u32(bytes, 2 + 4 * types.len() as u32);
    write_u16(bytes, types.len() as u16);
    for type_index in types {
        write_u16(bytes, *type_index);
        write_u16(bytes, 0);
    }
}

struct MethodDef {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    body: Option<Body>,
    annotations: Vec<u16>,
}

struct Body {
    code: Vec<u8>,
    max_stack: u16,
    max_locals: u16,
}

enum CpEntry {
    Utf8(String),
    Class(u16),
    NameAndType(u16, u16),
    MethodRef(u16, u16),
    Long(u64),
    /// Second slot of a long constant.
    Reserved,
}

impl CpEntry {
    fn write(&self, bytes: &mut Vec<u8>) {
        match self {
            CpEntry::Utf8(value) => {
                bytes.push(1);
                write_u16(bytes, value.len() as u16);
                bytes.extend_from_slice(value.as_bytes());
            }
            CpEntry::Class(name_index) => {
                bytes.push(7);
                write_u16(bytes, *name_index);
            }
            CpEntry::NameAndType(name_index, descriptor_index) => {
                bytes.push(12);
                write_u16(bytes, *name_index);
                write_u16(bytes, *descriptor_index);
            }
            CpEntry::MethodRef(class_index, name_and_type) => {
                bytes.push(10);
                write_u16(bytes, *class_index);
                write_u16(bytes, *name_and_type);
            }
            CpEntry::Long(value) => {
                bytes.push(5);
                bytes.extend_from_slice(&value.to_be_bytes());
            }
            CpEntry::Reserved => {}
        }
    }
}

fn write_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

fn write_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn high(value: u16) -> u8 {
    (value >> 8) as u8
}

pub(crate) fn low(value: u16) -> u8 {
    (value & 0xff) as u8
}
