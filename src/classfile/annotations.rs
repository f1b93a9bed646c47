use anyhow::{Context, Result};

use super::{
    Attribute, ConstantPool, read_u8_class, read_u16_class, skip_class_bytes, write_u16,
};

pub(crate) const VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
pub(crate) const INVISIBLE_ANNOTATIONS: &str = "RuntimeInvisibleAnnotations";

/// One annotation, kept as its encoded bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Annotation {
    pub(crate) type_index: u16,
    raw: Vec<u8>,
}

impl Annotation {
    /// Marker annotation without element values.
    pub(crate) fn marker(type_index: u16) -> Self {
        let mut raw = Vec::with_capacity(4);
        write_u16(&mut raw, type_index);
        write_u16(&mut raw, 0);
        Self { type_index, raw }
    }
}

pub(crate) fn parse_annotations(info: &[u8]) -> Result<Vec<Annotation>> {
    let mut offset = 0usize;
    let count = read_u16_class(info, &mut offset)? as usize;
    let mut annotations = Vec::with_capacity(count);
    for _ in 0..count {
        let start = offset;
        let type_index = read_u16_class(info, &mut offset)?;
        skip_element_pairs(info, &mut offset)?;
        annotations.push(Annotation {
            type_index,
            raw: info[start..offset].to_vec(),
        });
    }
    if offset != info.len() {
        anyhow::bail!("trailing bytes after annotations");
    }
    Ok(annotations)
}

pub(crate) fn encode_annotations(annotations: &[Annotation]) -> Vec<u8> {
    let mut info = Vec::new();
    write_u16(&mut info, annotations.len() as u16);
    for annotation in annotations {
        info.extend_from_slice(&annotation.raw);
    }
    info
}

fn skip_element_pairs(data: &[u8], offset: &mut usize) -> Result<()> {
    let pairs = read_u16_class(data, offset)?;
    for _ in 0..pairs {
        skip_class_bytes(data, offset, 2)?;
        skip_element_value(data, offset)?;
    }
    Ok(())
}

fn skip_element_value(data: &[u8], offset: &mut usize) -> Result<()> {
    let tag = read_u8_class(data, offset)?;
    match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => {
            skip_class_bytes(data, offset, 2)
        }
        b'e' => skip_class_bytes(data, offset, 4),
        b'@' => {
            skip_class_bytes(data, offset, 2)?;
            skip_element_pairs(data, offset)
        }
        b'[' => {
            let count = read_u16_class(data, offset)?;
            for _ in 0..count {
                skip_element_value(data, offset)?;
            }
            Ok(())
        }
        _ => anyhow::bail!("unsupported element value tag: {}", tag as char),
    }
}

fn is_annotation_attribute(pool: &ConstantPool, attribute: &Attribute, kind: &str) -> Result<bool> {
    Ok(pool.utf8(attribute.name_index)? == kind)
}

/// Descriptors of all annotations in the visible and invisible attributes.
pub(crate) fn annotation_descriptors(
    pool: &ConstantPool,
    attributes: &[Attribute],
) -> Result<Vec<String>> {
    let mut descriptors = Vec::new();
    for attribute in attributes {
        if !is_annotation_attribute(pool, attribute, VISIBLE_ANNOTATIONS)?
            && !is_annotation_attribute(pool, attribute, INVISIBLE_ANNOTATIONS)?
        {
            continue;
        }
        for annotation in parse_annotations(&attribute.info).context("parse annotations")? {
            descriptors.push(pool.utf8(annotation.type_index).context("resolve annotation type")?);
        }
    }
    Ok(descriptors)
}

pub(crate) fn has_annotation(
    pool: &ConstantPool,
    attributes: &[Attribute],
    descriptor: &str,
) -> Result<bool> {
    Ok(annotation_descriptors(pool, attributes)?
        .iter()
        .any(|found| found == descriptor))
}

/// Add a runtime-visible marker annotation; returns false when it was already present.
pub(crate) fn add_marker(
    pool: &mut ConstantPool,
    attributes: &mut Vec<Attribute>,
    descriptor: &str,
) -> Result<bool> {
    if has_annotation(pool, attributes, descriptor)? {
        return Ok(false);
    }
    let type_index = pool.add_utf8(descriptor)?;
    let marker = Annotation::marker(type_index);
    for attribute in attributes.iter_mut() {
        if is_annotation_attribute(pool, attribute, VISIBLE_ANNOTATIONS)? {
            let mut annotations =
                parse_annotations(&attribute.info).context("parse visible annotations")?;
            annotations.push(marker);
            attribute.info = encode_annotations(&annotations);
            return Ok(true);
        }
    }
    let name_index = pool.add_utf8(VISIBLE_ANNOTATIONS)?;
    attributes.push(Attribute {
        name_index,
        info: encode_annotations(&[marker]),
    });
    Ok(true)
}

/// Remove every annotation with one of the descriptors from both annotation
/// attributes, dropping attributes left empty. Returns how many were removed.
pub(crate) fn remove_annotations(
    pool: &ConstantPool,
    attributes: &mut Vec<Attribute>,
    descriptors: &[&str],
) -> Result<usize> {
    let mut removed = 0;
    let mut kept = Vec::with_capacity(attributes.len());
    for mut attribute in attributes.drain(..) {
        if !is_annotation_attribute(pool, &attribute, VISIBLE_ANNOTATIONS)?
            && !is_annotation_attribute(pool, &attribute, INVISIBLE_ANNOTATIONS)?
        {
            kept.push(attribute);
            continue;
        }
        let annotations = parse_annotations(&attribute.info).context("parse annotations")?;
        let before = annotations.len();
        let mut remaining = Vec::with_capacity(before);
        for annotation in annotations {
            let descriptor = pool.utf8(annotation.type_index)?;
            if !descriptors.contains(&descriptor.as_str()) {
                remaining.push(annotation);
            }
        }
        removed += before - remaining.len();
        if remaining.is_empty() {
            continue;
        }
        attribute.info = encode_annotations(&remaining);
        kept.push(attribute);
    }
    *attributes = kept;
    Ok(removed)
}
