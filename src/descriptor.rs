use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

use crate::error::RunError;
use crate::ir::{MethodRef, dotted_name};

/// Parse a JVM method descriptor such as `(ILjava/lang/String;)V`.
pub(crate) fn parse_method(descriptor: &str) -> Result<MethodDescriptor> {
    MethodDescriptor::from_str(descriptor)
        .map_err(|err| unsupported(descriptor, &err.to_string()))
}

/// Parse a JVM field descriptor such as `[Ljava/lang/Object;`.
pub(crate) fn parse_field(descriptor: &str) -> Result<TypeDescriptor> {
    TypeDescriptor::from_str(descriptor)
        .map_err(|err| unsupported(descriptor, &err.to_string()))
}

/// Element type and total array dimensions; `(t, 0)` for non-arrays.
pub(crate) fn element_and_dims(field_type: &TypeDescriptor) -> (&TypeDescriptor, usize) {
    match field_type {
        TypeDescriptor::Array(inner, dims) => {
            let (element, nested) = element_and_dims(inner);
            (element, nested + usize::from(*dims))
        }
        other => (other, 0),
    }
}

/// Type name with the package stripped, e.g. `String[]`.
pub(crate) fn simple_name(field_type: &TypeDescriptor) -> String {
    let (element, dims) = element_and_dims(field_type);
    let base = match element {
        TypeDescriptor::Object(name) => {
            let name = name.as_str();
            name.rsplit('/').next().unwrap_or(name).to_string()
        }
        other => primitive_name(other).to_string(),
    };
    format!("{base}{}", "[]".repeat(dims))
}

/// Type name with the full dotted package, e.g. `java.lang.String[]`.
pub(crate) fn qualified_name(field_type: &TypeDescriptor) -> String {
    let (element, dims) = element_and_dims(field_type);
    let base = match element {
        TypeDescriptor::Object(name) => dotted_name(name.as_str()),
        other => primitive_name(other).to_string(),
    };
    format!("{base}{}", "[]".repeat(dims))
}

/// Descriptor text, e.g. `[Ljava/lang/String;`.
pub(crate) fn descriptor_text(field_type: &TypeDescriptor) -> String {
    let (element, dims) = element_and_dims(field_type);
    let base = match element {
        TypeDescriptor::Boolean => "Z".to_string(),
        TypeDescriptor::Byte => "B".to_string(),
        TypeDescriptor::Char => "C".to_string(),
        TypeDescriptor::Short => "S".to_string(),
        TypeDescriptor::Integer => "I".to_string(),
        TypeDescriptor::Long => "J".to_string(),
        TypeDescriptor::Float => "F".to_string(),
        TypeDescriptor::Double => "D".to_string(),
        TypeDescriptor::Void => "V".to_string(),
        TypeDescriptor::Object(name) => format!("L{};", name.as_str()),
        TypeDescriptor::Array(..) => String::new(),
    };
    format!("{}{base}", "[".repeat(dims))
}

fn primitive_name(field_type: &TypeDescriptor) -> &'static str {
    match field_type {
        TypeDescriptor::Boolean => "boolean",
        TypeDescriptor::Byte => "byte",
        TypeDescriptor::Char => "char",
        TypeDescriptor::Short => "short",
        TypeDescriptor::Integer => "int",
        TypeDescriptor::Long => "long",
        TypeDescriptor::Float => "float",
        TypeDescriptor::Double => "double",
        TypeDescriptor::Void => "void",
        TypeDescriptor::Object(_) | TypeDescriptor::Array(..) => "",
    }
}

/// Canonical parameter list used for matching, e.g. `(ILjava/lang/String;[I)J` becomes
/// `(int, String, int[])`. Input already ending in `)` is taken as normalized.
pub(crate) fn normalize_descriptor(descriptor: &str) -> Result<String> {
    if descriptor.ends_with(')') {
        let end = descriptor
            .find(')')
            .ok_or_else(|| unsupported(descriptor, "missing closing parenthesis"))?;
        return Ok(descriptor[..=end].to_string());
    }
    let parsed = parse_method(descriptor)?;
    let names: Vec<String> = parsed.parameter_types().iter().map(simple_name).collect();
    Ok(format!("({})", names.join(", ")))
}

/// Method signature in the form the Java debugger accepts for breakpoints,
/// e.g. `a.b.C.run(java.lang.String, int[])`.
pub(crate) fn jdb_signature(method: &MethodRef) -> Result<String> {
    let parsed = parse_method(&method.descriptor)
        .with_context(|| format!("build debugger signature for {method}"))?;
    let names: Vec<String> = parsed.parameter_types().iter().map(qualified_name).collect();
    Ok(format!(
        "{}.{}({})",
        dotted_name(&method.declaring_class),
        method.name,
        names.join(", ")
    ))
}

/// JNI symbol of the native counterpart, e.g. `Java_a_b_C_run`.
pub(crate) fn native_symbol(method: &MethodRef) -> String {
    let symbol = format!(
        "Java_{}_{}",
        dotted_name(&method.declaring_class).replace('.', "_"),
        method.name
    );
    symbol.replace('$', "_00024")
}

/// Local variable slots taken by the arguments, including `this` for instance methods.
pub(crate) fn argument_slots(descriptor: &str, is_static: bool) -> Result<usize> {
    let descriptor = parse_method(descriptor)?;
    let mut slots = if is_static { 0 } else { 1 };
    for param in descriptor.parameter_types() {
        slots += match param {
            TypeDescriptor::Long | TypeDescriptor::Double => 2,
            _ => 1,
        };
    }
    Ok(slots)
}

fn unsupported(descriptor: &str, reason: &str) -> anyhow::Error {
    anyhow::Error::new(RunError::MethodNotResolvable(format!(
        "descriptor {descriptor:?}: {reason}"
    )))
}
