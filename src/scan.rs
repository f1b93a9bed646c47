use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use jclassfile::methods::MethodFlags;
use opentelemetry::KeyValue;
use rayon::prelude::*;
use tracing::{debug, info};
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

use crate::classfile::code::CODE;
use crate::classfile::{ACC_INTERFACE, ClassFile, read_access_flags};
use crate::hierarchy::{SymbolTable, TypeInfo};
use crate::ir::internal_name;
use crate::telemetry::{Telemetry, with_span};

/// Declared method as seen by ownership resolution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodSummary {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) is_static: bool,
    pub(crate) has_code: bool,
}

/// Header facts and method list of one class.
#[derive(Clone, Debug)]
pub(crate) struct ClassSummary {
    /// Internal name.
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) is_interface: bool,
    pub(crate) methods: Vec<MethodSummary>,
}

/// One class file and where it lives inside its container.
#[derive(Clone, Debug)]
pub(crate) struct ClassEntry {
    /// Jar entry name, or path relative to the scanned directory.
    pub(crate) path: String,
    pub(crate) bytes: Vec<u8>,
    pub(crate) summary: ClassSummary,
}

/// Every class of one jar or class directory, keyed by internal name.
#[derive(Debug)]
pub(crate) struct ClassSet {
    source: PathBuf,
    classes: BTreeMap<String, ClassEntry>,
}

impl ClassSet {
    pub(crate) fn load(path: &Path, telemetry: Option<&Telemetry>) -> Result<Self> {
        let attributes = [KeyValue::new(
            "debugproof.jar_path",
            path.display().to_string(),
        )];
        with_span(telemetry, "jar.scan", &attributes, || -> Result<Self> {
            let raw = if path.is_dir() {
                read_dir_entries(path)?
            } else {
                read_jar_entries(path)?
            };
            let set = Self::from_raw(path, raw)?;
            info!(path = %path.display(), classes = set.len(), "scanned classes");
            Ok(set)
        })
    }

    /// Build a set from `(entry path, class bytes)` pairs read from `source`.
    pub(crate) fn from_raw(source: &Path, raw: Vec<(String, Vec<u8>)>) -> Result<Self> {
        let entries = raw
            .into_par_iter()
            .map(|(entry_path, bytes)| -> Result<ClassEntry> {
                let summary = summarize(&bytes).with_context(|| {
                    format!("failed to parse {}:{}", source.display(), entry_path)
                })?;
                Ok(ClassEntry {
                    path: entry_path,
                    bytes,
                    summary,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut classes = BTreeMap::new();
        for entry in entries {
            classes.insert(entry.summary.name.clone(), entry);
        }
        Ok(Self {
            source: source.to_path_buf(),
            classes,
        })
    }

    pub(crate) fn source(&self) -> &Path {
        &self.source
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.len()
    }

    /// Look up a class by dotted or internal name.
    pub(crate) fn get(&self, class_name: &str) -> Option<&ClassEntry> {
        self.classes.get(&internal_name(class_name))
    }

    pub(crate) fn contains(&self, class_name: &str) -> bool {
        self.get(class_name).is_some()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &ClassEntry> {
        self.classes.values()
    }

    /// Symbol table over this set plus any additional sets.
    pub(crate) fn symbol_table(&self, others: &[&ClassSet]) -> SymbolTable {
        let mut table = SymbolTable::new();
        for set in std::iter::once(self).chain(others.iter().copied()) {
            for entry in set.entries() {
                let summary = &entry.summary;
                table.insert(
                    &summary.name,
                    TypeInfo {
                        super_name: summary.super_name.clone(),
                        interfaces: summary.interfaces.clone(),
                        is_interface: summary.is_interface,
                    },
                );
            }
        }
        table
    }
}

fn is_scanned_class(name: &str) -> bool {
    name.ends_with(".class")
        && !name.ends_with("module-info.class")
        && !name.starts_with("META-INF/versions/")
}

fn read_jar_entries(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;
    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() || !is_scanned_class(entry.name()) {
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        entries.push((name, data));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

fn read_dir_entries(root: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    let mut entries = Vec::new();
    for file in files {
        let relative = relative_entry(root, &file)?;
        if !is_scanned_class(&relative) {
            continue;
        }
        let data = fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
        entries.push((relative, data));
    }
    Ok(entries)
}

/// Regular files under `path`, in sorted order.
fn collect_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut children = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        children.push(entry.path());
    }
    children.sort();
    for child in children {
        if child.is_dir() {
            collect_files(&child, files)?;
        } else {
            files.push(child);
        }
    }
    Ok(())
}

fn relative_entry(root: &Path, file: &Path) -> Result<String> {
    let relative = file
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", file.display(), root.display()))?;
    let parts = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    Ok(parts.join("/"))
}

fn summarize(data: &[u8]) -> Result<ClassSummary> {
    let access_flags = read_access_flags(data).context("read class access flags")?;
    let class_file = match class_file::parse(data) {
        Ok(parsed) => parsed,
        Err(err) => {
            let message = format!("{err}");
            if message.contains("unmatched attribute") {
                debug!(%message, "falling back to raw class model");
                return summarize_raw(data);
            }
            return Err(err).context("failed to parse class file bytes");
        }
    };
    let constant_pool = class_file.constant_pool();
    let name =
        resolve_class_name(constant_pool, class_file.this_class()).context("resolve class name")?;
    let super_name = if class_file.super_class() == 0 {
        None
    } else {
        Some(
            resolve_class_name(constant_pool, class_file.super_class())
                .context("resolve super class name")?,
        )
    };
    let mut interfaces = Vec::new();
    for interface in class_file.interfaces() {
        interfaces
            .push(resolve_class_name(constant_pool, *interface).context("resolve interface name")?);
    }
    let mut methods = Vec::new();
    for method in class_file.methods() {
        let method_name =
            resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?;
        let descriptor = resolve_utf8(constant_pool, method.descriptor_index())
            .context("resolve method descriptor")?;
        let has_code = method
            .attributes()
            .iter()
            .any(|attribute| matches!(attribute, jclassfile::attributes::Attribute::Code { .. }));
        methods.push(MethodSummary {
            name: method_name,
            descriptor,
            is_static: method.access_flags().contains(MethodFlags::ACC_STATIC),
            has_code,
        });
    }
    Ok(ClassSummary {
        name,
        super_name,
        interfaces,
        is_interface: access_flags & ACC_INTERFACE != 0,
        methods,
    })
}

fn summarize_raw(data: &[u8]) -> Result<ClassSummary> {
    let class_file = ClassFile::parse(data).context("failed to parse class file bytes")?;
    let mut interfaces = Vec::new();
    for interface in &class_file.interfaces {
        interfaces.push(class_file.pool.class_name(*interface)?);
    }
    let mut methods = Vec::new();
    for method in &class_file.methods {
        let mut has_code = false;
        for attribute in &method.attributes {
            if class_file.attribute_name(attribute)? == CODE {
                has_code = true;
            }
        }
        methods.push(MethodSummary {
            name: class_file.member_name(method)?,
            descriptor: class_file.member_descriptor(method)?,
            is_static: method.is_static(),
            has_code,
        });
    }
    Ok(ClassSummary {
        name: class_file.name()?,
        super_name: class_file.super_name()?,
        interfaces,
        is_interface: class_file.is_interface(),
        methods,
    })
}

fn resolve_class_name(constant_pool: &[ConstantPool], class_index: u16) -> Result<String> {
    let entry = constant_pool
        .get(class_index as usize)
        .context("missing class entry")?;
    match entry {
        ConstantPool::Class { name_index } => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("unexpected class entry"),
    }
}

fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing utf8 entry")?;
    match entry {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("unexpected utf8 entry"),
    }
}

/// Write a copy of `source` to `output` with the given entries replaced.
/// Entries not replaced are copied without recompression.
pub(crate) fn write_output(
    source: &Path,
    replacements: &BTreeMap<String, Vec<u8>>,
    output: &Path,
) -> Result<()> {
    if source.is_dir() {
        write_dir(source, replacements, output)
    } else {
        write_jar(source, replacements, output)
    }
}

fn write_jar(source: &Path, replacements: &BTreeMap<String, Vec<u8>>, output: &Path) -> Result<()> {
    let file =
        fs::File::open(source).with_context(|| format!("failed to open {}", source.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", source.display()))?;
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let out = fs::File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = zip::ZipWriter::new(out);
    let mut written = 0usize;
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .with_context(|| format!("failed to read {}", source.display()))?;
        let name = entry.name().to_string();
        match replacements.get(&name) {
            Some(bytes) => {
                writer
                    .start_file(name.as_str(), SimpleFileOptions::default())
                    .with_context(|| format!("failed to start {name}"))?;
                writer
                    .write_all(bytes)
                    .with_context(|| format!("failed to write {name}"))?;
                written += 1;
            }
            None => writer
                .raw_copy_file(entry)
                .with_context(|| format!("failed to copy {name}"))?,
        }
    }
    writer
        .finish()
        .with_context(|| format!("failed to finish {}", output.display()))?;
    if written != replacements.len() {
        anyhow::bail!(
            "{} replacement entries are missing from {}",
            replacements.len() - written,
            source.display()
        );
    }
    info!(output = %output.display(), replaced = written, "wrote jar");
    Ok(())
}

fn write_dir(source: &Path, replacements: &BTreeMap<String, Vec<u8>>, output: &Path) -> Result<()> {
    let mut files = Vec::new();
    collect_files(source, &mut files)?;
    let mut written = 0usize;
    for file in files {
        let relative = relative_entry(source, &file)?;
        let target = output.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        match replacements.get(&relative) {
            Some(bytes) => {
                fs::write(&target, bytes)
                    .with_context(|| format!("failed to write {}", target.display()))?;
                written += 1;
            }
            None => {
                fs::copy(&file, &target)
                    .with_context(|| format!("failed to copy {}", file.display()))?;
            }
        }
    }
    if written != replacements.len() {
        anyhow::bail!(
            "{} replacement entries are missing from {}",
            replacements.len() - written,
            source.display()
        );
    }
    info!(output = %output.display(), replaced = written, "wrote class directory");
    Ok(())
}
