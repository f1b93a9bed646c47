//! Stack map frame recomputation.
//!
//! Runs a type-level abstract interpretation over a method body, merging
//! states at join points through a [`TypeHierarchy`], and emits a
//! `StackMapTable` made of full frames.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Context, Result};
use jdescriptor::TypeDescriptor;

use crate::classfile::code::{
    CodeAttribute, ExceptionEntry, STACK_MAP_TABLE, instruction_length, padding, read_i16,
    read_i32, read_u16,
};
use crate::classfile::{Attribute, Constant, ConstantPool, write_u16};
use crate::descriptor::{descriptor_text, element_and_dims, parse_field, parse_method};
use crate::hierarchy::TypeHierarchy;
use crate::ir::ROOT_CLASS;
use crate::opcodes;

const THROWABLE: &str = "java/lang/Throwable";

/// Verification type of one local slot or stack entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum VType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Internal class name or array descriptor.
    Object(String),
    /// Result of the `new` at this offset, before its constructor runs.
    Uninitialized(u16),
}

impl VType {
    /// Verification type of a value of `field_type`; `None` for void.
    fn from_descriptor(field_type: &TypeDescriptor) -> Option<Self> {
        let value = match field_type {
            TypeDescriptor::Void => return None,
            TypeDescriptor::Array(..) => VType::Object(descriptor_text(field_type)),
            TypeDescriptor::Object(name) => VType::Object(name.to_string()),
            TypeDescriptor::Long => VType::Long,
            TypeDescriptor::Float => VType::Float,
            TypeDescriptor::Double => VType::Double,
            _ => VType::Integer,
        };
        Some(value)
    }

    fn is_wide(&self) -> bool {
        matches!(self, VType::Long | VType::Double)
    }

    fn size(&self) -> usize {
        if self.is_wide() { 2 } else { 1 }
    }

    fn is_reference(&self) -> bool {
        matches!(self, VType::Null | VType::Object(_))
    }
}

/// Types of the locals and operand stack at one instruction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Frame {
    /// One entry per slot; a long or double is followed by `Top`.
    pub(crate) locals: Vec<VType>,
    /// One entry per value regardless of its size.
    pub(crate) stack: Vec<VType>,
}

impl Frame {
    /// Frame on entry to a method.
    pub(crate) fn initial(
        class_name: &str,
        descriptor: &str,
        is_static: bool,
        is_constructor: bool,
    ) -> Result<Self> {
        let mut frame = Frame::default();
        if !is_static {
            if is_constructor && class_name != ROOT_CLASS {
                frame.locals.push(VType::UninitializedThis);
            } else {
                frame.locals.push(VType::Object(class_name.to_string()));
            }
        }
        let parsed = parse_method(descriptor)?;
        for param in parsed.parameter_types() {
            let value = VType::from_descriptor(param).context("void parameter type")?;
            let wide = value.is_wide();
            frame.locals.push(value);
            if wide {
                frame.locals.push(VType::Top);
            }
        }
        Ok(frame)
    }

    fn push(&mut self, value: VType) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<VType> {
        self.stack.pop().context("operand stack underflow")
    }

    fn pop_n(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.pop()?;
        }
        Ok(())
    }

    fn local(&self, index: usize) -> Result<VType> {
        self.locals
            .get(index)
            .cloned()
            .with_context(|| format!("local {index} read before assignment"))
    }

    fn set_local(&mut self, index: usize, value: VType) {
        let needed = index + value.size();
        if self.locals.len() < needed {
            self.locals.resize(needed, VType::Top);
        }
        if index > 0 && self.locals[index - 1].is_wide() {
            self.locals[index - 1] = VType::Top;
        }
        let wide = value.is_wide();
        self.locals[index] = value;
        if wide {
            self.locals[index + 1] = VType::Top;
        }
    }

    fn stack_words(&self) -> usize {
        self.stack.iter().map(VType::size).sum()
    }

    fn replace(&mut self, from: &VType, to: &VType) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if slot == from {
                *slot = to.clone();
            }
        }
    }
}

/// Method-level facts the interpreter needs.
pub(crate) struct MethodContext<'a> {
    pub(crate) class_name: &'a str,
    pub(crate) descriptor: &'a str,
    pub(crate) is_static: bool,
    pub(crate) is_constructor: bool,
    pub(crate) hierarchy: &'a dyn TypeHierarchy,
}

/// Computed frames and limits for one method body.
#[derive(Debug)]
pub(crate) struct FrameAnalysis {
    /// Frames that must appear in the stack map table, by offset.
    pub(crate) frames: BTreeMap<u16, Frame>,
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
}

/// Effect of one instruction on control flow.
struct Step {
    out: Frame,
    targets: Vec<usize>,
    falls_through: bool,
}

/// Recompute the stack map table of `code`, seeding the method's initial
/// frame at offset zero and at every offset in `entries`. Unreachable code is
/// replaced by `nop ... athrow` and removed from exception ranges.
pub(crate) fn rebuild_stack_map(
    code: &mut CodeAttribute,
    pool: &mut ConstantPool,
    method: &MethodContext<'_>,
    entries: &[u16],
) -> Result<()> {
    let analysis = analyze(code, pool, method, entries)?;
    code.max_stack = code.max_stack.max(analysis.max_stack);
    code.max_locals = code.max_locals.max(analysis.max_locals);
    let mut kept = Vec::with_capacity(code.attributes.len());
    for attribute in std::mem::take(&mut code.attributes) {
        if pool.utf8(attribute.name_index)? != STACK_MAP_TABLE {
            kept.push(attribute);
        }
    }
    code.attributes = kept;
    if !analysis.frames.is_empty() {
        let info = encode_stack_map(&analysis.frames, pool)?;
        let name_index = pool.add_utf8(STACK_MAP_TABLE)?;
        code.attributes.push(Attribute { name_index, info });
    }
    Ok(())
}

/// Run the interpreter to a fixed point and collect the frames to emit.
pub(crate) fn analyze(
    code: &mut CodeAttribute,
    pool: &ConstantPool,
    method: &MethodContext<'_>,
    entries: &[u16],
) -> Result<FrameAnalysis> {
    let starts = instruction_starts(&code.code)?;
    let initial = Frame::initial(
        method.class_name,
        method.descriptor,
        method.is_static,
        method.is_constructor,
    )?;
    let interpreter = Interpreter {
        code: &code.code,
        pool,
        method,
    };

    let mut states: BTreeMap<usize, Frame> = BTreeMap::new();
    let mut required: BTreeSet<usize> = BTreeSet::new();
    let mut queue = VecDeque::new();
    let mut queued = BTreeSet::new();
    states.insert(0, initial.clone());
    queue.push_back(0usize);
    queued.insert(0usize);
    for entry in entries {
        let entry = *entry as usize;
        if !starts.contains(&entry) {
            anyhow::bail!("entry offset {entry} is not an instruction boundary");
        }
        required.insert(entry);
        if entry != 0 {
            states.insert(entry, initial.clone());
            if queued.insert(entry) {
                queue.push_back(entry);
            }
        }
    }

    let mut max_stack = 0usize;
    let mut max_locals = initial.locals.len();
    while let Some(offset) = queue.pop_front() {
        queued.remove(&offset);
        let state = states
            .get(&offset)
            .cloned()
            .with_context(|| format!("missing state at offset {offset}"))?;
        let step = interpreter
            .execute(offset, &state)
            .with_context(|| format!("interpret instruction at offset {offset}"))?;
        max_stack = max_stack.max(state.stack_words()).max(step.out.stack_words());
        max_locals = max_locals.max(step.out.locals.len());

        let length = instruction_length(&code.code, offset)?;
        let mut successors = Vec::new();
        if step.falls_through {
            let next = offset + length;
            if next >= code.code.len() {
                anyhow::bail!("execution falls off the end of the code at offset {offset}");
            }
            successors.push((next, step.out.clone()));
        } else if offset + length < code.code.len() {
            required.insert(offset + length);
        }
        for target in &step.targets {
            if !starts.contains(target) {
                anyhow::bail!("branch at offset {offset} targets {target}, not an instruction");
            }
            required.insert(*target);
            successors.push((*target, step.out.clone()));
        }
        for handler in &code.exception_table {
            let covers =
                (handler.start_pc as usize) <= offset && offset < (handler.end_pc as usize);
            if !covers {
                continue;
            }
            let catch_type = if handler.catch_type == 0 {
                THROWABLE.to_string()
            } else {
                pool.class_name(handler.catch_type)
                    .context("resolve catch type")?
            };
            let handler_pc = handler.handler_pc as usize;
            required.insert(handler_pc);
            successors.push((
                handler_pc,
                Frame {
                    locals: state.locals.clone(),
                    stack: vec![VType::Object(catch_type)],
                },
            ));
            max_stack = max_stack.max(1);
        }

        for (successor, incoming) in successors {
            let changed = match states.get(&successor) {
                None => {
                    states.insert(successor, incoming);
                    true
                }
                Some(existing) => {
                    let merged = merge_frames(existing, &incoming, method.hierarchy)
                        .with_context(|| format!("merge frames at offset {successor}"))?;
                    if &merged != existing {
                        states.insert(successor, merged);
                        true
                    } else {
                        false
                    }
                }
            };
            if changed && queued.insert(successor) {
                queue.push_back(successor);
            }
        }
    }

    let mut frames = BTreeMap::new();
    for offset in &required {
        if let Some(frame) = states.get(offset) {
            frames.insert(*offset as u16, frame.clone());
        }
    }

    let dead = dead_ranges(&starts, &states, code.code.len());
    for (start, end) in &dead {
        for byte in &mut code.code[*start..*end - 1] {
            *byte = 0x00;
        }
        code.code[*end - 1] = opcodes::ATHROW;
        frames.insert(
            *start as u16,
            Frame {
                locals: Vec::new(),
                stack: vec![VType::Object(THROWABLE.to_string())],
            },
        );
        max_stack = max_stack.max(1);
    }
    if !dead.is_empty() {
        code.exception_table = trim_handlers(&code.exception_table, &dead);
    }

    Ok(FrameAnalysis {
        frames,
        max_stack: u16::try_from(max_stack).context("max stack exceeds 65535")?,
        max_locals: u16::try_from(max_locals).context("max locals exceeds 65535")?,
    })
}

fn instruction_starts(code: &[u8]) -> Result<BTreeSet<usize>> {
    let mut starts = BTreeSet::new();
    let mut offset = 0usize;
    while offset < code.len() {
        starts.insert(offset);
        offset += instruction_length(code, offset)?;
    }
    Ok(starts)
}

/// Maximal runs of instructions the interpreter never reached.
fn dead_ranges(
    starts: &BTreeSet<usize>,
    states: &BTreeMap<usize, Frame>,
    code_len: usize,
) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut current: Option<usize> = None;
    for start in starts {
        let reached = states.contains_key(start);
        match (reached, current) {
            (false, None) => current = Some(*start),
            (true, Some(begin)) => {
                ranges.push((begin, *start));
                current = None;
            }
            _ => {}
        }
    }
    if let Some(begin) = current {
        ranges.push((begin, code_len));
    }
    ranges
}

fn trim_handlers(table: &[ExceptionEntry], dead: &[(usize, usize)]) -> Vec<ExceptionEntry> {
    let mut trimmed = Vec::new();
    for entry in table {
        let mut pieces = vec![(entry.start_pc as usize, entry.end_pc as usize)];
        for (dead_start, dead_end) in dead {
            let mut next = Vec::new();
            for (start, end) in pieces {
                if *dead_end <= start || end <= *dead_start {
                    next.push((start, end));
                    continue;
                }
                if start < *dead_start {
                    next.push((start, *dead_start));
                }
                if *dead_end < end {
                    next.push((*dead_end, end));
                }
            }
            pieces = next;
        }
        for (start, end) in pieces {
            trimmed.push(ExceptionEntry {
                start_pc: start as u16,
                end_pc: end as u16,
                handler_pc: entry.handler_pc,
                catch_type: entry.catch_type,
            });
        }
    }
    trimmed
}

fn merge_frames(
    existing: &Frame,
    incoming: &Frame,
    hierarchy: &dyn TypeHierarchy,
) -> Result<Frame> {
    if existing.stack.len() != incoming.stack.len() {
        anyhow::bail!(
            "inconsistent stack heights {} and {}",
            existing.stack.len(),
            incoming.stack.len()
        );
    }
    let mut stack = Vec::with_capacity(existing.stack.len());
    for (left, right) in existing.stack.iter().zip(&incoming.stack) {
        let merged = merge_types(left, right, hierarchy);
        if merged == VType::Top {
            anyhow::bail!("incompatible stack values {left:?} and {right:?}");
        }
        stack.push(merged);
    }
    let length = existing.locals.len().min(incoming.locals.len());
    let mut locals = Vec::with_capacity(length);
    for index in 0..length {
        locals.push(merge_types(
            &existing.locals[index],
            &incoming.locals[index],
            hierarchy,
        ));
    }
    // A wide value whose second half did not survive is unusable.
    for index in 0..locals.len() {
        if locals[index].is_wide() && locals.get(index + 1) != Some(&VType::Top) {
            locals[index] = VType::Top;
        }
    }
    Ok(Frame { locals, stack })
}

fn merge_types(left: &VType, right: &VType, hierarchy: &dyn TypeHierarchy) -> VType {
    if left == right {
        return left.clone();
    }
    match (left, right) {
        (VType::Null, other) | (other, VType::Null) if other.is_reference() => other.clone(),
        (VType::Object(first), VType::Object(second)) => {
            VType::Object(merge_references(first, second, hierarchy))
        }
        _ => VType::Top,
    }
}

fn merge_references(first: &str, second: &str, hierarchy: &dyn TypeHierarchy) -> String {
    let first_array = first.starts_with('[');
    let second_array = second.starts_with('[');
    if !first_array && !second_array {
        return hierarchy.common_super_class(first, second);
    }
    if first_array != second_array {
        return ROOT_CLASS.to_string();
    }
    let (Ok(first_type), Ok(second_type)) = (parse_field(first), parse_field(second)) else {
        return ROOT_CLASS.to_string();
    };
    let (first_element, first_dims) = element_and_dims(&first_type);
    let (second_element, second_dims) = element_and_dims(&second_type);
    if first_dims == second_dims {
        if let (TypeDescriptor::Object(a), TypeDescriptor::Object(b)) =
            (first_element, second_element)
        {
            let element = hierarchy.common_super_class(a.as_str(), b.as_str());
            return format!("{}L{element};", "[".repeat(first_dims));
        }
    }
    let mut dims = first_dims.min(second_dims);
    let shallow = if first_dims <= second_dims {
        first_element
    } else {
        second_element
    };
    if !matches!(shallow, TypeDescriptor::Object(_)) {
        dims -= 1;
    }
    if dims == 0 {
        ROOT_CLASS.to_string()
    } else {
        format!("{}L{ROOT_CLASS};", "[".repeat(dims))
    }
}

struct Interpreter<'a> {
    code: &'a [u8],
    pool: &'a ConstantPool,
    method: &'a MethodContext<'a>,
}

impl Interpreter<'_> {
    fn execute(&self, offset: usize, state: &Frame) -> Result<Step> {
        let code = self.code;
        let opcode = code[offset];
        let mut frame = state.clone();
        let mut targets = Vec::new();
        let mut falls_through = true;
        match opcode {
            0x00 => {}
            opcodes::ACONST_NULL => frame.push(VType::Null),
            0x02..=0x08 | opcodes::BIPUSH | opcodes::SIPUSH => frame.push(VType::Integer),
            0x09 | 0x0a => frame.push(VType::Long),
            0x0b..=0x0d => frame.push(VType::Float),
            0x0e | 0x0f => frame.push(VType::Double),
            opcodes::LDC => {
                let index = code[offset + 1] as u16;
                frame.push(self.constant_type(index)?);
            }
            opcodes::LDC_W | opcodes::LDC2_W => {
                let index = read_u16(code, offset + 1)?;
                frame.push(self.constant_type(index)?);
            }
            opcodes::ILOAD..=opcodes::ALOAD => {
                let index = code[offset + 1] as usize;
                self.load(&mut frame, opcode - opcodes::ILOAD, index)?;
            }
            0x1a..=0x2d => {
                let relative = opcode - 0x1a;
                self.load(&mut frame, relative / 4, (relative % 4) as usize)?;
            }
            opcodes::IALOAD | opcodes::BALOAD | opcodes::CALOAD | opcodes::SALOAD => {
                frame.pop_n(2)?;
                frame.push(VType::Integer);
            }
            opcodes::LALOAD => {
                frame.pop_n(2)?;
                frame.push(VType::Long);
            }
            opcodes::FALOAD => {
                frame.pop_n(2)?;
                frame.push(VType::Float);
            }
            opcodes::DALOAD => {
                frame.pop_n(2)?;
                frame.push(VType::Double);
            }
            opcodes::AALOAD => {
                frame.pop()?;
                let array = frame.pop()?;
                frame.push(component_type(&array));
            }
            opcodes::ISTORE..=opcodes::ASTORE => {
                let index = code[offset + 1] as usize;
                let value = frame.pop()?;
                frame.set_local(index, value);
            }
            0x3b..=0x4e => {
                let index = ((opcode - 0x3b) % 4) as usize;
                let value = frame.pop()?;
                frame.set_local(index, value);
            }
            opcodes::IASTORE..=opcodes::SASTORE => frame.pop_n(3)?,
            opcodes::POP => {
                frame.pop()?;
            }
            opcodes::POP2 => {
                let top = frame.pop()?;
                if !top.is_wide() {
                    frame.pop()?;
                }
            }
            opcodes::DUP..=opcodes::SWAP => stack_shuffle(&mut frame, opcode)?,
            0x60..=0x73 => {
                frame.pop_n(2)?;
                frame.push(arithmetic_type(opcode - 0x60));
            }
            0x74..=0x77 => {
                frame.pop()?;
                frame.push(arithmetic_type(opcode - 0x74));
            }
            0x78..=0x7d => {
                frame.pop()?;
                let value = frame.pop()?;
                frame.push(value);
            }
            0x7e..=0x83 => {
                frame.pop_n(2)?;
                frame.push(if opcode % 2 == 0 {
                    VType::Integer
                } else {
                    VType::Long
                });
            }
            opcodes::IINC => {}
            0x85..=0x93 => {
                frame.pop()?;
                frame.push(conversion_type(opcode));
            }
            0x94..=0x98 => {
                frame.pop_n(2)?;
                frame.push(VType::Integer);
            }
            0x99..=0x9e | opcodes::IFNULL | opcodes::IFNONNULL => {
                frame.pop()?;
                targets.push(branch_target(offset, read_i16(code, offset + 1)? as i32)?);
            }
            0x9f..=opcodes::IF_ACMPNE => {
                frame.pop_n(2)?;
                targets.push(branch_target(offset, read_i16(code, offset + 1)? as i32)?);
            }
            opcodes::GOTO => {
                targets.push(branch_target(offset, read_i16(code, offset + 1)? as i32)?);
                falls_through = false;
            }
            opcodes::GOTO_W => {
                targets.push(branch_target(offset, read_i32(code, offset + 1)?)?);
                falls_through = false;
            }
            opcodes::JSR | opcodes::RET | opcodes::JSR_W => {
                anyhow::bail!("subroutines are not supported in stack map computation");
            }
            opcodes::TABLESWITCH => {
                frame.pop()?;
                let base = offset + 1 + padding(offset);
                targets.push(branch_target(offset, read_i32(code, base)?)?);
                let low = read_i32(code, base + 4)?;
                let high = read_i32(code, base + 8)?;
                let count = (high as i64 - low as i64 + 1).max(0) as usize;
                for index in 0..count {
                    let jump = read_i32(code, base + 12 + index * 4)?;
                    targets.push(branch_target(offset, jump)?);
                }
                falls_through = false;
            }
            opcodes::LOOKUPSWITCH => {
                frame.pop()?;
                let base = offset + 1 + padding(offset);
                targets.push(branch_target(offset, read_i32(code, base)?)?);
                let pairs = read_i32(code, base + 4)?.max(0) as usize;
                for index in 0..pairs {
                    let jump = read_i32(code, base + 12 + index * 8)?;
                    targets.push(branch_target(offset, jump)?);
                }
                falls_through = false;
            }
            opcodes::IRETURN..=0xb0 => {
                frame.pop()?;
                falls_through = false;
            }
            opcodes::RETURN => falls_through = false,
            opcodes::GETSTATIC | opcodes::GETFIELD => {
                let field = self.pool.member_ref(read_u16(code, offset + 1)?)?;
                if opcode == opcodes::GETFIELD {
                    frame.pop()?;
                }
                let field_type = parse_field(&field.descriptor)?;
                frame.push(VType::from_descriptor(&field_type).context("void field type")?);
            }
            opcodes::PUTSTATIC => {
                frame.pop()?;
            }
            opcodes::PUTFIELD => frame.pop_n(2)?,
            opcodes::INVOKEVIRTUAL
            | opcodes::INVOKESPECIAL
            | opcodes::INVOKESTATIC
            | opcodes::INVOKEINTERFACE => {
                let callee = self.pool.member_ref(read_u16(code, offset + 1)?)?;
                let parsed = parse_method(&callee.descriptor)?;
                frame.pop_n(parsed.parameter_types().len())?;
                if opcode != opcodes::INVOKESTATIC {
                    let receiver = frame.pop()?;
                    if opcode == opcodes::INVOKESPECIAL && callee.name == "<init>" {
                        let initialized = self.initialized_type(&receiver)?;
                        frame.replace(&receiver, &VType::Object(initialized));
                    }
                }
                if let Some(ret) = VType::from_descriptor(parsed.return_type()) {
                    frame.push(ret);
                }
            }
            opcodes::INVOKEDYNAMIC => {
                let index = read_u16(code, offset + 1)?;
                let descriptor = match self.pool.get(index)? {
                    Constant::InvokeDynamic(_, name_and_type) => {
                        self.pool.name_and_type(*name_and_type)?.1
                    }
                    _ => anyhow::bail!("invokedynamic does not reference a call site"),
                };
                let parsed = parse_method(&descriptor)?;
                frame.pop_n(parsed.parameter_types().len())?;
                if let Some(ret) = VType::from_descriptor(parsed.return_type()) {
                    frame.push(ret);
                }
            }
            opcodes::NEW => frame.push(VType::Uninitialized(offset as u16)),
            opcodes::NEWARRAY => {
                frame.pop()?;
                let element = match code[offset + 1] {
                    4 => "Z",
                    5 => "C",
                    6 => "F",
                    7 => "D",
                    8 => "B",
                    9 => "S",
                    10 => "I",
                    11 => "J",
                    other => anyhow::bail!("invalid newarray type {other}"),
                };
                frame.push(VType::Object(format!("[{element}")));
            }
            opcodes::ANEWARRAY => {
                frame.pop()?;
                let element = self.pool.class_name(read_u16(code, offset + 1)?)?;
                let array = if element.starts_with('[') {
                    format!("[{element}")
                } else {
                    format!("[L{element};")
                };
                frame.push(VType::Object(array));
            }
            opcodes::ARRAYLENGTH => {
                frame.pop()?;
                frame.push(VType::Integer);
            }
            opcodes::ATHROW => {
                frame.pop()?;
                falls_through = false;
            }
            opcodes::CHECKCAST => {
                frame.pop()?;
                let class_name = self.pool.class_name(read_u16(code, offset + 1)?)?;
                frame.push(VType::Object(class_name));
            }
            opcodes::INSTANCEOF => {
                frame.pop()?;
                frame.push(VType::Integer);
            }
            opcodes::MONITORENTER | opcodes::MONITOREXIT => {
                frame.pop()?;
            }
            opcodes::WIDE => {
                let inner = code[offset + 1];
                let index = read_u16(code, offset + 2)? as usize;
                match inner {
                    opcodes::ILOAD..=opcodes::ALOAD => {
                        self.load(&mut frame, inner - opcodes::ILOAD, index)?;
                    }
                    opcodes::ISTORE..=opcodes::ASTORE => {
                        let value = frame.pop()?;
                        frame.set_local(index, value);
                    }
                    opcodes::IINC => {}
                    opcodes::RET => {
                        anyhow::bail!("subroutines are not supported in stack map computation")
                    }
                    other => anyhow::bail!("invalid wide opcode 0x{other:02x}"),
                }
            }
            opcodes::MULTIANEWARRAY => {
                let class_name = self.pool.class_name(read_u16(code, offset + 1)?)?;
                frame.pop_n(code[offset + 3] as usize)?;
                frame.push(VType::Object(class_name));
            }
            other => anyhow::bail!("unsupported opcode 0x{other:02x}"),
        }
        Ok(Step {
            out: frame,
            targets,
            falls_through,
        })
    }

    /// Push the local at `index`; `kind` is 0..=4 for i, l, f, d, a loads.
    fn load(&self, frame: &mut Frame, kind: u8, index: usize) -> Result<()> {
        let value = match kind {
            0 => VType::Integer,
            1 => VType::Long,
            2 => VType::Float,
            3 => VType::Double,
            _ => frame.local(index)?,
        };
        frame.push(value);
        Ok(())
    }

    fn constant_type(&self, index: u16) -> Result<VType> {
        let value = match self.pool.get(index)? {
            Constant::Integer(_) => VType::Integer,
            Constant::Float(_) => VType::Float,
            Constant::Long(_) => VType::Long,
            Constant::Double(_) => VType::Double,
            Constant::String(_) => VType::Object("java/lang/String".to_string()),
            Constant::Class(_) => VType::Object("java/lang/Class".to_string()),
            Constant::MethodType(_) => VType::Object("java/lang/invoke/MethodType".to_string()),
            Constant::MethodHandle(_, _) => {
                VType::Object("java/lang/invoke/MethodHandle".to_string())
            }
            Constant::Dynamic(_, name_and_type) => {
                let (_, descriptor) = self.pool.name_and_type(*name_and_type)?;
                let field_type = parse_field(&descriptor)?;
                VType::from_descriptor(&field_type).context("void constant type")?
            }
            other => anyhow::bail!("constant {other:?} cannot be loaded"),
        };
        Ok(value)
    }

    fn initialized_type(&self, receiver: &VType) -> Result<String> {
        match receiver {
            VType::UninitializedThis => Ok(self.method.class_name.to_string()),
            VType::Uninitialized(new_offset) => {
                let at = *new_offset as usize;
                if self.code.get(at) != Some(&opcodes::NEW) {
                    anyhow::bail!("uninitialized value does not come from new at {at}");
                }
                self.pool.class_name(read_u16(self.code, at + 1)?)
            }
            other => anyhow::bail!("constructor called on initialized value {other:?}"),
        }
    }
}

fn branch_target(offset: usize, jump: i32) -> Result<usize> {
    let target = offset as i64 + jump as i64;
    usize::try_from(target).context("branch target before start of code")
}

fn component_type(array: &VType) -> VType {
    match array {
        VType::Object(name) if name.starts_with('[') => parse_field(&name[1..])
            .ok()
            .and_then(|field_type| VType::from_descriptor(&field_type))
            .unwrap_or_else(|| VType::Object(ROOT_CLASS.to_string())),
        VType::Null => VType::Null,
        _ => VType::Object(ROOT_CLASS.to_string()),
    }
}

/// Type produced by the binary and unary arithmetic families (i, l, f, d order).
fn arithmetic_type(relative: u8) -> VType {
    match relative % 4 {
        0 => VType::Integer,
        1 => VType::Long,
        2 => VType::Float,
        _ => VType::Double,
    }
}

fn conversion_type(opcode: u8) -> VType {
    match opcode {
        0x85 | 0x8c | 0x8f => VType::Long,
        0x86 | 0x89 | 0x90 => VType::Float,
        0x87 | 0x8a | 0x8d => VType::Double,
        _ => VType::Integer,
    }
}

fn stack_shuffle(frame: &mut Frame, opcode: u8) -> Result<()> {
    match opcode {
        opcodes::DUP => {
            let v1 = frame.pop()?;
            frame.push(v1.clone());
            frame.push(v1);
        }
        opcodes::DUP_X1 => {
            let v1 = frame.pop()?;
            let v2 = frame.pop()?;
            frame.push(v1.clone());
            frame.push(v2);
            frame.push(v1);
        }
        opcodes::DUP_X2 => {
            let v1 = frame.pop()?;
            let v2 = frame.pop()?;
            if v2.is_wide() {
                frame.push(v1.clone());
                frame.push(v2);
                frame.push(v1);
            } else {
                let v3 = frame.pop()?;
                frame.push(v1.clone());
                frame.push(v3);
                frame.push(v2);
                frame.push(v1);
            }
        }
        opcodes::DUP2 => {
            let v1 = frame.pop()?;
            if v1.is_wide() {
                frame.push(v1.clone());
                frame.push(v1);
            } else {
                let v2 = frame.pop()?;
                frame.push(v2.clone());
                frame.push(v1.clone());
                frame.push(v2);
                frame.push(v1);
            }
        }
        opcodes::DUP2_X1 => {
            let v1 = frame.pop()?;
            if v1.is_wide() {
                let v2 = frame.pop()?;
                frame.push(v1.clone());
                frame.push(v2);
                frame.push(v1);
            } else {
                let v2 = frame.pop()?;
                let v3 = frame.pop()?;
                frame.push(v2.clone());
                frame.push(v1.clone());
                frame.push(v3);
                frame.push(v2);
                frame.push(v1);
            }
        }
        opcodes::DUP2_X2 => {
            let v1 = frame.pop()?;
            if v1.is_wide() {
                let v2 = frame.pop()?;
                if v2.is_wide() {
                    frame.push(v1.clone());
                    frame.push(v2);
                    frame.push(v1);
                } else {
                    let v3 = frame.pop()?;
                    frame.push(v1.clone());
                    frame.push(v3);
                    frame.push(v2);
                    frame.push(v1);
                }
            } else {
                let v2 = frame.pop()?;
                let v3 = frame.pop()?;
                if v3.is_wide() {
                    frame.push(v2.clone());
                    frame.push(v1.clone());
                    frame.push(v3);
                    frame.push(v2);
                    frame.push(v1);
                } else {
                    let v4 = frame.pop()?;
                    frame.push(v2.clone());
                    frame.push(v1.clone());
                    frame.push(v4);
                    frame.push(v3);
                    frame.push(v2);
                    frame.push(v1);
                }
            }
        }
        _ => {
            let v1 = frame.pop()?;
            let v2 = frame.pop()?;
            frame.push(v1);
            frame.push(v2);
        }
    }
    Ok(())
}

/// Encode frames as a `StackMapTable` payload of full frames.
pub(crate) fn encode_stack_map(
    frames: &BTreeMap<u16, Frame>,
    pool: &mut ConstantPool,
) -> Result<Vec<u8>> {
    let mut info = Vec::new();
    write_u16(&mut info, frames.len() as u16);
    let mut previous: Option<u16> = None;
    for (offset, frame) in frames {
        let delta = match previous {
            None => *offset,
            Some(previous) => offset - previous - 1,
        };
        previous = Some(*offset);
        info.push(255);
        write_u16(&mut info, delta);

        let mut locals = Vec::new();
        let mut index = 0;
        while index < frame.locals.len() {
            let value = &frame.locals[index];
            locals.push(value);
            index += value.size();
        }
        while locals.last() == Some(&&VType::Top) {
            locals.pop();
        }
        write_u16(&mut info, locals.len() as u16);
        for value in locals {
            write_verification_type(&mut info, value, pool)?;
        }
        write_u16(&mut info, frame.stack.len() as u16);
        for value in &frame.stack {
            write_verification_type(&mut info, value, pool)?;
        }
    }
    Ok(info)
}

fn write_verification_type(
    info: &mut Vec<u8>,
    value: &VType,
    pool: &mut ConstantPool,
) -> Result<()> {
    match value {
        VType::Top => info.push(0),
        VType::Integer => info.push(1),
        VType::Float => info.push(2),
        VType::Double => info.push(3),
        VType::Long => info.push(4),
        VType::Null => info.push(5),
        VType::UninitializedThis => info.push(6),
        VType::Object(name) => {
            info.push(7);
            write_u16(info, pool.add_class(name)?);
        }
        VType::Uninitialized(offset) => {
            info.push(8);
            write_u16(info, *offset);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{SymbolTable, TypeInfo};

    fn table() -> SymbolTable {
        let mut table = SymbolTable::new();
        for (name, super_name) in [
            ("a/Base", ROOT_CLASS),
            ("a/Left", "a/Base"),
            ("a/Right", "a/Base"),
        ] {
            table.insert(
                name,
                TypeInfo {
                    super_name: Some(super_name.to_string()),
                    interfaces: Vec::new(),
                    is_interface: false,
                },
            );
        }
        table
    }

    fn code(bytes: Vec<u8>) -> CodeAttribute {
        CodeAttribute {
            max_stack: 0,
            max_locals: 0,
            code: bytes,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        }
    }

    #[test]
    fn initial_frame_covers_receiver_and_wide_parameters() {
        let frame = Frame::initial("a/Base", "(JLjava/lang/String;[I)V", false, false)
            .expect("initial frame");
        assert_eq!(
            frame.locals,
            vec![
                VType::Object("a/Base".to_string()),
                VType::Long,
                VType::Top,
                VType::Object("java/lang/String".to_string()),
                VType::Object("[I".to_string()),
            ]
        );
        let constructor = Frame::initial("a/Base", "()V", false, true).expect("ctor frame");
        assert_eq!(constructor.locals, vec![VType::UninitializedThis]);
    }

    #[test]
    fn joins_merge_through_the_hierarchy() {
        let mut pool = ConstantPool::new();
        let left = pool.add_class("a/Left").expect("left");
        let right = pool.add_class("a/Right").expect("right");
        let [left_hi, left_lo] = left.to_be_bytes();
        let [right_hi, right_lo] = right.to_be_bytes();
        // static Object pick(int flag, Object a, Object b)
        let body = vec![
            0x1a, // 0: iload_0
            0x99, 0x00, 0x0a, // 1: ifeq 11
            0x2b, // 4: aload_1
            opcodes::CHECKCAST, left_hi, left_lo, // 5: checkcast Left
            opcodes::GOTO, 0x00, 0x07, // 8: goto 15
            0x2c, // 11: aload_2
            opcodes::CHECKCAST, right_hi, right_lo, // 12: checkcast Right
            0xb0, // 15: areturn
        ];
        let table = table();
        let method = MethodContext {
            class_name: "a/Picker",
            descriptor: "(ILjava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
            is_static: true,
            is_constructor: false,
            hierarchy: &table,
        };
        let mut attribute = code(body);

        let analysis = analyze(&mut attribute, &pool, &method, &[]).expect("analyze");

        assert_eq!(
            analysis.frames.keys().copied().collect::<Vec<_>>(),
            vec![11, 15]
        );
        assert_eq!(
            analysis.frames[&15].stack,
            vec![VType::Object("a/Base".to_string())]
        );
        assert_eq!(analysis.max_stack, 1);
        assert_eq!(analysis.max_locals, 3);
        assert!(table.fallbacks().is_empty());
    }

    #[test]
    fn unknown_types_merge_to_root() {
        let mut pool = ConstantPool::new();
        let lib = pool.add_class("lib/External").expect("lib");
        let [hi, lo] = lib.to_be_bytes();
        let body = vec![
            0x1a, // 0: iload_0
            0x99, 0x00, 0x0a, // 1: ifeq 11
            0x2b, // 4: aload_1
            opcodes::CHECKCAST, hi, lo, // 5: checkcast External
            opcodes::GOTO, 0x00, 0x04, // 8: goto 12
            0x2b, // 11: aload_1
            0xb0, // 12: areturn
        ];
        let table = table();
        let method = MethodContext {
            class_name: "a/Picker",
            descriptor: "(ILa/Base;)Ljava/lang/Object;",
            is_static: true,
            is_constructor: false,
            hierarchy: &table,
        };
        let mut attribute = code(body);

        let analysis = analyze(&mut attribute, &pool, &method, &[]).expect("analyze");

        assert_eq!(
            analysis.frames[&12].stack,
            vec![VType::Object(ROOT_CLASS.to_string())]
        );
        assert_eq!(table.fallbacks().len(), 1);
    }

    #[test]
    fn seeded_entry_after_throw_gets_a_frame() {
        let mut pool = ConstantPool::new();
        let error = pool.add_class("java/lang/AssertionError").expect("class");
        let init = pool
            .add_method_ref("java/lang/AssertionError", "<init>", "()V")
            .expect("init");
        let [error_hi, error_lo] = error.to_be_bytes();
        let [init_hi, init_lo] = init.to_be_bytes();
        let body = vec![
            opcodes::NEW, error_hi, error_lo, // 0
            opcodes::DUP, // 3
            opcodes::INVOKESPECIAL, init_hi, init_lo, // 4
            opcodes::ATHROW, // 7
            0x1a, // 8: iload_0
            0xac, // 9: ireturn
        ];
        let table = table();
        let method = MethodContext {
            class_name: "a/Calc",
            descriptor: "(I)I",
            is_static: true,
            is_constructor: false,
            hierarchy: &table,
        };
        let mut attribute = code(body);

        rebuild_stack_map(&mut attribute, &mut pool, &method, &[8]).expect("rebuild");

        assert_eq!(attribute.max_stack, 2);
        assert_eq!(attribute.max_locals, 1);
        let frames = attribute
            .attributes
            .iter()
            .find(|attribute| pool.utf8(attribute.name_index).expect("name") == STACK_MAP_TABLE)
            .expect("stack map table");
        // one full frame at delta 8 with a single int local and empty stack
        assert_eq!(frames.info, vec![0, 1, 255, 0, 8, 0, 1, 1, 0, 0]);
    }

    #[test]
    fn unreachable_code_becomes_throw() {
        let pool = ConstantPool::new();
        let body = vec![
            0x00, // 0: nop
            0xb1, // 1: return
            0x04, // 2: iconst_1 (dead)
            0x57, // 3: pop (dead)
            0xb1, // 4: return (dead)
            0x4b, // 5: astore_0 (handler)
            0xb1, // 6: return
        ];
        let table = table();
        let method = MethodContext {
            class_name: "a/Calc",
            descriptor: "()V",
            is_static: true,
            is_constructor: false,
            hierarchy: &table,
        };
        let mut attribute = code(body);
        attribute.exception_table.push(ExceptionEntry {
            start_pc: 0,
            end_pc: 5,
            handler_pc: 5,
            catch_type: 0,
        });

        let analysis = analyze(&mut attribute, &pool, &method, &[]).expect("analyze");

        assert_eq!(
            attribute.code,
            vec![0x00, 0xb1, 0x00, 0x00, opcodes::ATHROW, 0x4b, 0xb1]
        );
        assert_eq!(
            analysis.frames[&2].stack,
            vec![VType::Object(THROWABLE.to_string())]
        );
        assert!(analysis.frames[&2].locals.is_empty());
        assert_eq!(
            attribute.exception_table,
            vec![ExceptionEntry {
                start_pc: 0,
                end_pc: 2,
                handler_pc: 5,
                catch_type: 0,
            }]
        );
    }

    #[test]
    fn constructor_call_initializes_new_value() {
        let mut pool = ConstantPool::new();
        let base = pool.add_class("a/Base").expect("class");
        let init = pool.add_method_ref("a/Base", "<init>", "()V").expect("init");
        let [base_hi, base_lo] = base.to_be_bytes();
        let [init_hi, init_lo] = init.to_be_bytes();
        let body = vec![
            opcodes::NEW, base_hi, base_lo, // 0
            opcodes::DUP, // 3
            opcodes::INVOKESPECIAL, init_hi, init_lo, // 4
            0x4b, // 7: astore_0
            0x2a, // 8: aload_0
            0xb0, // 9: areturn
        ];
        let table = table();
        let method = MethodContext {
            class_name: "a/Factory",
            descriptor: "()La/Base;",
            is_static: true,
            is_constructor: false,
            hierarchy: &table,
        };
        let mut attribute = code(body);
        let analysis = analyze(&mut attribute, &pool, &method, &[]).expect("analyze");
        assert!(analysis.frames.is_empty());
        assert_eq!(analysis.max_stack, 2);
        assert_eq!(analysis.max_locals, 1);
    }

    #[test]
    fn handlers_receive_locals_and_exception() {
        let mut pool = ConstantPool::new();
        let io = pool.add_class("java/io/IOException").expect("class");
        let body = vec![
            0x03, // 0: iconst_0
            0x3b, // 1: istore_0
            0xb1, // 2: return
            0x4c, // 3: astore_1 (handler)
            0xb1, // 4: return
        ];
        let table = table();
        let method = MethodContext {
            class_name: "a/Calc",
            descriptor: "()V",
            is_static: true,
            is_constructor: false,
            hierarchy: &table,
        };
        let mut attribute = code(body);
        attribute.exception_table.push(ExceptionEntry {
            start_pc: 0,
            end_pc: 3,
            handler_pc: 3,
            catch_type: io,
        });
        let analysis = analyze(&mut attribute, &pool, &method, &[]).expect("analyze");
        let handler = &analysis.frames[&3];
        assert!(handler.locals.is_empty());
        assert_eq!(
            handler.stack,
            vec![VType::Object("java/io/IOException".to_string())]
        );
        assert_eq!(analysis.max_locals, 2);
    }

    #[test]
    fn object_arrays_merge_elementwise() {
        let table = table();
        assert_eq!(
            merge_references("[La/Left;", "[La/Right;", &table),
            "[La/Base;"
        );
        assert_eq!(merge_references("[I", "[La/Left;", &table), ROOT_CLASS);
        assert_eq!(
            merge_references("[[I", "[La/Left;", &table),
            "[Ljava/lang/Object;"
        );
    }
}
