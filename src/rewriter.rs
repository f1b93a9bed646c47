//! Class-level rewrites: disable markers and failure injection.
//!
//! Every operation parses the class bytes, edits the parsed model and
//! serializes a new class file. Nothing outside the touched attributes and the
//! constant entries they need is changed.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::classfile::annotations::{add_marker, has_annotation, remove_annotations};
use crate::classfile::code::{CODE, CodeAttribute};
use crate::classfile::{ClassFile, STACK_MAP_MAJOR_VERSION};
use crate::descriptor::argument_slots;
use crate::error::RunError;
use crate::frames::{MethodContext, rebuild_stack_map};
use crate::hierarchy::TypeHierarchy;
use crate::ir::{Framework, MethodRef, TestCase, is_initializer_name};
use crate::opcodes;

const ASSERTION_ERROR: &str = "java/lang/AssertionError";

/// Bytes prepended by [`inject_unconditional_failure`]. A multiple of four,
/// so switch padding in the original body stays valid.
pub(crate) const PROLOGUE_LEN: u16 = 8;

fn test_descriptors() -> [&'static str; 2] {
    Framework::ALL.map(Framework::test_descriptor)
}

/// Which declared methods get disabled.
pub(crate) enum MethodSelection<'a> {
    /// Methods matching one of these tests; matched tests are removed.
    Targets(&'a mut Vec<TestCase>),
    /// Every method, with the markers of one framework.
    All(Framework),
}

/// Rewritten class plus how many of its methods still carry a test marker.
#[derive(Debug)]
pub(crate) struct MethodRewrite {
    pub(crate) bytes: Vec<u8>,
    pub(crate) remaining_tests: usize,
}

/// Add the class-level disable marker and drop class-level test markers.
pub(crate) fn add_marker_annotation(bytes: &[u8], framework: Framework) -> Result<Vec<u8>> {
    let mut class_file = ClassFile::parse(bytes).context("parse class for class marker")?;
    let name = class_file.name()?;
    let added = add_marker(
        &mut class_file.pool,
        &mut class_file.attributes,
        framework.disable_descriptor(),
    )?;
    remove_annotations(&class_file.pool, &mut class_file.attributes, &test_descriptors())?;
    debug!(class = %name, added, marker = framework.disable_descriptor(), "class marker");
    Ok(class_file.to_bytes())
}

/// Disable the selected methods: add the framework's disable marker and remove
/// every test marker. Constructors and static initializers are never touched.
pub(crate) fn add_ignore_annotation_to_methods(
    bytes: &[u8],
    mut selection: MethodSelection<'_>,
) -> Result<MethodRewrite> {
    let mut class_file = ClassFile::parse(bytes).context("parse class for method markers")?;
    let class_name = class_file.name()?;
    let test_markers = test_descriptors();
    let mut remaining_tests = 0usize;
    for index in 0..class_file.methods.len() {
        let name = class_file.member_name(&class_file.methods[index])?;
        let descriptor = class_file.member_descriptor(&class_file.methods[index])?;
        let framework = if is_initializer_name(&name) {
            None
        } else {
            match &mut selection {
                MethodSelection::All(framework) => Some(*framework),
                MethodSelection::Targets(targets) => take_matching(targets, &name, &descriptor),
            }
        };
        let method = &mut class_file.methods[index];
        if let Some(framework) = framework {
            add_marker(
                &mut class_file.pool,
                &mut method.attributes,
                framework.disable_descriptor(),
            )?;
            remove_annotations(&class_file.pool, &mut method.attributes, &test_markers)?;
            debug!(class = %class_name, method = %name, %descriptor, "disabled method");
        }
        for marker in test_markers {
            if has_annotation(&class_file.pool, &method.attributes, marker)? {
                remaining_tests += 1;
                break;
            }
        }
    }
    Ok(MethodRewrite {
        bytes: class_file.to_bytes(),
        remaining_tests,
    })
}

/// Remove every target matching the declared method; returns the framework of
/// the first one.
fn take_matching(targets: &mut Vec<TestCase>, name: &str, descriptor: &str) -> Option<Framework> {
    let framework = targets
        .iter()
        .find(|test| test.method.matches(name, descriptor))
        .map(|test| test.framework)?;
    targets.retain(|test| !test.method.matches(name, descriptor));
    Some(framework)
}

/// Make `target` throw `AssertionError` on entry. The original instructions
/// remain after the throw, and the stack map table is recomputed through
/// `hierarchy` for class versions that require one.
pub(crate) fn inject_unconditional_failure(
    bytes: &[u8],
    target: &MethodRef,
    hierarchy: &dyn TypeHierarchy,
) -> Result<Vec<u8>> {
    let mut class_file = ClassFile::parse(bytes).context("parse class for injection")?;
    let class_name = class_file.name()?;
    let method_index = find_target(&class_file, target)?;
    let descriptor = class_file.member_descriptor(&class_file.methods[method_index])?;
    let method_name = class_file.member_name(&class_file.methods[method_index])?;
    let is_static = class_file.methods[method_index].is_static();

    let mut code_position = None;
    for (position, attribute) in class_file.methods[method_index].attributes.iter().enumerate() {
        if class_file.attribute_name(attribute)? == CODE {
            code_position = Some(position);
            break;
        }
    }
    let Some(code_position) = code_position else {
        return Err(RunError::MethodNotResolvable(format!("{target} has no body")).into());
    };
    let mut code = CodeAttribute::parse(
        &class_file.methods[method_index].attributes[code_position].info,
    )
    .context("parse target code")?;
    let original_max_stack = code.max_stack;
    let original_max_locals = code.max_locals;

    let error_class = class_file.pool.add_class(ASSERTION_ERROR)?;
    let error_init = class_file
        .pool
        .add_method_ref(ASSERTION_ERROR, "<init>", "()V")?;
    let [class_hi, class_lo] = error_class.to_be_bytes();
    let [init_hi, init_lo] = error_init.to_be_bytes();
    let mut body = vec![
        opcodes::NEW,
        class_hi,
        class_lo,
        opcodes::DUP,
        opcodes::INVOKESPECIAL,
        init_hi,
        init_lo,
        opcodes::ATHROW,
    ];
    debug_assert_eq!(body.len(), PROLOGUE_LEN as usize);
    body.extend_from_slice(&code.code);
    if body.len() > u16::MAX as usize {
        anyhow::bail!("{target} is too large to instrument");
    }
    code.code = body;
    code.shift_offsets(&class_file.pool, PROLOGUE_LEN)?;

    if class_file.major_version >= STACK_MAP_MAJOR_VERSION {
        let context = MethodContext {
            class_name: &class_name,
            descriptor: &descriptor,
            is_static,
            is_constructor: method_name == "<init>",
            hierarchy,
        };
        rebuild_stack_map(&mut code, &mut class_file.pool, &context, &[PROLOGUE_LEN])
            .with_context(|| format!("recompute stack map frames for {target}"))?;
    }
    let argument_slots = u16::try_from(argument_slots(&descriptor, is_static)?)
        .context("argument slots exceed 65535")?;
    code.max_stack = code.max_stack.max(original_max_stack).max(2);
    code.max_locals = code.max_locals.max(original_max_locals).max(argument_slots);

    class_file.methods[method_index].attributes[code_position].info = code.encode();
    info!(class = %class_name, method = %method_name, %descriptor, "injected failure");
    Ok(class_file.to_bytes())
}

/// Index of the method `target` names. An exact descriptor match wins when
/// several methods share the parameter list.
fn find_target(class_file: &ClassFile, target: &MethodRef) -> Result<usize> {
    let mut candidates = Vec::new();
    for (index, method) in class_file.methods.iter().enumerate() {
        let name = class_file.member_name(method)?;
        let descriptor = class_file.member_descriptor(method)?;
        if target.matches(&name, &descriptor) {
            candidates.push((index, descriptor));
        }
    }
    match candidates.as_slice() {
        [] => Err(RunError::MethodNotResolvable(format!("{target} is not declared here")).into()),
        [(index, _)] => Ok(*index),
        several => several
            .iter()
            .find(|(_, descriptor)| *descriptor == target.descriptor)
            .map(|(index, _)| *index)
            .ok_or_else(|| {
                RunError::MethodNotResolvable(format!("{target} matches several methods")).into()
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::annotations::annotation_descriptors;
    use crate::classfile::code::STACK_MAP_TABLE;
    use crate::hierarchy::SymbolTable;
    use crate::ir::Outcome;
    use crate::test_support::ClassFileBuilder;

    fn test_case(class: &str, name: &str, framework: Framework) -> TestCase {
        TestCase {
            method: MethodRef::new(class, name, "()V"),
            outcome: Outcome::Passed,
            execution_time: 0.0,
            superclass_owner: None,
            reported_class: None,
            framework,
        }
    }

    fn method_annotations(bytes: &[u8], name: &str) -> Vec<String> {
        let class_file = ClassFile::parse(bytes).expect("parse rewritten class");
        let method = class_file
            .methods
            .iter()
            .find(|method| class_file.member_name(method).expect("name") == name)
            .expect("method present");
        annotation_descriptors(&class_file.pool, &method.attributes).expect("annotations")
    }

    fn sample_test_class() -> Vec<u8> {
        let mut builder = ClassFileBuilder::new("a/CalcTest", "java/lang/Object");
        builder.add_method("<init>", "()V", vec![0xb1], 0, 1);
        builder.add_test_method("adds", "Lorg/junit/Test;");
        builder.add_test_method("subtracts", "Lorg/junit/Test;");
        builder.finish()
    }

    #[test]
    fn class_marker_is_added_once() {
        let bytes = ClassFileBuilder::new("a/CalcTest", "java/lang/Object").finish();

        let once = add_marker_annotation(&bytes, Framework::Junit5).expect("first marker");
        let twice = add_marker_annotation(&once, Framework::Junit5).expect("second marker");

        let class_file = ClassFile::parse(&twice).expect("parse");
        assert_eq!(
            annotation_descriptors(&class_file.pool, &class_file.attributes).expect("annotations"),
            vec!["Lorg/junit/jupiter/api/Disabled;".to_string()]
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn class_marker_replaces_class_level_test_markers() {
        let mut builder = ClassFileBuilder::new("a/SuiteTest", "java/lang/Object");
        builder.annotate_class("Lorg/junit/jupiter/api/Test;");
        builder.annotate_class("Lorg/junit/Test;");
        let bytes = builder.finish();

        let marked = add_marker_annotation(&bytes, Framework::Junit4).expect("marker");

        let class_file = ClassFile::parse(&marked).expect("parse");
        assert_eq!(
            annotation_descriptors(&class_file.pool, &class_file.attributes).expect("annotations"),
            vec!["Lorg/junit/Ignore;".to_string()]
        );
    }

    #[test]
    fn targeted_methods_lose_test_marker_and_are_consumed() {
        let mut targets = vec![test_case("a.CalcTest", "adds", Framework::Junit4)];

        let rewrite = add_ignore_annotation_to_methods(
            &sample_test_class(),
            MethodSelection::Targets(&mut targets),
        )
        .expect("rewrite");

        assert!(targets.is_empty());
        assert_eq!(rewrite.remaining_tests, 1);
        assert_eq!(
            method_annotations(&rewrite.bytes, "adds"),
            vec!["Lorg/junit/Ignore;".to_string()]
        );
        assert_eq!(
            method_annotations(&rewrite.bytes, "subtracts"),
            vec!["Lorg/junit/Test;".to_string()]
        );
    }

    #[test]
    fn disabled_method_still_matches_by_name_and_descriptor() {
        let mut targets = vec![test_case("a.CalcTest", "adds", Framework::Junit4)];
        let rewrite = add_ignore_annotation_to_methods(
            &sample_test_class(),
            MethodSelection::Targets(&mut targets),
        )
        .expect("rewrite");

        let class_file = ClassFile::parse(&rewrite.bytes).expect("parse");
        let reference = MethodRef::new("a.CalcTest", "adds", "()V");
        let method = class_file
            .methods
            .iter()
            .find(|method| {
                reference.matches(
                    &class_file.member_name(method).expect("name"),
                    &class_file.member_descriptor(method).expect("descriptor"),
                )
            })
            .expect("method still matches");
        assert!(
            !has_annotation(&class_file.pool, &method.attributes, "Lorg/junit/Test;")
                .expect("lookup"),
            "disabled method must not be reported as a test"
        );
    }

    #[test]
    fn unmatched_targets_are_left_for_the_caller() {
        let mut targets = vec![test_case("a.CalcTest", "missing", Framework::Junit4)];
        let rewrite = add_ignore_annotation_to_methods(
            &sample_test_class(),
            MethodSelection::Targets(&mut targets),
        )
        .expect("rewrite");
        assert_eq!(targets.len(), 1);
        assert_eq!(rewrite.remaining_tests, 2);
    }

    #[test]
    fn match_all_skips_initializers() {
        let rewrite = add_ignore_annotation_to_methods(
            &sample_test_class(),
            MethodSelection::All(Framework::Junit5),
        )
        .expect("rewrite");

        assert_eq!(rewrite.remaining_tests, 0);
        assert!(method_annotations(&rewrite.bytes, "<init>").is_empty());
        assert_eq!(
            method_annotations(&rewrite.bytes, "subtracts"),
            vec!["Lorg/junit/jupiter/api/Disabled;".to_string()]
        );
    }

    fn calculator(major_version: u16) -> Vec<u8> {
        let mut builder = ClassFileBuilder::new("a/Calc", "java/lang/Object");
        builder.set_major_version(major_version);
        // int twice(int x) { return x + x; }
        builder.add_method("twice", "(I)I", vec![0x1b, 0x1b, 0x60, 0xac], 2, 2);
        builder.finish()
    }

    #[test]
    fn injection_prepends_throw_and_rebuilds_frames() {
        let table = SymbolTable::new();
        let target = MethodRef::new("a.Calc", "twice", "(I)I");

        let bytes = inject_unconditional_failure(&calculator(52), &target, &table)
            .expect("inject failure");

        let class_file = ClassFile::parse(&bytes).expect("parse");
        let method = &class_file.methods[0];
        let code_attribute = method
            .attributes
            .iter()
            .find(|attribute| class_file.attribute_name(attribute).expect("name") == CODE)
            .expect("code");
        let code = CodeAttribute::parse(&code_attribute.info).expect("parse code");
        assert_eq!(code.code.len(), 12);
        assert_eq!(code.code[0], opcodes::NEW);
        assert_eq!(code.code[7], opcodes::ATHROW);
        assert_eq!(&code.code[8..], &[0x1b, 0x1b, 0x60, 0xac]);
        let new_class = u16::from_be_bytes([code.code[1], code.code[2]]);
        assert_eq!(
            class_file.pool.class_name(new_class).expect("class"),
            ASSERTION_ERROR
        );
        assert_eq!(code.max_stack, 2);
        assert_eq!(code.max_locals, 2);
        let frames = code
            .attributes
            .iter()
            .find(|attribute| {
                class_file.attribute_name(attribute).expect("name") == STACK_MAP_TABLE
            })
            .expect("stack map table");
        // one full frame at offset 8: [Calc, int], empty stack
        assert_eq!(&frames.info[..6], &[0, 1, 255, 0, 8, 0]);
        assert_eq!(frames.info[6], 2);
    }

    #[test]
    fn old_class_versions_get_no_stack_map() {
        let table = SymbolTable::new();
        let target = MethodRef::new("a.Calc", "twice", "(I)I");

        let bytes = inject_unconditional_failure(&calculator(49), &target, &table)
            .expect("inject failure");

        let class_file = ClassFile::parse(&bytes).expect("parse");
        let code = CodeAttribute::parse(&class_file.methods[0].attributes[0].info).expect("code");
        assert!(code.attributes.is_empty());
        assert_eq!(code.code.len(), 12);
    }

    #[test]
    fn bodyless_target_is_not_resolvable() {
        let mut builder = ClassFileBuilder::new("a/Shape", "java/lang/Object");
        builder.add_abstract_method("area", "()D");
        let table = SymbolTable::new();
        let target = MethodRef::new("a.Shape", "area", "()D");

        let err = inject_unconditional_failure(&builder.finish(), &target, &table)
            .expect_err("abstract method cannot be injected");

        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::MethodNotResolvable(_))
        ));
    }

    #[test]
    fn missing_target_is_not_resolvable() {
        let table = SymbolTable::new();
        let target = MethodRef::new("a.Calc", "thrice", "(I)I");

        let err = inject_unconditional_failure(&calculator(52), &target, &table)
            .expect_err("missing method");

        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::MethodNotResolvable(_))
        ));
    }
}
