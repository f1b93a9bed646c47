//! Test ownership resolution and test-jar curation.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RunError;
use crate::hierarchy::TypeHierarchy;
use crate::ir::{ExcludedClass, Framework, MethodRef, Outcome, ROOT_CLASS, TestCase, dotted_name};
use crate::rewriter::{
    MethodSelection, add_ignore_annotation_to_methods, add_marker_annotation,
    inject_unconditional_failure,
};
use crate::scan::{ClassEntry, ClassSet, MethodSummary};
use crate::telemetry::{Telemetry, with_span};

/// Tests keyed by the dotted name of the class believed to declare them.
pub(crate) type TestMapping = BTreeMap<String, Vec<TestCase>>;

/// Stable ownership mapping and how it was reached.
#[derive(Debug)]
pub(crate) struct Resolution {
    pub(crate) mapping: TestMapping,
    /// Full passes run, including the final pass without moves.
    pub(crate) passes: usize,
    /// Tests that reached the root type without being found.
    pub(crate) dropped: Vec<TestCase>,
}

/// Group tests by their current declaring class.
pub(crate) fn group_by_class<'a>(tests: impl IntoIterator<Item = &'a TestCase>) -> TestMapping {
    let mut mapping = TestMapping::new();
    for test in tests {
        let bucket = mapping
            .entry(test.method.declaring_class.clone())
            .or_insert_with(Vec::new);
        if !bucket.contains(test) {
            bucket.push(test.clone());
        }
    }
    mapping
}

/// Move every test up its superclass chain until the class that declares it
/// is found. Runs full passes until one makes no move.
pub(crate) fn resolve(
    mut mapping: TestMapping,
    classes: &ClassSet,
    require_all: bool,
    telemetry: Option<&Telemetry>,
) -> Result<Resolution> {
    let attributes = [KeyValue::new(
        "debugproof.classes",
        mapping.len() as i64,
    )];
    with_span(telemetry, "resolver.resolve", &attributes, || -> Result<Resolution> {
        let mut passes = 0usize;
        let mut dropped = Vec::new();
        loop {
            passes += 1;
            let mut moves = 0usize;
            let snapshot = mapping.keys().cloned().collect::<Vec<_>>();
            for class_name in snapshot {
                let Some(tests) = mapping.remove(&class_name) else {
                    continue;
                };
                let Some(entry) = classes.get(&class_name) else {
                    for test in tests {
                        unresolved(
                            test,
                            "declaring class is not in the scanned set",
                            require_all,
                            &mut dropped,
                        )?;
                    }
                    continue;
                };
                let (kept, missing): (Vec<_>, Vec<_>) = tests
                    .into_iter()
                    .partition(|test| declares_test(entry, &test.method));
                if !kept.is_empty() {
                    mapping.insert(class_name.clone(), kept);
                }
                for mut test in missing {
                    moves += 1;
                    let super_name = match entry.summary.super_name.as_deref() {
                        None | Some(ROOT_CLASS) => {
                            unresolved(test, "reached the root type", require_all, &mut dropped)?;
                            continue;
                        }
                        Some(super_name) => super_name,
                    };
                    if !classes.contains(super_name) {
                        unresolved(
                            test,
                            "superclass is not in the scanned set",
                            require_all,
                            &mut dropped,
                        )?;
                        continue;
                    }
                    let owner = dotted_name(super_name);
                    test.move_to(&owner);
                    let bucket = mapping.entry(owner).or_insert_with(Vec::new);
                    if !bucket.contains(&test) {
                        bucket.push(test);
                    }
                }
            }
            if moves == 0 {
                break;
            }
        }
        info!(passes, classes = mapping.len(), dropped = dropped.len(), "resolved test owners");
        Ok(Resolution {
            mapping,
            passes,
            dropped,
        })
    })
}

fn find_declared<'a>(entry: &'a ClassEntry, method: &MethodRef) -> Option<&'a MethodSummary> {
    entry
        .summary
        .methods
        .iter()
        .find(|declared| method.matches(&declared.name, &declared.descriptor))
}

/// Static methods cannot be tests, so a same-named static does not own one.
fn declares_test(entry: &ClassEntry, method: &MethodRef) -> bool {
    find_declared(entry, method).is_some_and(|declared| !declared.is_static)
}

fn unresolved(
    test: TestCase,
    reason: &str,
    require_all: bool,
    dropped: &mut Vec<TestCase>,
) -> Result<()> {
    if require_all {
        return Err(RunError::MethodNotResolvable(format!(
            "{} ({reason})",
            test.display_name()
        ))
        .into());
    }
    warn!(test = %test.display_name(), reason, "dropping unresolved test");
    dropped.push(test);
    Ok(())
}

/// Find the class that declares `target`, starting at its declaring class and
/// walking up the superclass chain within `classes`.
pub(crate) fn locate_defining_class(classes: &ClassSet, target: &MethodRef) -> Result<MethodRef> {
    let mut current = Some(target.declaring_class.clone());
    while let Some(class_name) = current {
        let Some(entry) = classes.get(&class_name) else {
            break;
        };
        if let Some(declared) = find_declared(entry, target) {
            if !declared.has_code {
                return Err(RunError::MethodNotResolvable(format!(
                    "{target} is declared without a body in {}",
                    dotted_name(&entry.summary.name)
                ))
                .into());
            }
            let mut located = target.clone();
            located.declaring_class = dotted_name(&entry.summary.name);
            return Ok(located);
        }
        current = entry
            .summary
            .super_name
            .as_deref()
            .filter(|name| *name != ROOT_CLASS)
            .map(dotted_name);
    }
    Err(RunError::MethodNotResolvable(format!("{target} is not declared in the jar")).into())
}

/// Rewritten entries for the instrumented build.
#[derive(Debug)]
pub(crate) struct Instrumentation {
    pub(crate) target: MethodRef,
    pub(crate) replacements: BTreeMap<String, Vec<u8>>,
}

/// Inject the unconditional failure into the class that defines `target`.
pub(crate) fn instrument(
    classes: &ClassSet,
    target: &MethodRef,
    hierarchy: &dyn TypeHierarchy,
    telemetry: Option<&Telemetry>,
) -> Result<Instrumentation> {
    let located = locate_defining_class(classes, target)?;
    let entry = classes
        .get(&located.declaring_class)
        .context("defining class disappeared from the class set")?;
    let attributes = [KeyValue::new("debugproof.target", located.to_string())];
    let bytes = with_span(telemetry, "rewriter.inject", &attributes, || {
        inject_unconditional_failure(&entry.bytes, &located, hierarchy)
    })?;
    let mut replacements = BTreeMap::new();
    replacements.insert(entry.path.clone(), bytes);
    Ok(Instrumentation {
        target: located,
        replacements,
    })
}

/// Outcomes of running the tests against the instrumented target.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct TestReport {
    #[serde(default)]
    pub(crate) tests: Vec<TestCase>,
    /// Classes the runner could only report as a whole.
    #[serde(default)]
    pub(crate) classes: Vec<ExcludedClass>,
}

impl TestReport {
    /// Tests that failed because they reached the injected failure.
    pub(crate) fn relevant(&self) -> Vec<TestCase> {
        self.tests
            .iter()
            .filter(|test| test.outcome == Outcome::Failed)
            .cloned()
            .collect()
    }
}

/// Which reported tests a curation pass disables. Unusable tests are always disabled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Disable {
    /// Tests that did not reach the injected failure.
    #[default]
    Passed,
    /// Tests already failing on the unmodified build.
    Failed,
    /// Every reported test.
    All,
}

impl Disable {
    fn disables(self, outcome: Outcome) -> bool {
        match self {
            Disable::Passed => outcome != Outcome::Failed,
            Disable::Failed => outcome != Outcome::Passed,
            Disable::All => true,
        }
    }
}

/// Everything a curation pass decided.
#[derive(Debug)]
pub(crate) struct Curation {
    /// Rewritten class bytes by entry path.
    pub(crate) replacements: BTreeMap<String, Vec<u8>>,
    /// Disabled tests by defining class.
    pub(crate) excluded: TestMapping,
    /// Classes disabled as a whole.
    pub(crate) excluded_classes: Vec<String>,
    /// Tests left runnable, with their owners resolved.
    pub(crate) kept: Vec<TestCase>,
    pub(crate) passes: usize,
}

/// Disable the tests `disable` selects. Classes holding a kept test are never
/// disabled as a whole.
pub(crate) fn curate(
    classes: &ClassSet,
    report: &TestReport,
    disable: Disable,
    require_all: bool,
    telemetry: Option<&Telemetry>,
) -> Result<Curation> {
    let attributes = [KeyValue::new(
        "debugproof.tests",
        report.tests.len() as i64,
    )];
    with_span(telemetry, "resolver.curate", &attributes, || -> Result<Curation> {
        let (disabled, kept): (Vec<&TestCase>, Vec<&TestCase>) = report
            .tests
            .iter()
            .partition(|test| disable.disables(test.outcome));
        if disable == Disable::Passed && kept.is_empty() {
            return Err(RunError::NoRelevantTests.into());
        }
        let kept_resolution = resolve(group_by_class(kept), classes, require_all, telemetry)?;
        let kept = kept_resolution
            .mapping
            .into_values()
            .flatten()
            .collect::<Vec<_>>();
        let mut protected = BTreeSet::new();
        for test in &kept {
            protected.insert(test.launch_class().to_string());
            protected.insert(test.owner_class().to_string());
        }

        let resolution = resolve(group_by_class(disabled), classes, require_all, telemetry)?;

        let mut replacements: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut excluded_classes = BTreeSet::new();
        for excluded in &report.classes {
            let outer = excluded.outer_name();
            let Some(entry) = classes.get(outer) else {
                if require_all {
                    return Err(RunError::MethodNotResolvable(format!(
                        "excluded class {} is not in the jar",
                        excluded.name
                    ))
                    .into());
                }
                warn!(class = %excluded.name, "excluded class not found");
                continue;
            };
            if !excluded_classes.insert(dotted_name(&entry.summary.name)) {
                continue;
            }
            let bytes = current_bytes(&replacements, entry);
            let marked = add_marker_annotation(bytes, excluded.framework)?;
            let rewrite =
                add_ignore_annotation_to_methods(
                    &marked,
                    MethodSelection::All(excluded.framework),
                )?;
            info!(class = %entry.summary.name, "excluded whole class");
            replacements.insert(entry.path.clone(), rewrite.bytes);
        }

        let mut excluded = TestMapping::new();
        for (class_name, tests) in resolution.mapping {
            if tests.is_empty() || excluded_classes.contains(&class_name) {
                continue;
            }
            let entry = classes
                .get(&class_name)
                .with_context(|| format!("resolved class {class_name} is not in the jar"))?;
            let mut targets = tests.clone();
            let rewrite = add_ignore_annotation_to_methods(
                current_bytes(&replacements, entry),
                MethodSelection::Targets(&mut targets),
            )?;
            if !targets.is_empty() {
                let names = targets
                    .iter()
                    .map(TestCase::display_name)
                    .collect::<Vec<_>>()
                    .join(", ");
                if require_all {
                    return Err(RunError::MethodNotResolvable(format!(
                        "tests not matched in {class_name}: {names}"
                    ))
                    .into());
                }
                warn!(class = %class_name, tests = %names, "resolved tests not matched");
            }
            let mut bytes = rewrite.bytes;
            if rewrite.remaining_tests == 0 && !protected.contains(&class_name) {
                for framework in Framework::ALL {
                    bytes = add_marker_annotation(&bytes, framework)?;
                }
                info!(class = %class_name, "no runnable tests left; disabled class");
            }
            replacements.insert(entry.path.clone(), bytes);
            excluded.insert(class_name, tests);
        }

        info!(
            rewritten = replacements.len(),
            kept = kept.len(),
            ?disable,
            "curated test classes"
        );
        Ok(Curation {
            replacements,
            excluded,
            excluded_classes: excluded_classes.into_iter().collect(),
            kept,
            passes: resolution.passes,
        })
    })
}

fn current_bytes<'a>(
    replacements: &'a BTreeMap<String, Vec<u8>>,
    entry: &'a ClassEntry,
) -> &'a [u8] {
    replacements
        .get(&entry.path)
        .map(Vec::as_slice)
        .unwrap_or(&entry.bytes)
}
