//! Declarative debugging tasks and the per-trial driver that runs them.

pub(crate) mod engine;
pub(crate) mod session;
pub(crate) mod transport;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::descriptor::{jdb_signature, native_symbol};
use crate::error::RunError;
use crate::ir::{MethodRef, TestCase};
use crate::telemetry::{Telemetry, with_span};

use engine::{PollBudget, run_task};
use transport::DebuggerChannel;

const METHOD_SIGNATURE_PLACEHOLDER: &str = "$methodFQN";
const METHOD_NATIVE_PLACEHOLDER: &str = "$methodNative";
const CLASS_PLACEHOLDER: &str = "$classFQN";
const TEST_PLACEHOLDER: &str = "$junitTest";

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<TaskEntry>,
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    name: String,
    #[serde(default)]
    units: Vec<UnitEntry>,
}

#[derive(Debug, Deserialize)]
struct UnitEntry {
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default, rename = "repeatUntil")]
    repeat_until: Option<String>,
}

/// Values substituted for the target placeholders of a task file.
#[derive(Clone, Debug)]
pub(crate) struct TargetBindings {
    method_signature: String,
    method_native: String,
    class_name: String,
}

impl TargetBindings {
    pub(crate) fn for_target(target: &MethodRef) -> Result<Self> {
        Ok(Self {
            method_signature: jdb_signature(target)?,
            method_native: native_symbol(target),
            class_name: target.declaring_class.clone(),
        })
    }

    fn apply(&self, text: &str) -> String {
        text.replace(METHOD_SIGNATURE_PLACEHOLDER, &self.method_signature)
            .replace(METHOD_NATIVE_PLACEHOLDER, &self.method_native)
            .replace(CLASS_PLACEHOLDER, &self.class_name)
    }
}

/// One command sent to the debugger and the output that completes it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct DebuggingTaskUnit {
    pub(crate) command_input: Option<String>,
    pub(crate) expected_output: Option<String>,
    pub(crate) repeat_until: Option<String>,
}

impl DebuggingTaskUnit {
    /// Copy of the unit with the test identifier filled in.
    pub(crate) fn bind_test(&self, test_id: &str) -> Self {
        let bind = |field: &Option<String>| {
            field
                .as_ref()
                .map(|text| text.replace(TEST_PLACEHOLDER, test_id))
        };
        Self {
            command_input: bind(&self.command_input),
            expected_output: bind(&self.expected_output),
            repeat_until: bind(&self.repeat_until),
        }
    }

    fn from_entry(entry: UnitEntry, bindings: &TargetBindings) -> Self {
        Self {
            command_input: entry.input.map(|text| bindings.apply(&text)),
            expected_output: entry.output.map(|text| bindings.apply(&text)),
            repeat_until: entry.repeat_until.map(|text| bindings.apply(&text)),
        }
    }
}

/// Unit that lets the runtime's own segmentation faults through the native debugger.
fn native_signal_unit() -> DebuggingTaskUnit {
    DebuggingTaskUnit {
        command_input: Some("handle SIGSEGV pass noprint nostop".to_string()),
        expected_output: Some("SIGSEGV".to_string()),
        repeat_until: None,
    }
}

/// Named, ordered list of units with a replay cursor.
#[derive(Clone, Debug)]
pub(crate) struct DebuggingTask {
    name: String,
    units: Vec<DebuggingTaskUnit>,
    cursor: usize,
}

impl DebuggingTask {
    pub(crate) fn new(name: &str, units: Vec<DebuggingTaskUnit>) -> Self {
        Self {
            name: name.to_string(),
            units,
            cursor: 0,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn units(&self) -> &[DebuggingTaskUnit] {
        &self.units
    }

    pub(crate) fn has_more(&self) -> bool {
        self.cursor < self.units.len()
    }

    pub(crate) fn next_unit(&mut self) -> Option<&DebuggingTaskUnit> {
        if !self.has_more() {
            return None;
        }
        self.cursor += 1;
        self.units.get(self.cursor - 1)
    }

    pub(crate) fn insert_unit(&mut self, index: usize, unit: DebuggingTaskUnit) {
        let index = index.min(self.units.len());
        self.units.insert(index, unit);
    }

    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Parse a task document, binding the target placeholders once. Native
/// debugger tasks start with [`native_signal_unit`].
pub(crate) fn parse_tasks(
    json: &str,
    bindings: &TargetBindings,
    transport: Transport,
) -> Result<Vec<DebuggingTask>> {
    let mut deserializer = serde_json::Deserializer::from_str(json);
    let file: TaskFile = serde_path_to_error::deserialize(&mut deserializer).map_err(|err| {
        RunError::IllegalInput(format!("task file at {}: {}", err.path(), err.inner()))
    })?;
    Ok(file
        .tasks
        .into_iter()
        .map(|task| {
            let units = task
                .units
                .into_iter()
                .map(|unit| DebuggingTaskUnit::from_entry(unit, bindings))
                .collect();
            let mut task = DebuggingTask::new(&task.name, units);
            if transport == Transport::Gdb {
                task.insert_unit(0, native_signal_unit());
            }
            task
        })
        .collect())
}

pub(crate) fn load_tasks(
    path: &Path,
    bindings: &TargetBindings,
    transport: Transport,
) -> Result<Vec<DebuggingTask>> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read task file {}", path.display()))?;
    parse_tasks(&json, bindings, transport)
        .with_context(|| format!("failed to load {}", path.display()))
}

/// Debugger used for a trial.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Transport {
    /// Java debugger attached to a suspended debuggee over a socket.
    Jdb,
    /// Native debugger wrapping the debuggee command line.
    Gdb,
}

impl Transport {
    fn transcript_prefix(self) -> &'static str {
        match self {
            Transport::Jdb => "JDB",
            Transport::Gdb => "GDB",
        }
    }
}

/// Opens a live debugger session for one test.
pub(crate) trait Launcher {
    type Session: DebuggerChannel;

    fn launch(&self, transport: Transport, test: &TestCase) -> Result<Self::Session>;
}

/// Subdirectory of the output directory holding transcripts of the unprotected build.
pub(crate) const BASELINE_DIR: &str = "original";

/// Result row for one (task, test) pair.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct TrialOutcome {
    pub(crate) task: String,
    pub(crate) transport: Transport,
    pub(crate) test: String,
    pub(crate) success: bool,
    pub(crate) transcript: PathBuf,
    /// Same trial against the unprotected build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) baseline: Option<Baseline>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct Baseline {
    pub(crate) success: bool,
    pub(crate) transcript: PathBuf,
}

impl TrialOutcome {
    /// The task worked on the unprotected build but not on the protected one.
    pub(crate) fn blocked(&self) -> bool {
        !self.success && self.baseline.as_ref().is_some_and(|baseline| baseline.success)
    }
}

/// Pair each protected trial with the baseline run of the same task and test.
/// Both lists come from [`run_trials`] over the same tasks and tests.
pub(crate) fn attach_baseline(trials: &mut [TrialOutcome], baseline: Vec<TrialOutcome>) {
    for (trial, original) in trials.iter_mut().zip(baseline) {
        debug_assert_eq!((&trial.task, &trial.test), (&original.task, &original.test));
        trial.baseline = Some(Baseline {
            success: original.success,
            transcript: original.transcript,
        });
    }
}

/// Identifier the debugger sees for a test, `owner.name`.
pub(crate) fn test_identifier(test: &TestCase) -> String {
    format!("{}.{}", test.owner_class(), test.method.name)
}

pub(crate) fn transcript_path(
    out_dir: &Path,
    transport: Transport,
    task: &str,
    test: &TestCase,
) -> PathBuf {
    out_dir.join(format!(
        "{}_{}_{}_{}.txt",
        transport.transcript_prefix(),
        task,
        test.launch_class(),
        test.method.name
    ))
}

/// Run every task against every test, one session at a time.
pub(crate) fn run_trials<L: Launcher>(
    launcher: &L,
    transport: Transport,
    tasks: &mut [DebuggingTask],
    tests: &[TestCase],
    out_dir: &Path,
    budget: PollBudget,
    telemetry: Option<&Telemetry>,
) -> Result<Vec<TrialOutcome>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let mut outcomes = Vec::with_capacity(tasks.len() * tests.len());
    for task in tasks.iter_mut() {
        for test in tests {
            let attributes = [
                KeyValue::new("debugproof.task", task.name().to_string()),
                KeyValue::new("debugproof.test", test.display_name()),
                KeyValue::new("debugproof.transport", transport.transcript_prefix()),
            ];
            let outcome = with_span(telemetry, "debug.trial", &attributes, || {
                run_trial(launcher, transport, task, test, out_dir, budget)
            })?;
            outcomes.push(outcome);
        }
    }
    Ok(outcomes)
}

fn run_trial<L: Launcher>(
    launcher: &L,
    transport: Transport,
    task: &mut DebuggingTask,
    test: &TestCase,
    out_dir: &Path,
    budget: PollBudget,
) -> Result<TrialOutcome> {
    info!(
        "starting {:?} task {} ({} units) on test {}",
        transport,
        task.name(),
        task.units().len(),
        test.display_name()
    );
    let transcript = transcript_path(out_dir, transport, task.name(), test);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&transcript)
        .with_context(|| format!("failed to create transcript {}", transcript.display()))?;
    let mut session = launcher.launch(transport, test)?;
    let success = run_task(&mut session, task, &test_identifier(test), budget, &mut file)?;
    drop(session);
    if success {
        info!("task {} on test {} succeeded", task.name(), test.display_name());
    } else {
        warn!("task {} on test {} failed", task.name(), test.display_name());
    }
    Ok(TrialOutcome {
        task: task.name().to_string(),
        transport,
        test: test.display_name(),
        success,
        transcript,
        baseline: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::transport::tests::ScriptedChannel;
    use crate::ir::{Framework, Outcome};
    use std::cell::RefCell;

    fn target() -> MethodRef {
        MethodRef::new("org.x.Calc", "add", "(Ljava/lang/String;[I)I")
    }

    fn failed_test(class: &str, name: &str) -> TestCase {
        TestCase {
            method: MethodRef::new(class, name, "()V"),
            outcome: Outcome::Failed,
            execution_time: 0.0,
            superclass_owner: None,
            reported_class: None,
            framework: Framework::Junit5,
        }
    }

    #[test]
    fn target_placeholders_are_bound_at_parse_time() {
        let bindings = TargetBindings::for_target(&target()).expect("bindings");
        let json = r#"{"tasks":[{"name":"bp","units":[
            {"input":"stop in $methodFQN","output":"Set breakpoint $classFQN"},
            {"input":"break $methodNative","output":null,"repeatUntil":"run $junitTest"}
        ]}]}"#;
        let tasks = parse_tasks(json, &bindings, Transport::Jdb).expect("tasks");
        assert_eq!(tasks.len(), 1);
        let units = tasks[0].units();
        assert_eq!(
            units[0].command_input.as_deref(),
            Some("stop in org.x.Calc.add(java.lang.String, int[])")
        );
        assert_eq!(
            units[0].expected_output.as_deref(),
            Some("Set breakpoint org.x.Calc")
        );
        assert_eq!(units[0].repeat_until, None);
        assert_eq!(
            units[1].command_input.as_deref(),
            Some("break Java_org_x_Calc_add")
        );
        assert_eq!(units[1].expected_output, None);
        assert_eq!(units[1].repeat_until.as_deref(), Some("run $junitTest"));
    }

    #[test]
    fn test_placeholder_is_bound_per_trial_without_mutating_the_task() {
        let unit = DebuggingTaskUnit {
            command_input: Some("stop in $junitTest".to_string()),
            expected_output: None,
            repeat_until: None,
        };
        let bound = unit.bind_test("org.x.Base.t");
        assert_eq!(bound.command_input.as_deref(), Some("stop in org.x.Base.t"));
        assert_eq!(unit.command_input.as_deref(), Some("stop in $junitTest"));
    }

    #[test]
    fn malformed_task_file_reports_json_path() {
        let bindings = TargetBindings::for_target(&target()).expect("bindings");
        let json = r#"{"tasks":[{"name":"bp","units":[{"input":3}]}]}"#;
        let err = parse_tasks(json, &bindings, Transport::Jdb).expect_err("invalid unit");
        let message = err.to_string();
        assert!(message.contains("tasks[0].units[0].input"), "{message}");
        assert_eq!(crate::error::exit_code_for(&err), 3);
    }

    #[test]
    fn cursor_walks_units_in_order_and_rewinds() {
        let mut task = DebuggingTask::new(
            "t",
            vec![DebuggingTaskUnit::default(), native_signal_unit()],
        );
        assert!(task.has_more());
        assert_eq!(task.next_unit(), Some(&DebuggingTaskUnit::default()));
        assert_eq!(task.next_unit(), Some(&native_signal_unit()));
        assert!(!task.has_more());
        assert_eq!(task.next_unit(), None);
        task.reset();
        assert!(task.has_more());
    }

    #[test]
    fn native_tasks_start_with_the_signal_directive() {
        let bindings = TargetBindings::for_target(&target()).expect("bindings");
        let json = r#"{"tasks":[
            {"name":"bp","units":[{"input":"break $methodNative","output":"Breakpoint 1"}]},
            {"name":"empty","units":[]}
        ]}"#;

        let native = parse_tasks(json, &bindings, Transport::Gdb).expect("gdb tasks");
        assert_eq!(native.len(), 2);
        for task in &native {
            let first = &task.units()[0];
            assert_eq!(
                first.command_input.as_deref(),
                Some("handle SIGSEGV pass noprint nostop"),
                "{}",
                task.name()
            );
            assert_eq!(first.expected_output.as_deref(), Some("SIGSEGV"));
        }
        assert_eq!(native[0].units().len(), 2);
        assert_eq!(
            native[0].units()[1].command_input.as_deref(),
            Some("break Java_org_x_Calc_add")
        );

        let managed = parse_tasks(json, &bindings, Transport::Jdb).expect("jdb tasks");
        assert_eq!(managed[0].units().len(), 1);
        assert!(managed[1].units().is_empty());
    }

    #[test]
    fn inserted_unit_index_is_clamped() {
        let mut task = DebuggingTask::new("t", vec![DebuggingTaskUnit::default()]);
        task.insert_unit(5, native_signal_unit());
        assert_eq!(task.units()[1], native_signal_unit());
    }

    #[test]
    fn test_identifier_prefers_superclass_owner() {
        let mut test = failed_test("org.x.Child", "t");
        assert_eq!(test_identifier(&test), "org.x.Child.t");
        test.move_to("org.x.Base");
        assert_eq!(test_identifier(&test), "org.x.Base.t");
        assert_eq!(
            transcript_path(Path::new("out"), Transport::Jdb, "bp", &test),
            Path::new("out").join("JDB_bp_org.x.Child_t.txt")
        );
    }

    struct ScriptedLauncher {
        scripts: RefCell<Vec<Vec<&'static str>>>,
        launched: RefCell<Vec<String>>,
    }

    impl Launcher for ScriptedLauncher {
        type Session = ScriptedChannel;

        fn launch(&self, _transport: Transport, test: &TestCase) -> Result<ScriptedChannel> {
            self.launched.borrow_mut().push(test.display_name());
            let script = self.scripts.borrow_mut().remove(0);
            Ok(ScriptedChannel::new(&script))
        }
    }

    #[test]
    fn trials_replay_each_task_per_test_and_record_failures() {
        let dir = tempfile::tempdir().expect("temp dir");
        let launcher = ScriptedLauncher {
            scripts: RefCell::new(vec![vec!["Breakpoint hit\n"], vec!["nothing here\n"]]),
            launched: RefCell::new(Vec::new()),
        };
        let mut tasks = vec![DebuggingTask::new(
            "bp",
            vec![DebuggingTaskUnit {
                command_input: Some("run".to_string()),
                expected_output: Some("breakpoint hit".to_string()),
                repeat_until: None,
            }],
        )];
        let tests = vec![failed_test("org.x.A", "one"), failed_test("org.x.A", "two")];
        let budget = PollBudget::new(std::time::Duration::ZERO, 3);
        let outcomes = run_trials(
            &launcher,
            Transport::Jdb,
            &mut tasks,
            &tests,
            dir.path(),
            budget,
            None,
        )
        .expect("trials");

        assert_eq!(
            launcher.launched.borrow().as_slice(),
            ["org.x.A.one", "org.x.A.two"]
        );
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        let transcript = fs::read_to_string(dir.path().join("JDB_bp_org.x.A_two.txt"))
            .expect("transcript");
        assert!(transcript.contains("[LOG] command sent is: \"run\""), "{transcript}");
        assert!(transcript.contains("nothing here"), "{transcript}");
    }

    #[test]
    fn baseline_trials_pair_with_protected_ones() {
        let dir = tempfile::tempdir().expect("temp dir");
        let protected = ScriptedLauncher {
            scripts: RefCell::new(vec![vec!["Breakpoint hit\n"], vec!["crashed\n"]]),
            launched: RefCell::new(Vec::new()),
        };
        let original = ScriptedLauncher {
            scripts: RefCell::new(vec![vec!["Breakpoint hit\n"], vec!["Breakpoint hit\n"]]),
            launched: RefCell::new(Vec::new()),
        };
        let mut tasks = vec![DebuggingTask::new(
            "bp",
            vec![DebuggingTaskUnit {
                command_input: Some("run".to_string()),
                expected_output: Some("breakpoint hit".to_string()),
                repeat_until: None,
            }],
        )];
        let tests = vec![failed_test("org.x.A", "one"), failed_test("org.x.A", "two")];
        let budget = PollBudget::new(std::time::Duration::ZERO, 3);
        let baseline_dir = dir.path().join(BASELINE_DIR);

        let mut trials = run_trials(
            &protected,
            Transport::Jdb,
            &mut tasks,
            &tests,
            dir.path(),
            budget,
            None,
        )
        .expect("protected trials");
        let baseline = run_trials(
            &original,
            Transport::Jdb,
            &mut tasks,
            &tests,
            &baseline_dir,
            budget,
            None,
        )
        .expect("baseline trials");
        attach_baseline(&mut trials, baseline);

        assert!(!trials[0].blocked());
        assert!(trials[1].blocked());
        let second = trials[1].baseline.as_ref().expect("baseline");
        assert!(second.success);
        assert_eq!(second.transcript, baseline_dir.join("JDB_bp_org.x.A_two.txt"));
        assert!(second.transcript.exists());
        assert!(dir.path().join("JDB_bp_org.x.A_two.txt").exists());
    }

    #[test]
    fn existing_transcript_is_an_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let test = failed_test("org.x.A", "one");
        fs::write(transcript_path(dir.path(), Transport::Gdb, "bp", &test), "old")
            .expect("write");
        let launcher = ScriptedLauncher {
            scripts: RefCell::new(vec![vec![]]),
            launched: RefCell::new(Vec::new()),
        };
        let mut tasks = vec![DebuggingTask::new("bp", Vec::new())];
        let err = run_trials(
            &launcher,
            Transport::Gdb,
            &mut tasks,
            &[test],
            dir.path(),
            PollBudget::new(std::time::Duration::ZERO, 1),
            None,
        )
        .expect_err("create-new must fail");
        assert_eq!(crate::error::exit_code_for(&err), 2);
        assert!(launcher.launched.borrow().is_empty());
    }
}
