mod classfile;
mod debug;
mod descriptor;
mod error;
mod frames;
mod hierarchy;
mod ir;
mod opcodes;
mod report;
mod resolver;
mod rewriter;
mod scan;
mod scorer;
mod telemetry;
#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use crate::debug::engine::PollBudget;
use crate::debug::session::{LaunchConfig, ProcessLauncher};
use crate::debug::{
    BASELINE_DIR, TargetBindings, Transport, attach_baseline, load_tasks, run_trials,
};
use crate::error::{RunError, exit_code_for};
use crate::ir::{MethodRef, ScoredMethod, TestCase};
use crate::report::{
    CurationReport, DebugReport, InstrumentReport, SelectionReport, VerifierFallback, read_json,
    write_json,
};
use crate::resolver::{Disable, TestReport, curate, group_by_class, instrument, resolve};
use crate::scan::{ClassSet, write_output};
use crate::scorer::select_target;
use crate::telemetry::{Telemetry, init_logging};

/// CLI arguments for debugproof execution.
#[derive(Parser, Debug)]
#[command(
    name = "debugproof",
    about = "Check whether JVM bytecode protections stop debuggers, using the project's own tests.",
    version
)]
struct Cli {
    /// OTLP/HTTP collector URL; spans are exported when set.
    #[arg(long, global = true, value_name = "URL")]
    otel: Option<String>,
    /// Where to write the JSON report; `-` or absent prints to stdout.
    #[arg(long, global = true, value_name = "PATH")]
    output: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pick the target method from coverage counters.
    Select {
        #[arg(long, value_name = "FILE")]
        coverage: PathBuf,
    },
    /// Make the target method fail unconditionally.
    Instrument {
        #[arg(long, value_name = "JAR")]
        jar: PathBuf,
        #[arg(long, value_name = "FILE")]
        target: PathBuf,
        #[arg(long, value_name = "JAR")]
        out_jar: PathBuf,
        /// Extra jars consulted for superclass lookups.
        #[arg(long, value_name = "JAR")]
        classpath: Vec<PathBuf>,
    },
    /// Disable a selection of reported tests in a test jar.
    Curate {
        #[arg(long, value_name = "JAR")]
        jar: PathBuf,
        #[arg(long, value_name = "FILE")]
        report: PathBuf,
        #[arg(long, value_name = "JAR")]
        out_jar: PathBuf,
        /// Reported tests to disable.
        #[arg(long, value_enum, default_value_t = Disable::Passed)]
        disable: Disable,
        /// Fail when a test cannot be traced to its defining class.
        #[arg(long)]
        require_all: bool,
    },
    /// Run debugging tasks against the relevant tests.
    Debug {
        #[arg(long, value_name = "FILE")]
        target: PathBuf,
        #[arg(long, value_name = "FILE")]
        report: PathBuf,
        /// Console launcher jar used to run one selected test.
        #[arg(long, value_name = "JAR")]
        runner: PathBuf,
        #[arg(long, value_name = "JAR")]
        tests_jar: PathBuf,
        #[arg(long, value_name = "JAR")]
        target_jar: PathBuf,
        /// Unprotected build of the target; every trial is repeated against it.
        #[arg(long, value_name = "JAR")]
        original_jar: Option<PathBuf>,
        #[arg(long, value_name = "DIR")]
        out_dir: PathBuf,
        #[arg(long, value_name = "FILE")]
        jdb_tasks: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        gdb_tasks: Option<PathBuf>,
        #[arg(long, value_name = "DIR")]
        native_lib_dir: Option<PathBuf>,
        /// Directory the processes run in; defaults to the output directory.
        #[arg(long, value_name = "DIR")]
        work_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = "java")]
        java: PathBuf,
        #[arg(long, default_value = "jdb")]
        jdb: PathBuf,
        #[arg(long, default_value = "gdb")]
        gdb: PathBuf,
        #[arg(long, default_value_t = 20)]
        poll_ms: u64,
        #[arg(long, default_value_t = 2500)]
        max_tries: u32,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            return ExitCode::from(1);
        }
        Err(err) => err.exit(),
    };
    init_logging();
    let telemetry = match cli.otel.as_deref().map(|url| Telemetry::new(url.to_string())) {
        Some(Ok(telemetry)) => Some(telemetry),
        Some(Err(err)) => {
            error!("{err:#}");
            return ExitCode::from(exit_code_for(&err));
        }
        None => None,
    };
    let result = run(cli, telemetry.as_ref());
    if let Some(telemetry) = &telemetry
        && let Err(err) = telemetry.shutdown()
    {
        warn!("{err:#}");
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(cli: Cli, telemetry: Option<&Telemetry>) -> Result<()> {
    let output = cli.output.as_deref();
    match cli.command {
        Command::Select { coverage } => run_select(&coverage, output),
        Command::Instrument {
            jar,
            target,
            out_jar,
            classpath,
        } => run_instrument(&jar, &target, &out_jar, &classpath, output, telemetry),
        Command::Curate {
            jar,
            report,
            out_jar,
            disable,
            require_all,
        } => run_curate(&jar, &report, &out_jar, disable, require_all, output, telemetry),
        Command::Debug {
            target,
            report,
            runner,
            tests_jar,
            target_jar,
            original_jar,
            out_dir,
            jdb_tasks,
            gdb_tasks,
            native_lib_dir,
            work_dir,
            limit,
            java,
            jdb,
            gdb,
            poll_ms,
            max_tries,
        } => {
            let budget = PollBudget::new(Duration::from_millis(poll_ms), max_tries);
            let config = LaunchConfig {
                java,
                jdb,
                gdb,
                runner,
                tests_jar,
                target_jar,
                native_lib_dir,
                work_dir: work_dir.unwrap_or_else(|| out_dir.clone()),
                banner_timeout: Duration::from_millis(
                    poll_ms.saturating_mul(u64::from(max_tries)),
                ),
            };
            let plan = DebugPlan {
                target: &target,
                report: &report,
                jdb_tasks: jdb_tasks.as_deref(),
                gdb_tasks: gdb_tasks.as_deref(),
                original_jar: original_jar.as_deref(),
                out_dir: &out_dir,
                limit,
                budget,
            };
            run_debug(config, &plan, output, telemetry)
        }
    }
}

fn run_select(coverage: &Path, output: Option<&Path>) -> Result<()> {
    let candidates: Vec<ScoredMethod> = read_json(coverage)?;
    let selection = select_target(&candidates)?;
    write_json(
        output,
        &SelectionReport {
            target: selection.method.method,
            score: selection.score,
            candidates: candidates.len(),
        },
    )
}

fn run_instrument(
    jar: &Path,
    target: &Path,
    out_jar: &Path,
    classpath: &[PathBuf],
    output: Option<&Path>,
    telemetry: Option<&Telemetry>,
) -> Result<()> {
    let requested: MethodRef = read_json(target)?;
    let classes = ClassSet::load(jar, telemetry)?;
    let extra = classpath
        .iter()
        .map(|path| ClassSet::load(path, telemetry))
        .collect::<Result<Vec<_>>>()?;
    let extra_refs: Vec<&ClassSet> = extra.iter().collect();
    let hierarchy = classes.symbol_table(&extra_refs);
    let instrumentation = instrument(&classes, &requested, &hierarchy, telemetry)?;
    write_output(classes.source(), &instrumentation.replacements, out_jar)?;
    info!(
        "injected failure into {} and wrote {}",
        instrumentation.target,
        out_jar.display()
    );
    write_json(
        output,
        &InstrumentReport {
            target: instrumentation.target,
            requested,
            rewritten: instrumentation.replacements.keys().cloned().collect(),
            verifier_fallbacks: hierarchy
                .fallbacks()
                .into_iter()
                .map(|(first, second)| VerifierFallback { first, second })
                .collect(),
            output: out_jar.to_path_buf(),
        },
    )
}

fn run_curate(
    jar: &Path,
    report: &Path,
    out_jar: &Path,
    disable: Disable,
    require_all: bool,
    output: Option<&Path>,
    telemetry: Option<&Telemetry>,
) -> Result<()> {
    let test_report: TestReport = read_json(report)?;
    let classes = ClassSet::load(jar, telemetry)?;
    let curation = curate(&classes, &test_report, disable, require_all, telemetry)?;
    write_output(classes.source(), &curation.replacements, out_jar)?;
    info!(
        "kept {} tests, disabled {} classes of tests",
        curation.kept.len(),
        curation.excluded.len() + curation.excluded_classes.len()
    );
    write_json(
        output,
        &CurationReport {
            disabled: disable,
            kept: curation.kept,
            excluded: curation.excluded,
            excluded_classes: curation.excluded_classes,
            passes: curation.passes,
            rewritten: curation.replacements.keys().cloned().collect(),
            output: out_jar.to_path_buf(),
        },
    )
}

struct DebugPlan<'a> {
    target: &'a Path,
    report: &'a Path,
    jdb_tasks: Option<&'a Path>,
    gdb_tasks: Option<&'a Path>,
    original_jar: Option<&'a Path>,
    out_dir: &'a Path,
    limit: usize,
    budget: PollBudget,
}

fn run_debug(
    config: LaunchConfig,
    plan: &DebugPlan<'_>,
    output: Option<&Path>,
    telemetry: Option<&Telemetry>,
) -> Result<()> {
    if plan.jdb_tasks.is_none() && plan.gdb_tasks.is_none() {
        return Err(RunError::IllegalInput(
            "at least one of --jdb-tasks and --gdb-tasks is required".to_string(),
        )
        .into());
    }
    let target: MethodRef = read_json(plan.target)?;
    let test_report: TestReport = read_json(plan.report)?;
    let tests = debuggable_tests(&config.tests_jar, &test_report, plan.limit, telemetry)?;
    let bindings = TargetBindings::for_target(&target)?;

    let original = plan.original_jar.map(|jar| {
        ProcessLauncher::new(LaunchConfig {
            target_jar: jar.to_path_buf(),
            ..config.clone()
        })
    });
    let launcher = ProcessLauncher::new(config);
    let baseline_dir = plan.out_dir.join(BASELINE_DIR);
    let mut trials = Vec::new();
    for (transport, path) in [
        (Transport::Jdb, plan.jdb_tasks),
        (Transport::Gdb, plan.gdb_tasks),
    ] {
        let Some(path) = path else {
            continue;
        };
        let mut tasks = load_tasks(path, &bindings, transport)?;
        let mut protected = run_trials(
            &launcher,
            transport,
            &mut tasks,
            &tests,
            plan.out_dir,
            plan.budget,
            telemetry,
        )?;
        if let Some(original) = &original {
            let baseline = run_trials(
                original,
                transport,
                &mut tasks,
                &tests,
                &baseline_dir,
                plan.budget,
                telemetry,
            )?;
            attach_baseline(&mut protected, baseline);
        }
        trials.extend(protected);
    }
    write_json(output, &DebugReport::new(target, &tests, trials))
}

/// Failed tests with their defining classes resolved, the first `limit` in report order.
fn debuggable_tests(
    tests_jar: &Path,
    report: &TestReport,
    limit: usize,
    telemetry: Option<&Telemetry>,
) -> Result<Vec<TestCase>> {
    let relevant = report.relevant();
    if relevant.is_empty() {
        return Err(RunError::NoRelevantTests.into());
    }
    let classes = ClassSet::load(tests_jar, telemetry)
        .with_context(|| format!("failed to scan tests jar {}", tests_jar.display()))?;
    let resolution = resolve(group_by_class(&relevant), &classes, false, telemetry)?;
    let resolved = resolution.mapping.into_values().flatten().collect();
    Ok(first_in_report_order(&relevant, resolved, limit))
}

fn first_in_report_order(
    reported: &[TestCase],
    mut resolved: Vec<TestCase>,
    limit: usize,
) -> Vec<TestCase> {
    resolved.sort_by_cached_key(|test| {
        let as_reported =
            MethodRef::new(test.launch_class(), &test.method.name, &test.method.descriptor);
        reported
            .iter()
            .position(|candidate| candidate.method == as_reported)
            .unwrap_or(usize::MAX)
    });
    if resolved.len() > limit {
        info!("debugging the first {limit} of {} relevant tests", resolved.len());
        resolved.truncate(limit);
    }
    resolved
}
