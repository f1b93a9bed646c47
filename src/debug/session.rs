use std::env;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::transport::{DebuggerChannel, Poll, ProcessChannel};
use super::{Launcher, Transport};
use crate::error::RunError;
use crate::ir::TestCase;

/// First line a suspended debuggee prints, followed by its port.
pub(crate) const BANNER_PREFIX: &str = "Listening for transport dt_socket at address:";
pub(crate) const JDWP_AGENT: &str = "-agentlib:jdwp=transport=dt_socket,server=y,suspend=y";

/// Port announced by the debug agent banner.
pub(crate) fn parse_banner(line: &str) -> Result<u16, RunError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let unexpected = || RunError::UnexpectedDebuggeeOutput(line.to_string());
    let (prefix, port) = line.rsplit_once(' ').ok_or_else(unexpected)?;
    if !prefix.eq_ignore_ascii_case(BANNER_PREFIX) {
        return Err(unexpected());
    }
    port.parse::<u16>().map_err(|_| unexpected())
}

/// Programs and paths used to start the debuggee and its debugger.
#[derive(Clone, Debug)]
pub(crate) struct LaunchConfig {
    pub(crate) java: PathBuf,
    pub(crate) jdb: PathBuf,
    pub(crate) gdb: PathBuf,
    /// Console launcher jar that runs a single selected test.
    pub(crate) runner: PathBuf,
    pub(crate) tests_jar: PathBuf,
    pub(crate) target_jar: PathBuf,
    pub(crate) native_lib_dir: Option<PathBuf>,
    pub(crate) work_dir: PathBuf,
    pub(crate) banner_timeout: Duration,
}

impl LaunchConfig {
    fn runner_args(&self, test: &TestCase) -> Result<Vec<OsString>> {
        let class_path = env::join_paths([&self.tests_jar, &self.target_jar])
            .context("failed to build runner class path")?;
        let mut args = Vec::new();
        if let Some(dir) = &self.native_lib_dir {
            let mut property = OsString::from("-Djava.library.path=");
            property.push(dir);
            args.push(property);
        }
        args.push(OsString::from("-jar"));
        args.push(self.runner.clone().into_os_string());
        args.push(OsString::from("--class-path"));
        args.push(class_path);
        args.push(OsString::from("--select-method"));
        args.push(OsString::from(format!(
            "{}#{}",
            test.launch_class(),
            test.method.name
        )));
        Ok(args)
    }

    /// Suspended debuggee waiting for a debugger to attach.
    pub(crate) fn debuggee_command(&self, test: &TestCase) -> Result<Command> {
        let mut command = Command::new(&self.java);
        command
            .arg(JDWP_AGENT)
            .args(self.runner_args(test)?)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(command)
    }

    pub(crate) fn attach_command(&self, port: u16) -> Command {
        let mut command = Command::new(&self.jdb);
        command.arg("-attach").arg(port.to_string());
        self.debugger_stdio(&mut command);
        command
    }

    /// Native debugger wrapping the whole runtime command line.
    pub(crate) fn native_command(&self, test: &TestCase) -> Result<Command> {
        let mut command = Command::new(&self.gdb);
        command
            .arg("--args")
            .arg(&self.java)
            .args(self.runner_args(test)?);
        self.debugger_stdio(&mut command);
        Ok(command)
    }

    fn debugger_stdio(&self, command: &mut Command) {
        command
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
    }
}

/// Kills and reaps the child when dropped.
struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn(command: &mut Command) -> Result<ChildGuard> {
    let program = command.get_program().to_string_lossy().into_owned();
    debug!("executing {command:?}");
    match command.spawn() {
        Ok(child) => Ok(ChildGuard(child)),
        Err(source) => Err(RunError::SpawnFailure { program, source }.into()),
    }
}

fn drain<R: Read + Send + 'static>(mut stream: R) {
    thread::spawn(move || {
        let _ = io::copy(&mut stream, &mut io::sink());
    });
}

/// Read the debuggee's first line, then keep draining its output.
fn await_banner(stdout: ChildStdout, timeout: Duration) -> Result<u16> {
    let (sender, receiver) = mpsc::channel::<io::Result<String>>();
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        let first = reader.read_line(&mut line).map(|_| line);
        if sender.send(first).is_err() {
            return;
        }
        let _ = io::copy(&mut reader, &mut io::sink());
    });
    let line = match receiver.recv_timeout(timeout) {
        Ok(line) => line.context("failed to read debuggee output")?,
        Err(RecvTimeoutError::Timeout) => {
            return Err(RunError::UnexpectedDebuggeeOutput(format!(
                "no banner within {timeout:?}"
            ))
            .into());
        }
        Err(RecvTimeoutError::Disconnected) => {
            return Err(RunError::Interrupted("debuggee banner reader stopped".to_string()).into());
        }
    };
    Ok(parse_banner(&line)?)
}

fn open_channel(child: &mut Child) -> Result<ProcessChannel> {
    let stdin = child.stdin.take().context("debugger stdin not captured")?;
    let mut streams: Vec<Box<dyn Read + Send>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        streams.push(Box::new(stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        streams.push(Box::new(stderr));
    }
    Ok(ProcessChannel::new(stdin, streams))
}

/// Live debugger plus the processes it owns for one trial.
pub(crate) struct Session {
    channel: ProcessChannel,
    // Dropped after the channel so the debugger sees its input close first.
    _children: Vec<ChildGuard>,
}

impl Session {
    /// Suspended debuggee plus a Java debugger attached to its announced port.
    pub(crate) fn managed(config: &LaunchConfig, test: &TestCase) -> Result<Self> {
        let mut debuggee = spawn(&mut config.debuggee_command(test)?)?;
        let stdout = debuggee
            .0
            .stdout
            .take()
            .context("debuggee stdout not captured")?;
        if let Some(stderr) = debuggee.0.stderr.take() {
            drain(stderr);
        }
        let port = await_banner(stdout, config.banner_timeout)?;
        info!("attaching debugger to port {port}");
        let mut debugger = spawn(&mut config.attach_command(port))?;
        let channel = open_channel(&mut debugger.0)?;
        Ok(Self {
            channel,
            _children: vec![debugger, debuggee],
        })
    }

    pub(crate) fn native(config: &LaunchConfig, test: &TestCase) -> Result<Self> {
        let mut debugger = spawn(&mut config.native_command(test)?)?;
        let channel = open_channel(&mut debugger.0)?;
        Ok(Self {
            channel,
            _children: vec![debugger],
        })
    }
}

impl DebuggerChannel for Session {
    fn send_line(&mut self, line: &str) -> Result<()> {
        self.channel.send_line(line)
    }

    fn poll(&mut self, timeout: Duration) -> Result<Poll> {
        self.channel.poll(timeout)
    }
}

/// Starts real debugger processes.
pub(crate) struct ProcessLauncher {
    config: LaunchConfig,
}

impl ProcessLauncher {
    pub(crate) fn new(config: LaunchConfig) -> Self {
        Self { config }
    }
}

impl Launcher for ProcessLauncher {
    type Session = Session;

    fn launch(&self, transport: Transport, test: &TestCase) -> Result<Session> {
        match transport {
            Transport::Jdb => Session::managed(&self.config, test),
            Transport::Gdb => Session::native(&self.config, test),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::exit_code_for;
    use crate::ir::{Framework, MethodRef, Outcome};

    fn config(java: &str) -> LaunchConfig {
        LaunchConfig {
            java: PathBuf::from(java),
            jdb: PathBuf::from("jdb"),
            gdb: PathBuf::from("gdb"),
            runner: PathBuf::from("console.jar"),
            tests_jar: PathBuf::from("tests.jar"),
            target_jar: PathBuf::from("target.jar"),
            native_lib_dir: None,
            work_dir: env::temp_dir(),
            banner_timeout: Duration::from_secs(10),
        }
    }

    fn test_case() -> TestCase {
        let mut test = TestCase {
            method: MethodRef::new("org.x.ChildTest", "adds", "()V"),
            outcome: Outcome::Failed,
            execution_time: 0.0,
            superclass_owner: None,
            reported_class: None,
            framework: Framework::Junit5,
        };
        test.move_to("org.x.BaseTest");
        test
    }

    fn args(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn banner_port_is_the_last_token() {
        assert_eq!(
            parse_banner("Listening for transport dt_socket at address: 40123\n").expect("port"),
            40123
        );
        assert_eq!(
            parse_banner("LISTENING FOR TRANSPORT DT_SOCKET AT ADDRESS: 5005").expect("port"),
            5005
        );
    }

    #[test]
    fn banner_without_port_is_fatal() {
        let err = parse_banner("Listening for transport dt_socket at address:")
            .expect_err("missing port");
        assert!(matches!(err, RunError::UnexpectedDebuggeeOutput(_)));
        assert_eq!(err.exit_code(), 9);
        assert!(parse_banner("Error: could not find main class").is_err());
        assert!(parse_banner("Listening for transport dt_socket at address: port").is_err());
    }

    #[test]
    fn debuggee_selects_the_reported_class() {
        let mut config = config("java");
        config.native_lib_dir = Some(PathBuf::from("/opt/native"));
        let command = config.debuggee_command(&test_case()).expect("command");
        assert_eq!(command.get_program(), "java");
        assert_eq!(
            args(&command),
            [
                JDWP_AGENT,
                "-Djava.library.path=/opt/native",
                "-jar",
                "console.jar",
                "--class-path",
                "tests.jar:target.jar",
                "--select-method",
                "org.x.ChildTest#adds",
            ]
        );
    }

    #[test]
    fn native_debugger_wraps_the_runtime() {
        let command = config("java").native_command(&test_case()).expect("command");
        assert_eq!(command.get_program(), "gdb");
        let native_args = args(&command);
        assert_eq!(native_args[..3], ["--args", "java", "-jar"]);
        assert_eq!(
            native_args.last().map(String::as_str),
            Some("org.x.ChildTest#adds")
        );
        assert_eq!(
            args(&config("java").attach_command(5005)),
            ["-attach", "5005"]
        );
    }

    #[test]
    fn missing_runtime_is_a_spawn_failure() {
        let config = config("/nonexistent/bin/java");
        let err = Session::managed(&config, &test_case())
            .err()
            .expect("spawn must fail");
        assert_eq!(exit_code_for(&err), 10);
    }

    #[cfg(unix)]
    #[test]
    fn foreign_first_line_aborts_the_session() {
        // `echo` prints its arguments instead of a banner.
        let err = Session::managed(&config("echo"), &test_case())
            .err()
            .expect("banner must not match");
        assert_eq!(exit_code_for(&err), 9);
    }
}
