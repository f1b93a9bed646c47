use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::transport::{DebuggerChannel, Poll};
use super::{DebuggingTask, DebuggingTaskUnit};

/// Wall-clock ceiling for one unit: `max_tries` waits of `quantum` each.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PollBudget {
    quantum: Duration,
    max_tries: u32,
}

impl PollBudget {
    pub(crate) fn new(quantum: Duration, max_tries: u32) -> Self {
        Self { quantum, max_tries }
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self::new(Duration::from_millis(20), 2500)
    }
}

/// Run the units of `task` in order, stopping at the first one that fails.
pub(crate) fn run_task<C, W>(
    channel: &mut C,
    task: &mut DebuggingTask,
    test_id: &str,
    budget: PollBudget,
    transcript: &mut W,
) -> Result<bool>
where
    C: DebuggerChannel + ?Sized,
    W: Write,
{
    task.reset();
    while let Some(unit) = task.next_unit() {
        let unit = unit.bind_test(test_id);
        debug!(
            "next unit: input {:?}, expected output {:?}, repeat until {:?}",
            unit.command_input, unit.expected_output, unit.repeat_until
        );
        if !run_unit(channel, &unit, budget, transcript)? {
            warn!(
                "task {} on {}: expected output {:?} not seen",
                task.name(),
                test_id,
                unit.expected_output
            );
            transcript.flush().context("failed to flush transcript")?;
            return Ok(false);
        }
    }
    transcript.flush().context("failed to flush transcript")?;
    Ok(true)
}

/// Send the unit's command and wait for its expected output.
pub(crate) fn run_unit<C, W>(
    channel: &mut C,
    unit: &DebuggingTaskUnit,
    budget: PollBudget,
    transcript: &mut W,
) -> Result<bool>
where
    C: DebuggerChannel + ?Sized,
    W: Write,
{
    match &unit.command_input {
        Some(command) => {
            if !send(channel, command, transcript)? {
                return Ok(false);
            }
        }
        None => log(transcript, "\n[LOG] command is null\n")?,
    }
    match &unit.expected_output {
        Some(expected) => log(
            transcript,
            &format!("\n[LOG] expected output is: \"{expected}\"\n"),
        )?,
        None => log(transcript, "\n[LOG] expected output is null\n")?,
    }
    match &unit.repeat_until {
        Some(repeat) => log(transcript, &format!("\n[LOG] repeat until is: \"{repeat}\"\n"))?,
        None => log(transcript, "\n[LOG] repeat until is null\n")?,
    }

    let expected = unit.expected_output.as_deref().map(str::to_lowercase);
    let repeat = unit.repeat_until.as_deref().map(str::to_lowercase);
    if expected.is_none() && repeat.is_none() {
        return Ok(true);
    }

    let mut stream = Utf8Stream::default();
    let mut line = LineBuffer::default();
    let mut tries = 0;
    while tries < budget.max_tries {
        tries += 1;
        let chunk = match channel.poll(budget.quantum)? {
            Poll::Data(chunk) => chunk,
            Poll::Empty => continue,
            Poll::Closed => break,
        };
        for ch in stream.decode(&chunk).chars() {
            line.push(ch);
            let mut written = false;
            if expected.as_deref().is_some_and(|needle| line.contains(needle)) {
                if repeat.is_none() {
                    log(transcript, &line.text)?;
                    return Ok(true);
                }
                tries = 0;
                if let Some(command) = &unit.command_input {
                    log(
                        transcript,
                        "\n[LOG] repeatUntil is not null, so repeat the command\n",
                    )?;
                    if !send(channel, command, transcript)? {
                        return Ok(false);
                    }
                }
                log(transcript, &line.text)?;
                written = true;
            }
            if repeat.as_deref().is_some_and(|needle| line.contains(needle)) {
                if !written {
                    log(transcript, &line.text)?;
                }
                return Ok(true);
            }
            if written || ch == '\n' {
                if !written {
                    log(transcript, &line.text)?;
                }
                line.clear();
            }
        }
    }
    log(transcript, &line.text)?;
    Ok(false)
}

/// Current output line with a lowercase copy kept in step for matching.
#[derive(Debug, Default)]
struct LineBuffer {
    text: String,
    lowered: String,
}

impl LineBuffer {
    fn push(&mut self, ch: char) {
        self.text.push(ch);
        self.lowered.extend(ch.to_lowercase());
    }

    /// `needle` must already be lowercase.
    fn contains(&self, needle: &str) -> bool {
        self.lowered.contains(needle)
    }

    fn clear(&mut self) {
        self.text.clear();
        self.lowered.clear();
    }
}

/// UTF-8 decoder for output whose reads may split a character.
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    /// Decode what `chunk` completes; an unfinished trailing sequence waits
    /// for the next chunk and invalid bytes become U+FFFD.
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut decoded = String::new();
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    start = self.pending.len();
                }
                Err(err) => {
                    let valid_end = start + err.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match err.error_len() {
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        decoded
    }
}

/// Write a command line; a debugger that stopped reading fails the unit.
fn send<C, W>(channel: &mut C, command: &str, transcript: &mut W) -> Result<bool>
where
    C: DebuggerChannel + ?Sized,
    W: Write,
{
    if let Err(err) = channel.send_line(command) {
        warn!("debugger rejected command {command:?}: {err:#}");
        log(transcript, &format!("\n[LOG] command could not be sent: \"{command}\"\n"))?;
        return Ok(false);
    }
    log(transcript, &format!("\n[LOG] command sent is: \"{command}\"\n"))
        .map(|()| true)
}

fn log<W: Write>(transcript: &mut W, text: &str) -> Result<()> {
    transcript
        .write_all(text.as_bytes())
        .context("failed to write transcript")
}
