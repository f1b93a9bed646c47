use std::io::{self, Read, Write};
use std::process::ChildStdin;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

/// Result of waiting once for debugger output.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Poll {
    Data(Vec<u8>),
    /// Nothing arrived within the wait.
    Empty,
    /// The debugger closed its output streams.
    Closed,
}

/// Line-oriented command channel to a running debugger.
pub(crate) trait DebuggerChannel {
    fn send_line(&mut self, line: &str) -> Result<()>;

    /// Wait at most `timeout` for the next chunk of output.
    fn poll(&mut self, timeout: Duration) -> Result<Poll>;
}

/// Channel over a child process's pipes; output is pumped by reader threads.
pub(crate) struct ProcessChannel {
    stdin: ChildStdin,
    output: Receiver<Vec<u8>>,
}

impl ProcessChannel {
    pub(crate) fn new(stdin: ChildStdin, streams: Vec<Box<dyn Read + Send>>) -> Self {
        let (sender, output) = mpsc::channel();
        for stream in streams {
            let sender = sender.clone();
            thread::spawn(move || pump(stream, sender));
        }
        Self { stdin, output }
    }
}

impl DebuggerChannel for ProcessChannel {
    fn send_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.stdin, "{line}").context("failed to write debugger command")?;
        self.stdin.flush().context("failed to flush debugger command")
    }

    fn poll(&mut self, timeout: Duration) -> Result<Poll> {
        match self.output.recv_timeout(timeout) {
            Ok(chunk) => Ok(Poll::Data(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(Poll::Empty),
            Err(RecvTimeoutError::Disconnected) => Ok(Poll::Closed),
        }
    }
}

fn pump(mut stream: Box<dyn Read + Send>, sender: Sender<Vec<u8>>) {
    let mut buffer = [0u8; 4096];
    loop {
        match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => {
                if sender.send(buffer[..read].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory debugger: each poll yields the next scripted chunk, `""` is a quiet poll.
    pub(crate) struct ScriptedChannel {
        chunks: VecDeque<Vec<u8>>,
        closes: bool,
        pub(crate) sent: Vec<String>,
        pub(crate) polls: usize,
    }

    impl ScriptedChannel {
        pub(crate) fn new(chunks: &[&str]) -> Self {
            Self::from_bytes(chunks.iter().map(|chunk| chunk.as_bytes().to_vec()).collect())
        }

        /// Raw reads, for output that splits characters across chunks.
        pub(crate) fn from_bytes(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
                closes: false,
                sent: Vec::new(),
                polls: 0,
            }
        }

        /// Report a closed stream once the script runs out.
        pub(crate) fn closing(mut self) -> Self {
            self.closes = true;
            self
        }
    }

    impl DebuggerChannel for ScriptedChannel {
        fn send_line(&mut self, line: &str) -> Result<()> {
            self.sent.push(line.to_string());
            Ok(())
        }

        fn poll(&mut self, _timeout: Duration) -> Result<Poll> {
            self.polls += 1;
            match self.chunks.pop_front() {
                Some(chunk) if chunk.is_empty() => Ok(Poll::Empty),
                Some(chunk) => Ok(Poll::Data(chunk)),
                None if self.closes => Ok(Poll::Closed),
                None => Ok(Poll::Empty),
            }
        }
    }

    #[test]
    fn process_channel_pumps_child_output() {
        let mut child = std::process::Command::new("cat")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .expect("spawn cat");
        let stdin = child.stdin.take().expect("stdin");
        let stdout = child.stdout.take().expect("stdout");
        let streams: Vec<Box<dyn Read + Send>> = vec![Box::new(stdout)];
        let mut channel = ProcessChannel::new(stdin, streams);
        channel.send_line("hello").expect("send");
        let poll = channel.poll(Duration::from_secs(5)).expect("poll");
        assert_eq!(poll, Poll::Data(b"hello\n".to_vec()));
        drop(channel);
        child.wait().expect("wait");
    }
}
