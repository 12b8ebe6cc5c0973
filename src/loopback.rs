//! In-process executor
//!
//! Parses the command line it is given back into a [`RemoteCommand`] and runs
//! the counterpart handler on a thread, connected through in-memory pipes.
//! Behaves like a process that prints `error: ...` and exits 1 on failure.

use log::debug;
use std::io::{self, BufReader, Write};
use std::thread::{self, JoinHandle};

use crate::cli::RemoteCommand;
use crate::error::{Result, TransferError};
use crate::protocol::REMOTE_ERROR_PREFIX;
use crate::pipe::{pipe, pipe_with_interrupt, Interrupt, PipeConfig};
use crate::serve::dispatch;
use crate::session::{Executor, RemoteHandle, RemoteProcess};

#[derive(Debug, Clone, Default)]
pub struct LoopbackExecutor {
    config: PipeConfig,
}

impl LoopbackExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: PipeConfig) -> Self {
        Self { config }
    }
}

impl Executor for LoopbackExecutor {
    fn execute(&self, command: &str) -> Result<RemoteProcess> {
        let remote = RemoteCommand::parse_command_line(command).map_err(|e| TransferError::Spawn {
            command: command.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
        })?;
        let interrupt = Interrupt::default();
        let (stdin_w, stdin_r) = pipe_with_interrupt(&self.config, interrupt.clone());
        let (stdout_w, stdout_r) = pipe(&self.config);
        let (stderr_w, stderr_r) = pipe(&self.config);

        let thread = thread::Builder::new()
            .name("loopback-remote".into())
            .spawn(move || {
                let mut input = BufReader::new(stdin_r);
                let mut output = stdout_w;
                let mut stderr = stderr_w;
                let res = dispatch(&remote, &mut input, &mut output)
                    .and_then(|()| output.flush().map_err(TransferError::from));
                match res {
                    Ok(()) => 0,
                    Err(e) => {
                        debug!("loopback command failed: {}", e);
                        let _ = writeln!(stderr, "{}{}", REMOTE_ERROR_PREFIX, e);
                        let _ = stderr.flush();
                        1
                    }
                }
            })
            .map_err(|source| TransferError::Spawn {
                command: command.to_string(),
                source,
            })?;

        Ok(RemoteProcess {
            stdin: Box::new(stdin_w),
            stdout: Box::new(stdout_r),
            stderr: Box::new(stderr_r),
            handle: Box::new(LoopbackHandle {
                interrupt,
                thread: Some(thread),
                status: None,
            }),
        })
    }
}

struct LoopbackHandle {
    interrupt: Interrupt,
    thread: Option<JoinHandle<i32>>,
    status: Option<i32>,
}

impl LoopbackHandle {
    fn reap(&mut self) -> i32 {
        if let Some(t) = self.thread.take() {
            // a panicking handler counts as a crashed process
            self.status = Some(t.join().unwrap_or(101));
        }
        self.status.unwrap_or(0)
    }
}

impl RemoteHandle for LoopbackHandle {
    fn signal(&mut self) -> io::Result<()> {
        self.interrupt.raise();
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        match self.reap() {
            0 => Ok(()),
            code => Err(TransferError::Remote(format!("exit status: {}", code))),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.interrupt.raise();
        self.reap();
        Ok(())
    }
}
