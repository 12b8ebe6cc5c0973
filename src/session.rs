//! Sessions: one running counterpart command and its three byte streams
//!
//! The secure transport is not implemented here. An [`Executor`] turns a
//! command line into a [`RemoteProcess`]; the stock executors shell out to the
//! system `ssh` client or to `sh -c` for the local machine.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Result, TransferError};
use crate::protocol::REMOTE_ERROR_PREFIX;

/// How many trailing error-stream lines are kept for error reports
const STDERR_TAIL: usize = 8;
/// How long a failing session may take to deliver its last error lines
const DRAIN_SETTLE: Duration = Duration::from_millis(500);

/// Lifecycle control over a started counterpart.
pub trait RemoteHandle: Send {
    /// Ask the counterpart to terminate.
    fn signal(&mut self) -> io::Result<()>;
    /// Block until the counterpart exits. A failing exit is a `Remote` error.
    fn wait(&mut self) -> Result<()>;
    /// Release the counterpart. An already exited process is not an error.
    fn close(&mut self) -> io::Result<()>;
}

/// Raw streams and handle of a started counterpart.
pub struct RemoteProcess {
    pub stdin: Box<dyn Write + Send>,
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Box<dyn Read + Send>,
    pub handle: Box<dyn RemoteHandle>,
}

/// The remote execution capability consumed by sessions.
pub trait Executor: Send + Sync {
    fn execute(&self, command: &str) -> Result<RemoteProcess>;
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, command: &str) -> Result<RemoteProcess> {
        (**self).execute(command)
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, command: &str) -> Result<RemoteProcess> {
        (**self).execute(command)
    }
}

/// A running command with input, output and error streams.
///
/// The error stream is drained on a background thread from the moment the
/// session starts, so a chatty counterpart can never stall on a full pipe.
pub struct Session {
    command: String,
    input: Option<Box<dyn Write + Send>>,
    output: BufReader<Box<dyn Read + Send>>,
    handle: Box<dyn RemoteHandle>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    drain: Option<JoinHandle<()>>,
    finished: bool,
}

impl Session {
    pub fn start<E: Executor + ?Sized>(executor: &E, command: &str) -> Result<Session> {
        debug!("starting session: {}", command);
        let proc = executor.execute(command)?;
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
        let drain = spawn_drain(proc.stderr, Arc::clone(&stderr_tail));
        Ok(Session {
            command: command.to_string(),
            input: Some(proc.stdin),
            output: BufReader::new(proc.stdout),
            handle: proc.handle,
            stderr_tail,
            drain,
            finished: false,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Input sink. Fails once the input was closed.
    pub fn input(&mut self) -> Result<&mut (dyn Write + Send + 'static)> {
        match self.input.as_mut() {
            Some(w) => Ok(w.as_mut()),
            None => Err(TransferError::io(
                "write session input",
                io::Error::new(io::ErrorKind::BrokenPipe, "input already closed"),
            )),
        }
    }

    /// Buffered output source. Also usable as `BufRead` for framed replies.
    pub fn output(&mut self) -> &mut BufReader<Box<dyn Read + Send>> {
        &mut self.output
    }

    /// Flush and close the input sink; the counterpart sees end-of-stream.
    pub fn close_input(&mut self) -> Result<()> {
        if let Some(mut w) = self.input.take() {
            match w.flush() {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(TransferError::io("flush session input", e)),
            }
        }
        Ok(())
    }

    /// Close the input and wait for a clean exit of the counterpart.
    pub fn wait(mut self) -> Result<()> {
        let closed = self.close_input();
        let status = self.handle.wait();
        self.finished = true;
        self.settle_drain(DRAIN_SETTLE);
        match status {
            Ok(()) => closed,
            Err(TransferError::Remote(msg)) => Err(TransferError::Remote(self.describe_failure(&msg))),
            Err(e) => Err(e),
        }
    }

    /// Signal the counterpart and release every handle.
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Stop the session after a local failure and pick the better error.
    ///
    /// A counterpart that died early shows up locally as a truncated stream;
    /// its own `error:` line explains the failure far better.
    pub fn fail(mut self, err: TransferError) -> TransferError {
        self.shutdown();
        self.settle_drain(DRAIN_SETTLE);
        self.blame(err)
    }

    /// Attribute a broken stream to the counterpart when it reported an error.
    ///
    /// Only lines carrying [`REMOTE_ERROR_PREFIX`] count; warnings and other
    /// chatter on the error stream leave `err` untouched.
    pub fn blame(&self, err: TransferError) -> TransferError {
        let stream_broke = err.is_disconnect() || matches!(err, TransferError::Protocol(_));
        if !stream_broke {
            return err;
        }
        let reported = self
            .stderr_tail
            .lock()
            .iter()
            .rev()
            .find(|line| line.starts_with(REMOTE_ERROR_PREFIX))
            .cloned();
        match reported {
            Some(line) => TransferError::Remote(format!("{} ({})", line, err)),
            None => err,
        }
    }

    /// Last lines the counterpart wrote to its error stream.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().iter().cloned().collect()
    }

    /// Fold the counterpart's last complaint into an error message.
    pub fn describe_failure(&self, msg: &str) -> String {
        match self.stderr_tail.lock().back() {
            Some(line) => format!("{} ({})", msg, line),
            None => msg.to_string(),
        }
    }

    fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.handle.signal() {
            debug!("signal `{}`: {}", self.command, e);
        }
        self.input = None;
        self.output = BufReader::new(Box::new(io::empty()));
        if let Err(e) = self.handle.close() {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                warn!("error when closing session `{}`: {}", self.command, e);
            }
        }
    }

    // The drain thread ends on its own once the error stream closes; only
    // wait a bounded time for it.
    fn settle_drain(&mut self, limit: Duration) {
        let deadline = Instant::now() + limit;
        while let Some(handle) = self.drain.as_ref() {
            if handle.is_finished() {
                self.join_drain();
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn join_drain(&mut self) {
        if let Some(handle) = self.drain.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_drain(
    stderr: Box<dyn Read + Send>,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("session-stderr".into())
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line).trim_end().to_string();
                        if text.is_empty() {
                            continue;
                        }
                        warn!("remote: {}", text);
                        let mut t = tail.lock();
                        if t.len() == STDERR_TAIL {
                            t.pop_front();
                        }
                        t.push_back(text);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("error stream closed: {}", e);
                        break;
                    }
                }
            }
        });
    match spawned {
        Ok(h) => Some(h),
        Err(e) => {
            warn!("could not start error-stream drain: {}", e);
            None
        }
    }
}

/// Target of an ssh connection, parsed from `[user@]host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl HostSpec {
    pub fn parse(s: &str) -> Result<HostSpec> {
        let s = s.trim();
        let (user, rest) = match s.rsplit_once('@') {
            Some((u, r)) if !u.is_empty() => (Some(u.to_string()), r),
            Some((_, r)) => (None, r),
            None => (None, s),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| TransferError::protocol(format!("invalid port in {:?}", s)))?;
                (h, Some(port))
            }
            _ => (rest, None),
        };
        if host.is_empty() {
            return Err(TransferError::protocol(format!(
                "could not parse connection string {:?}",
                s
            )));
        }
        Ok(HostSpec {
            user,
            host: host.to_string(),
            port,
        })
    }
}

/// Runs each command as a local child process, optionally through ssh.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: OsString,
    args: Vec<OsString>,
}

impl ProcessExecutor {
    /// Commands run through `sh -c` on this machine.
    pub fn local() -> Self {
        Self {
            program: "sh".into(),
            args: vec!["-c".into()],
        }
    }

    /// Commands run on `target` through the OpenSSH client.
    pub fn ssh(target: &HostSpec, ssh_program: &str, options: &[String]) -> Self {
        let mut args: Vec<OsString> = vec!["-T".into()];
        if let Some(port) = target.port {
            args.push("-p".into());
            args.push(port.to_string().into());
        }
        if let Some(user) = &target.user {
            args.push("-l".into());
            args.push(user.into());
        }
        for opt in options {
            args.push("-o".into());
            args.push(opt.into());
        }
        args.push(target.host.clone().into());
        args.push("--".into());
        Self {
            program: ssh_program.into(),
            args,
        }
    }

    /// Full argv that would run `command`
    pub fn argv(&self, command: &str) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv.push(command.into());
        argv
    }
}

impl Executor for ProcessExecutor {
    fn execute(&self, command: &str) -> Result<RemoteProcess> {
        let spawn_err = |source: io::Error| TransferError::Spawn {
            command: command.to_string(),
            source,
        };
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;
        let missing = || io::Error::new(io::ErrorKind::Other, "child stdio not captured");
        let stdin = child.stdin.take().ok_or_else(missing).map_err(spawn_err)?;
        let stdout = child.stdout.take().ok_or_else(missing).map_err(spawn_err)?;
        let stderr = child.stderr.take().ok_or_else(missing).map_err(spawn_err)?;
        Ok(RemoteProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            handle: Box::new(ChildHandle { child }),
        })
    }
}

struct ChildHandle {
    child: Child,
}

impl RemoteHandle for ChildHandle {
    #[cfg(unix)]
    fn signal(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = self.child.id() as libc::pid_t;
        // SAFETY: kill(2) with a pid we spawned and have not reaped yet
        let r = unsafe { libc::kill(pid, libc::SIGTERM) };
        if r != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn signal(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e),
            _ => Ok(()),
        }
    }

    fn wait(&mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .map_err(|e| TransferError::io("wait for remote command", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(TransferError::Remote(format!("exited with {}", status)))
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_none() {
            match self.child.kill() {
                Err(e) if e.kind() != io::ErrorKind::InvalidInput => return Err(e),
                _ => {}
            }
        }
        self.child.wait().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_core::TransferBody;

    #[test]
    fn host_spec_forms() {
        assert_eq!(
            HostSpec::parse("alice@example.org:2222").unwrap(),
            HostSpec {
                user: Some("alice".into()),
                host: "example.org".into(),
                port: Some(2222)
            }
        );
        let h = HostSpec::parse("box").unwrap();
        assert_eq!(h.user, None);
        assert_eq!(h.port, None);
        assert!(HostSpec::parse("bob@").is_err());
        assert!(HostSpec::parse("h:99999").is_err());
    }

    #[test]
    fn ssh_argv_layout() {
        let spec = HostSpec::parse("carol@host:22").unwrap();
        let exec = ProcessExecutor::ssh(&spec, "ssh", &["BatchMode=yes".to_string()]);
        let argv: Vec<String> = exec
            .argv("skiff _present '/tmp'")
            .into_iter()
            .map(|s| s.into_string().unwrap())
            .collect();
        assert_eq!(
            argv,
            vec![
                "ssh", "-T", "-p", "22", "-l", "carol", "-o", "BatchMode=yes", "host", "--",
                "skiff _present '/tmp'"
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn local_session_round_trip() {
        let exec = ProcessExecutor::local();
        let mut session = Session::start(&exec, "echo oops >&2; cat").unwrap();
        session.input().unwrap().write_all(b"ping").unwrap();
        session.close_input().unwrap();
        let mut out = String::new();
        session.output().read_to_string(&mut out).unwrap();
        assert_eq!(out, "ping");
        session.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_remote_error() {
        let exec = ProcessExecutor::local();
        let session = Session::start(&exec, "echo 'no such file' >&2; exit 3").unwrap();
        let err = session.wait().unwrap_err();
        match err {
            TransferError::Remote(msg) => assert!(msg.contains("no such file"), "{msg}"),
            other => panic!("unexpected {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn stop_terminates_a_blocked_command() {
        let exec = ProcessExecutor::local();
        let session = Session::start(&exec, "sleep 30").unwrap();
        let started = std::time::Instant::now();
        session.stop();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn fail_prefers_the_remote_error_line() {
        let exec = ProcessExecutor::local();
        let mut session = Session::start(&exec, "echo 'error: open /nope' >&2; echo 'bye' >&2; exit 1").unwrap();
        let mut buf = Vec::new();
        session.output().read_to_end(&mut buf).unwrap();
        let local = TransferError::protocol("stream ended before flags byte was received");
        match session.fail(local) {
            TransferError::Remote(msg) => {
                assert!(msg.starts_with("error: open /nope"), "{msg}");
                assert!(msg.contains("flags byte"), "{msg}");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn remote_warnings_do_not_hide_a_local_protocol_error() {
        let exec = ProcessExecutor::local();
        let mut session =
            Session::start(&exec, r"echo 'WARN skipping special file /dev/x' >&2; printf '\200'").unwrap();
        let err = match TransferBody::read_header(session.output()) {
            Err(e) => e,
            Ok(body) => panic!("unexpected header {body:?}"),
        };
        match session.fail(err) {
            TransferError::Protocol(msg) => assert!(msg.contains("0x80"), "{msg}"),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn spawn_failure_is_spawn_error() {
        let exec = ProcessExecutor {
            program: "/nonexistent/skiff-test-binary".into(),
            args: vec![],
        };
        let err = Session::start(&exec, "x").err().unwrap();
        assert!(matches!(err, TransferError::Spawn { .. }));
    }
}
