//! Interactive browse engine
//!
//! One long-lived presenter session answers `list` and `enter`; every
//! selected entry is fetched over its own serve session so bulk bytes never
//! share the control stream. Methods take `&mut self`, which keeps callers to
//! one request at a time.

use log::debug;
use std::io::{self, Write};
use std::sync::Arc;

use crate::cli::RemoteCommand;
use crate::client::{DownloadHandle, TransferOptions};
use crate::error::{IoContext, Result, TransferError};
use crate::protocol_core::{deserialize_listing, read_until_end_transmission, BrowseCommand, DirEntry};
use crate::session::{Executor, Session};

pub struct BrowseSession {
    executor: Arc<dyn Executor>,
    session: Session,
    current_path: String,
    opts: TransferOptions,
    /// Entries of `current_path` as last listed
    listing: Option<Vec<DirEntry>>,
}

impl BrowseSession {
    /// Start a presenter rooted at `location`.
    pub fn open(executor: Arc<dyn Executor>, location: &str, opts: TransferOptions) -> Result<Self> {
        let command = RemoteCommand::Present {
            location: location.to_string(),
        }
        .to_command_line(&opts.remote_program);
        let session = Session::start(executor.as_ref(), &command)?;
        Ok(Self {
            executor,
            session,
            current_path: location.to_string(),
            opts,
            listing: None,
        })
    }

    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    /// List the current directory.
    pub fn list(&mut self) -> Result<Vec<DirEntry>> {
        if let Err(e) = self.send(&BrowseCommand::ListFiles) {
            return Err(self.fail_now(e));
        }
        let entries = match read_until_end_transmission(self.session.output()) {
            Ok(raw) => deserialize_listing(&raw)?,
            Err(e) => return Err(self.fail_now(e)),
        };
        self.listing = Some(entries.clone());
        Ok(entries)
    }

    /// Move into `name`. No reply is awaited; the next `list` shows the result.
    ///
    /// The presenter silently stays put when `name` is not a directory, so
    /// once the current directory has been listed, names that are missing
    /// from that listing or are not directories are refused here and
    /// `current_path` is left alone. Before the first `list` the move is
    /// taken on trust.
    pub fn enter_directory(&mut self, name: &str) -> Result<()> {
        if name != ".." && !name.starts_with('/') {
            if let Some(entries) = &self.listing {
                match entries.iter().find(|e| e.name == name) {
                    Some(e) if e.is_dir() => {}
                    Some(_) => return Err(refused(name, "not a directory")),
                    None => return Err(refused(name, "no such entry")),
                }
            }
        }
        self.send(&BrowseCommand::Enter(name.to_string()))?;
        self.current_path = join_remote(&self.current_path, name);
        self.listing = None;
        Ok(())
    }

    /// Start fetching `name` on a dedicated session.
    pub fn select_file(&mut self, name: &str) -> Result<DownloadHandle> {
        let full = join_remote(&self.current_path, name);
        debug!("selecting {}", full);
        DownloadHandle::open(self.executor.as_ref(), &full, &self.opts)
    }

    /// Send `Quit` and tear the session down.
    pub fn stop(mut self) {
        if let Err(e) = self.send(&BrowseCommand::Quit) {
            debug!("quit not delivered: {}", e);
        }
        if let Err(e) = self.session.close_input() {
            debug!("closing browse input: {}", e);
        }
        self.session.stop();
    }

    fn send(&mut self, cmd: &BrowseCommand) -> Result<()> {
        let bytes = cmd.encode()?;
        let input = self.session.input()?;
        input.write_all(&bytes).io_context("send browse command")?;
        input.flush().io_context("send browse command")
    }

    fn fail_now(&mut self, err: TransferError) -> TransferError {
        self.session.blame(err)
    }
}

fn refused(name: &str, why: &str) -> TransferError {
    TransferError::io(
        format!("enter {}", name),
        io::Error::new(io::ErrorKind::NotFound, why.to_string()),
    )
}

/// Join remote path components with `/`, folding `..` where possible.
pub fn join_remote(base: &str, name: &str) -> String {
    if name.starts_with('/') {
        return name.to_string();
    }
    if name == ".." {
        let trimmed = base.trim_end_matches('/');
        return match trimmed.rsplit_once('/') {
            Some((parent, last)) if !last.is_empty() && last != ".." && last != "." => {
                if parent.is_empty() {
                    "/".to_string()
                } else {
                    parent.to_string()
                }
            }
            _ if trimmed.is_empty() => "/".to_string(),
            _ if trimmed == "." => "..".to_string(),
            _ if !trimmed.contains('/') && trimmed != ".." => ".".to_string(),
            _ => format!("{}/..", trimmed),
        };
    }
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}
