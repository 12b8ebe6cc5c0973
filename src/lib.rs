//! skiff: resumable file and directory copies over ssh
//!
//! The client starts a counterpart `skiff` command on the remote host and
//! talks to it over the command's stdin and stdout:
//! - single files travel as a small header plus a raw or gzip body
//! - directories and multi-path sets travel as one tar+gzip stream
//! - interrupted downloads resume from `.partial` files and `.progress` markers
//! - a browse sub-protocol lists and walks remote directories

pub mod browse;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod links;
pub mod logger;
pub mod loopback;
pub mod pick;
pub mod pipe;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod resume;
pub mod serve;
pub mod session;
pub mod tar_stream;
pub mod transfer;

pub use browse::BrowseSession;
pub use client::{download, upload, DownloadHandle, TransferOptions, TransferSummary};
pub use error::{Result, TransferError};
pub use protocol_core::{DirEntry, TransferBody};
pub use session::{Executor, ProcessExecutor, Session};
