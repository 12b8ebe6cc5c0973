//! Command-line interface
//!
//! One `Cli` value is parsed in `main`. The hidden subcommands are what the
//! client runs on the far side of the transport; [`RemoteCommand`] both parses
//! them and renders them back into a shell command line, so the two can not
//! disagree about flags or quoting.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::error::{Result, TransferError};

#[derive(Debug, Parser)]
#[command(
    name = "skiff",
    author,
    version,
    about = "Copy files and directories over ssh with resumable transfers"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every subcommand
#[derive(Clone, Debug, Args)]
pub struct GlobalOpts {
    /// Log debug diagnostics to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Append transfer events to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// Show a progress bar and per-entry lines
    #[arg(short, long, global = true)]
    pub progress: bool,

    /// Program to run on the remote host
    #[arg(short = 'e', long = "executable", global = true)]
    pub executable: Option<String>,

    /// ssh client to use
    #[arg(long = "ssh", global = true)]
    pub ssh: Option<String>,

    /// Extra ssh option, passed as `-o OPTION` (repeatable)
    #[arg(short = 'o', long = "ssh-option", action = ArgAction::Append, global = true)]
    pub ssh_options: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Copy remote files or directories to this machine
    Download(DownloadArgs),
    /// Copy a local file or directory to a remote host
    Upload(UploadArgs),
    /// Browse a remote directory interactively and fetch entries
    Pick(BrowseArgs),
    /// Print the contents of a remote directory
    List(ListArgs),
    #[command(flatten)]
    Remote(RemoteCommand),
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Remote host as [user@]host[:port]
    pub host: String,
    /// Remote paths to fetch
    #[arg(required = true)]
    pub sources: Vec<String>,
    /// Local destination (defaults to the source name, or `.` for several sources)
    #[arg(short, long)]
    pub destination: Option<PathBuf>,
    /// Send single files without compression
    #[arg(short, long)]
    pub uncompressed: bool,
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Local file or directory
    pub source: PathBuf,
    /// Remote host as [user@]host[:port]
    pub host: String,
    /// Remote destination path
    pub destination: String,
    /// Send single files without compression
    #[arg(short, long)]
    pub uncompressed: bool,
}

#[derive(Debug, Args)]
pub struct BrowseArgs {
    /// Remote host as [user@]host[:port]
    pub host: String,
    /// Remote directory to start in
    #[arg(short, long, default_value = ".")]
    pub location: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub browse: BrowseArgs,
    /// Print the listing as JSON
    #[arg(long)]
    pub json: bool,
}

/// Server-side entry points, started on the remote host by the client.
#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum RemoteCommand {
    /// Stream the given paths to stdout
    #[command(name = "_serve", hide = true)]
    Serve {
        #[arg(required = true)]
        sources: Vec<String>,
        #[arg(short, long)]
        uncompressed: bool,
        /// Start a single file at this byte offset
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Materialise a stream read from stdin at the destination
    #[command(name = "_receive", hide = true)]
    Receive {
        destination: String,
        /// File name to use when the destination is an existing directory
        #[arg(long)]
        name: Option<String>,
    },
    /// Answer browse commands read from stdin
    #[command(name = "_present", hide = true)]
    Present { location: String },
}

#[derive(Debug, Parser)]
#[command(name = "skiff")]
struct RemoteInvocation {
    #[command(subcommand)]
    command: RemoteCommand,
}

impl RemoteCommand {
    /// Render as a POSIX shell command line for `program`.
    pub fn to_command_line(&self, program: &str) -> String {
        let mut argv: Vec<String> = vec![program.to_string()];
        match self {
            RemoteCommand::Serve {
                sources,
                uncompressed,
                offset,
            } => {
                argv.push("_serve".into());
                if *uncompressed {
                    argv.push("--uncompressed".into());
                }
                if *offset > 0 {
                    argv.push("--offset".into());
                    argv.push(offset.to_string());
                }
                argv.push("--".into());
                argv.extend(sources.iter().cloned());
            }
            RemoteCommand::Receive { destination, name } => {
                argv.push("_receive".into());
                if let Some(name) = name {
                    argv.push("--name".into());
                    argv.push(name.clone());
                }
                argv.push("--".into());
                argv.push(destination.clone());
            }
            RemoteCommand::Present { location } => {
                argv.push("_present".into());
                argv.push("--".into());
                argv.push(location.clone());
            }
        }
        shell_words::join(argv)
    }

    /// Parse a full argv (program name first).
    pub fn parse_argv<I, T>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        RemoteInvocation::try_parse_from(argv)
            .map(|inv| inv.command)
            .map_err(|e| TransferError::protocol(format!("bad remote command: {}", e)))
    }

    /// Inverse of [`to_command_line`](Self::to_command_line).
    pub fn parse_command_line(line: &str) -> Result<Self> {
        let argv = shell_words::split(line)
            .map_err(|e| TransferError::protocol(format!("bad remote command line: {}", e)))?;
        Self::parse_argv(argv)
    }
}
