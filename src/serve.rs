//! Counterpart-side handlers
//!
//! These run on the far end of a session, reading from its stdin and writing
//! to its stdout. Diagnostics go to stderr through `log`, where the client's
//! drain thread picks them up.

use log::{debug, warn};
use std::fs;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};

use crate::cli::RemoteCommand;
use crate::error::{IoContext, Result, TransferError};
use crate::progress::Reporter;
use crate::protocol_core::{
    posix_mode, serialize_listing, validate_name, BrowseCommand, DirEntry, TransferBody,
};
use crate::tar_stream::{pack, unpack, UnpackOptions};
use crate::transfer::{recv_file, send_file};

/// Run one remote command against the given streams.
pub fn dispatch<R: BufRead, W: Write>(
    command: &RemoteCommand,
    input: &mut R,
    output: &mut W,
) -> Result<()> {
    match command {
        RemoteCommand::Serve {
            sources,
            uncompressed,
            offset,
        } => {
            let sources: Vec<PathBuf> = sources.iter().map(PathBuf::from).collect();
            serve(&sources, *uncompressed, *offset, output)
        }
        RemoteCommand::Receive { destination, name } => {
            receive(Path::new(destination), name.as_deref(), input)
        }
        RemoteCommand::Present { location } => present(Path::new(location), input, output),
    }
}

/// Write the sources to `sink`: a single regular file as a single-file body,
/// anything else as an archive.
pub fn serve<W: Write + ?Sized>(
    sources: &[PathBuf],
    uncompressed: bool,
    offset: u64,
    sink: &mut W,
) -> Result<()> {
    match sources {
        [] => Err(TransferError::protocol("nothing to serve")),
        [single] if !single.is_dir() => {
            let meta = fs::metadata(single).with_io_context(|| format!("stat {}", single.display()))?;
            if !meta.is_file() {
                return Err(TransferError::protocol(format!(
                    "{} is not a regular file",
                    single.display()
                )));
            }
            send_file(single, sink, !uncompressed, offset)?;
            Ok(())
        }
        _ => {
            if offset > 0 {
                debug!("ignoring offset {} for an archive transfer", offset);
            }
            for src in sources {
                fs::symlink_metadata(src).with_io_context(|| format!("stat {}", src.display()))?;
            }
            TransferBody::Archive.write_header(sink)?;
            let stats = pack(sources, &mut *sink)?;
            debug!("served {} files, {} bytes", stats.files, stats.bytes);
            Ok(())
        }
    }
}

/// Read one transfer from `source` into `destination`.
///
/// `name` is used for a single file when `destination` is an existing
/// directory.
pub fn receive<R: Read + ?Sized>(
    destination: &Path,
    name: Option<&str>,
    source: &mut R,
) -> Result<()> {
    let body = TransferBody::read_header(source)?;
    let reporter = Reporter::silent();
    match body {
        TransferBody::Archive => {
            let stats = unpack(source, destination, &UnpackOptions::default(), &reporter)?;
            debug!(
                "received {} files ({} skipped) into {}",
                stats.files,
                stats.skipped,
                destination.display()
            );
        }
        single => {
            let target = match name {
                Some(name) if destination.is_dir() => destination.join(name),
                _ => destination.to_path_buf(),
            };
            if target.is_dir() {
                return Err(TransferError::io(
                    format!("receive into {}", target.display()),
                    std::io::Error::new(std::io::ErrorKind::AlreadyExists, "is a directory"),
                ));
            }
            recv_file(source, single, &target, 0, &reporter)?;
        }
    }
    Ok(())
}

/// Sorted listing of `dir`, leaving out names the browse framing can not carry.
pub fn list_directory(dir: &Path) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for item in fs::read_dir(dir).with_io_context(|| format!("list {}", dir.display()))? {
        let item = item.with_io_context(|| format!("list {}", dir.display()))?;
        let name = match item.file_name().into_string() {
            Ok(n) => n,
            Err(raw) => {
                warn!("skipping non UTF-8 name {:?} in {}", raw, dir.display());
                continue;
            }
        };
        if let Err(e) = validate_name(&name) {
            warn!("skipping entry in {}: {}", dir.display(), e);
            continue;
        }
        let path = item.path();
        let meta = match fs::metadata(&path).or_else(|_| fs::symlink_metadata(&path)) {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping {}: {}", path.display(), e);
                continue;
            }
        };
        entries.push(DirEntry::new(name, posix_mode(&meta)));
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Browse loop: answer commands from `input` until `Quit` or end of input.
pub fn present<R: BufRead + ?Sized, W: Write + ?Sized>(
    location: &Path,
    input: &mut R,
    output: &mut W,
) -> Result<()> {
    if !location.is_dir() {
        return Err(TransferError::io(
            format!("browse {}", location.display()),
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        ));
    }
    let mut current = location.to_path_buf();
    while let Some(cmd) = BrowseCommand::read_from(input)? {
        match cmd {
            BrowseCommand::ListFiles => {
                let entries = list_directory(&current)?;
                output
                    .write_all(&serialize_listing(&entries))
                    .io_context("send listing")?;
                output.flush().io_context("send listing")?;
            }
            BrowseCommand::Enter(name) => {
                let next = current.join(&name);
                if next.is_dir() {
                    current = next;
                } else {
                    warn!("cannot enter {}: not a directory", next.display());
                }
            }
            BrowseCommand::Select(name) => {
                // Clients open a dedicated serve session instead.
                warn!("serving {} on the browse stream", name);
                serve(&[current.join(&name)], false, 0, output)?;
                output.flush().io_context("send selection")?;
            }
            BrowseCommand::Quit => break,
        }
    }
    Ok(())
}
