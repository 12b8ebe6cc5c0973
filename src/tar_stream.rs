//! tar+gzip packaging for directories and multi-path transfers
//!
//! `pack` walks the sources into one tar encoder feeding one gzip encoder.
//! `unpack` is the receiving half with the per-entry resume policy: entries
//! that are already complete are skipped, shorter ones are continued and the
//! entry named by a progress marker is received again from the start.

use filetime::FileTime;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType};
use walkdir::WalkDir;

use crate::error::{IoContext, Result, TransferError};
use crate::progress::Reporter;
use crate::protocol_core::{apply_mode, ensure_dir_exists, ensure_parent_exists, join_under_root};
use crate::resume::ProgressMarker;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackStats {
    pub entries: u64,
    pub files: u64,
    pub bytes: u64,
}

/// Write `paths` as a gzip-compressed tar stream into `sink`.
///
/// A single directory is archived relative to itself (the root is not an
/// entry). Otherwise every path is added under its own name, followed by its
/// subtree when it is a directory.
pub fn pack<W: Write>(paths: &[PathBuf], sink: W) -> Result<PackStats> {
    let encoder = GzEncoder::new(sink, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    let mut stats = PackStats::default();

    match paths {
        [root] if root.is_dir() => append_tree(&mut builder, root, root, &mut stats)?,
        _ => {
            for path in paths {
                let meta = fs::symlink_metadata(path)
                    .with_io_context(|| format!("stat {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(PathBuf::from)
                    .ok_or_else(|| TransferError::protocol(format!("{} has no file name", path.display())))?;
                append_entry(&mut builder, path, &name, &meta, &mut stats)?;
                if meta.is_dir() {
                    let base = path.parent().unwrap_or_else(|| Path::new(""));
                    append_tree(&mut builder, path, base, &mut stats)?;
                }
            }
        }
    }

    // tar trailer first, then the gzip trailer
    let encoder = builder.into_inner().io_context("finish tar stream")?;
    let mut sink = encoder.finish().io_context("finish gzip stream")?;
    sink.flush().io_context("flush archive")?;
    debug!(
        "packed {} entries ({} files, {} bytes)",
        stats.entries, stats.files, stats.bytes
    );
    Ok(stats)
}

fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    dir: &Path,
    base: &Path,
    stats: &mut PackStats,
) -> Result<()> {
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
            TransferError::io(format!("walk {}", path), io::Error::from(e))
        })?;
        let path = entry.path();
        let rel = path.strip_prefix(base).unwrap_or(path);
        let meta = entry
            .metadata()
            .map_err(|e| TransferError::io(format!("stat {}", path.display()), io::Error::from(e)))?;
        append_entry(builder, path, rel, &meta, stats)?;
    }
    Ok(())
}

fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    name: &Path,
    meta: &fs::Metadata,
    stats: &mut PackStats,
) -> Result<()> {
    let ft = meta.file_type();
    if !(ft.is_file() || ft.is_dir() || ft.is_symlink()) {
        warn!("skipping special file {}", path.display());
        return Ok(());
    }
    builder
        .append_path_with_name(path, name)
        .with_io_context(|| format!("archive {}", path.display()))?;
    stats.entries += 1;
    if ft.is_file() {
        stats.files += 1;
        stats.bytes += meta.len();
    }
    Ok(())
}

/// How unpacking treats files already present under the destination.
///
/// With `resume` off every file entry replaces what is on disk. With it on,
/// complete entries are skipped and shorter ones continue where they stopped.
#[derive(Default)]
pub struct UnpackOptions<'a> {
    /// Keep what an earlier interrupted download already wrote
    pub resume: bool,
    /// Marker updated before each file entry is received
    pub marker: Option<&'a ProgressMarker>,
    /// Entry that an interrupted earlier run was receiving
    pub resume_entry: Option<&'a Path>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnpackStats {
    pub files: u64,
    pub skipped: u64,
    pub dirs: u64,
    /// Body bytes written to disk
    pub bytes: u64,
}

enum EntryOutcome {
    Received(u64),
    Skipped,
}

/// Read a gzip-compressed tar stream from `source` into `dest_root`.
pub fn unpack<R: Read>(
    source: R,
    dest_root: &Path,
    opts: &UnpackOptions<'_>,
    reporter: &Reporter,
) -> Result<UnpackStats> {
    ensure_dir_exists(dest_root)?;
    let mut archive = Archive::new(GzDecoder::new(source));
    let mut stats = UnpackStats::default();
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    for entry in archive.entries().io_context("read archive")? {
        let mut entry = entry.io_context("read archive entry")?;
        let rel = entry.path().io_context("decode entry path")?.into_owned();
        let target = join_under_root(dest_root, &rel)?;
        if target == dest_root {
            continue;
        }
        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644);
        let kind = header.entry_type();

        match kind {
            EntryType::Directory => {
                reject_symlinked_parents(dest_root, &rel)?;
                ensure_dir_exists(&target)?;
                dir_modes.push((target, mode));
                stats.dirs += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                reject_symlinked_parents(dest_root, &rel)?;
                let declared = header.size().io_context("read entry size")?;
                let mtime = header.mtime().ok();
                match receive_entry(&mut entry, &target, &rel, declared, opts, reporter)? {
                    EntryOutcome::Skipped => {
                        stats.skipped += 1;
                        reporter.logger().entry_skipped(&rel, declared);
                        reporter.progress().entry("Skipped", &rel);
                    }
                    EntryOutcome::Received(written) => {
                        apply_mode(&target, mode)?;
                        if let Some(secs) = mtime {
                            let stamp = FileTime::from_unix_time(secs as i64, 0);
                            if let Err(e) = filetime::set_file_mtime(&target, stamp) {
                                debug!("set mtime of {}: {}", target.display(), e);
                            }
                        }
                        stats.files += 1;
                        stats.bytes += written;
                        reporter.logger().entry_done(&rel, written);
                        reporter.progress().entry("Received", &rel);
                    }
                }
            }
            EntryType::Symlink => {
                reject_symlinked_parents(dest_root, &rel)?;
                let link = entry
                    .link_name()
                    .io_context("read link target")?
                    .ok_or_else(|| TransferError::protocol(format!("symlink {} has no target", rel.display())))?
                    .into_owned();
                create_symlink(&link, &target)?;
            }
            other => {
                warn!("skipping {} (unsupported entry type {:?})", rel.display(), other);
            }
        }
    }

    // Drain past the tar trailer so a missing gzip trailer is still noticed.
    let mut decoder = archive.into_inner();
    io::copy(&mut decoder, &mut io::sink()).io_context("finish archive stream")?;

    // Deepest first so restrictive parents do not block their children.
    dir_modes.sort_by_key(|(p, _)| std::cmp::Reverse(p.components().count()));
    for (dir, mode) in dir_modes {
        apply_mode(&dir, mode)?;
    }
    Ok(stats)
}

fn receive_entry<R: Read>(
    entry: &mut R,
    target: &Path,
    rel: &Path,
    declared: u64,
    opts: &UnpackOptions<'_>,
    reporter: &Reporter,
) -> Result<EntryOutcome> {
    let marked = opts.resume_entry == Some(rel);
    let local = match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(target).with_io_context(|| format!("remove {}", target.display()))?;
            None
        }
        Ok(_) => {
            return Err(TransferError::io(
                format!("receive {}", target.display()),
                io::Error::new(io::ErrorKind::AlreadyExists, "a directory is in the way"),
            ))
        }
        Err(_) => None,
    };

    let start = match local {
        _ if !opts.resume => 0,
        Some(len) if len == declared && !marked => {
            let n = io::copy(entry, &mut io::sink()).io_context("skip entry body")?;
            reporter.progress().inc(n);
            return Ok(EntryOutcome::Skipped);
        }
        Some(len) if len > declared => {
            debug!("{} is larger than the incoming entry; receiving again", rel.display());
            0
        }
        Some(_) if marked => 0,
        Some(len) => {
            reporter.logger().resume(rel, len);
            len
        }
        None => 0,
    };

    if let Some(marker) = opts.marker {
        marker.record(rel)?;
    }
    ensure_parent_exists(target)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(target)
        .with_io_context(|| format!("open {}", target.display()))?;
    if start == 0 {
        file.set_len(0).with_io_context(|| format!("truncate {}", target.display()))?;
    }
    // Pre-allocation is only safe when a marker tells the next run that this
    // entry's length means nothing.
    if opts.marker.is_some() {
        file.set_len(declared)
            .with_io_context(|| format!("allocate {} bytes for {}", declared, target.display()))?;
    }

    if start > 0 {
        let skipped = io::copy(&mut entry.by_ref().take(start), &mut io::sink())
            .io_context("skip received prefix")?;
        if skipped != start {
            return Err(short_entry(rel, skipped, declared));
        }
        reporter.progress().inc(skipped);
    }
    file.seek(SeekFrom::Start(start))
        .with_io_context(|| format!("seek {}", target.display()))?;
    let written = {
        let mut sink = reporter.progress().bar().wrap_write(&mut file);
        io::copy(entry, &mut sink).with_io_context(|| format!("write {}", target.display()))?
    };
    if start + written != declared {
        return Err(short_entry(rel, start + written, declared));
    }
    file.flush().with_io_context(|| format!("flush {}", target.display()))?;
    Ok(EntryOutcome::Received(written))
}

fn short_entry(rel: &Path, got: u64, declared: u64) -> TransferError {
    TransferError::protocol(format!(
        "archive entry {} ended after {} of {} bytes",
        rel.display(),
        got,
        declared
    ))
}

/// Refuse to write through a symlinked directory created by an earlier entry.
fn reject_symlinked_parents(root: &Path, rel: &Path) -> Result<()> {
    let mut cur = root.to_path_buf();
    let mut parts: Vec<Component<'_>> = rel.components().collect();
    parts.pop();
    for part in parts {
        if let Component::Normal(name) = part {
            cur.push(name);
            if let Ok(meta) = fs::symlink_metadata(&cur) {
                if meta.file_type().is_symlink() {
                    return Err(TransferError::protocol(format!(
                        "entry {} would be written through symlink {}",
                        rel.display(),
                        cur.display()
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link: &Path, target: &Path) -> Result<()> {
    ensure_parent_exists(target)?;
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target).with_io_context(|| format!("replace {}", target.display()))?;
    }
    std::os::unix::fs::symlink(link, target)
        .with_io_context(|| format!("create symlink {}", target.display()))
}

#[cfg(not(unix))]
fn create_symlink(link: &Path, target: &Path) -> Result<()> {
    warn!(
        "skipping symlink {} -> {} (not supported on this platform)",
        target.display(),
        link.display()
    );
    Ok(())
}
