//! Upload and download orchestrators
//!
//! Each operation starts one session running the counterpart command, drives
//! the codecs over its streams and always stops the session, whether the
//! transfer worked or not. Partial files are left behind on failure so the
//! next run can pick up where this one stopped.

use log::{debug, info, warn};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::cli::RemoteCommand;
use crate::error::{IoContext, Result, TransferError};
use crate::progress::Reporter;
use crate::protocol::RESUME_REJECTED;
use crate::protocol_core::TransferBody;
use crate::resume::{basename, create_identifier, partial_len, partial_path, ProgressMarker};
use crate::session::{Executor, Session};
use crate::tar_stream::{pack, unpack, UnpackOptions};
use crate::transfer::{recv_file, send_file};

/// Knobs shared by every transfer
#[derive(Clone)]
pub struct TransferOptions {
    /// gzip single files on the wire (archives are always compressed)
    pub compress: bool,
    /// Program started on the remote host
    pub remote_program: String,
    pub reporter: Reporter,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            compress: true,
            remote_program: "skiff".to_string(),
            reporter: Reporter::silent(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub destination: PathBuf,
    pub files: u64,
    /// Archive entries that were already complete locally
    pub skipped: u64,
    pub bytes: u64,
    /// Offset a single-file download continued from
    pub resumed_from: u64,
}

/// Destination used when none is given: the sole source's name, or `.`.
pub fn default_destination<S: AsRef<str>>(sources: &[S]) -> PathBuf {
    match sources {
        [only] => match basename(only.as_ref()) {
            "" | "/" | "." | ".." => PathBuf::from("."),
            name => PathBuf::from(name),
        },
        _ => PathBuf::from("."),
    }
}

struct DownloadPlan<'a> {
    sources: &'a [String],
    dest: PathBuf,
    /// Where a single-file body lands
    file_target: PathBuf,
    marker: ProgressMarker,
}

impl<'a> DownloadPlan<'a> {
    fn new(sources: &'a [String], destination: Option<&Path>) -> Self {
        let dest = destination
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_destination(sources));
        let single = sources.len() == 1;
        let file_target = if single && dest.is_dir() {
            dest.join(basename(&sources[0]))
        } else {
            dest.clone()
        };
        let marker_dir = if single {
            match dest.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            }
        } else {
            dest.clone()
        };
        let marker = ProgressMarker::new(&marker_dir, &create_identifier(sources));
        Self {
            sources,
            dest,
            file_target,
            marker,
        }
    }

    fn single(&self) -> bool {
        self.sources.len() == 1
    }
}

/// Fetch remote `sources` into `destination`, resuming earlier attempts.
pub fn download<E: Executor + ?Sized>(
    executor: &E,
    sources: &[String],
    destination: Option<&Path>,
    opts: &TransferOptions,
) -> Result<TransferSummary> {
    if sources.is_empty() {
        return Err(TransferError::protocol("no sources to download"));
    }
    let plan = DownloadPlan::new(sources, destination);
    let started = Instant::now();
    let reporter = &opts.reporter;
    reporter.logger().start(&sources.join(" "), &plan.dest);

    let offset = if plan.single() {
        partial_len(&plan.file_target)
    } else {
        0
    };
    if offset > 0 {
        info!(
            "resuming {} from byte {}",
            plan.file_target.display(),
            offset
        );
    }

    let result = match fetch(executor, &plan, offset, opts) {
        Err(TransferError::Remote(msg)) if offset > 0 && msg.contains(RESUME_REJECTED) => {
            let partial = partial_path(&plan.file_target);
            let invalid = TransferError::ResumeStateInvalid {
                path: partial.clone(),
                reason: msg,
            };
            warn!("{}; starting over", invalid);
            if let Err(e) = fs::remove_file(&partial) {
                warn!("could not remove {}: {}", partial.display(), e);
            }
            fetch(executor, &plan, 0, opts)
        }
        other => other,
    };

    match &result {
        Ok(summary) => {
            reporter.logger().done(
                summary.files,
                summary.bytes,
                started.elapsed().as_secs_f64(),
            );
            reporter.progress().finish(summary.files, summary.bytes);
        }
        Err(e) => {
            reporter
                .logger()
                .error("download", &plan.dest, &e.to_string());
            reporter.progress().abandon(&e.to_string());
        }
    }
    result
}

fn fetch<E: Executor + ?Sized>(
    executor: &E,
    plan: &DownloadPlan<'_>,
    offset: u64,
    opts: &TransferOptions,
) -> Result<TransferSummary> {
    let command = RemoteCommand::Serve {
        sources: plan.sources.to_vec(),
        uncompressed: !opts.compress,
        offset,
    }
    .to_command_line(&opts.remote_program);
    let mut session = Session::start(executor, &command)?;
    match receive_body(&mut session, plan, offset, &opts.reporter) {
        Ok(summary) => {
            session.wait()?;
            Ok(summary)
        }
        Err(e) => Err(session.fail(e)),
    }
}

fn receive_body(
    session: &mut Session,
    plan: &DownloadPlan<'_>,
    offset: u64,
    reporter: &Reporter,
) -> Result<TransferSummary> {
    let body = TransferBody::read_header(session.output())?;
    debug!("incoming body: {:?}", body);
    match body {
        TransferBody::Archive => {
            let resume_entry = plan.marker.resume_entry(&plan.dest);
            let unpack_opts = UnpackOptions {
                resume: true,
                marker: Some(&plan.marker),
                resume_entry: resume_entry.as_deref(),
            };
            let stats = unpack(session.output(), &plan.dest, &unpack_opts, reporter)?;
            plan.marker.clear();
            Ok(TransferSummary {
                destination: plan.dest.clone(),
                files: stats.files,
                skipped: stats.skipped,
                bytes: stats.bytes,
                resumed_from: 0,
            })
        }
        single => {
            if !plan.single() {
                return Err(TransferError::protocol(
                    "expected an archive for several sources but got a single file",
                ));
            }
            let written = recv_file(session.output(), single, &plan.file_target, offset, reporter)?;
            reporter.progress().entry("Received", &plan.file_target);
            Ok(TransferSummary {
                destination: plan.file_target.clone(),
                files: 1,
                skipped: 0,
                bytes: written,
                resumed_from: offset,
            })
        }
    }
}

/// Send a local file or directory to `destination` on the remote side.
pub fn upload<E: Executor + ?Sized>(
    executor: &E,
    source: &Path,
    destination: &str,
    opts: &TransferOptions,
) -> Result<TransferSummary> {
    let meta = fs::metadata(source).with_io_context(|| format!("stat {}", source.display()))?;
    let started = Instant::now();
    let reporter = &opts.reporter;
    reporter
        .logger()
        .start(&source.display().to_string(), Path::new(destination));

    let command = RemoteCommand::Receive {
        destination: destination.to_string(),
        name: source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
    }
    .to_command_line(&opts.remote_program);
    let mut session = Session::start(executor, &command)?;
    let result = match send_body(&mut session, source, &meta, opts) {
        Ok(summary) => session.wait().map(|()| summary),
        Err(e) => Err(session.fail(e)),
    };

    match &result {
        Ok(summary) => {
            reporter
                .logger()
                .done(summary.files, summary.bytes, started.elapsed().as_secs_f64());
            reporter.progress().finish(summary.files, summary.bytes);
        }
        Err(e) => {
            reporter.logger().error("upload", source, &e.to_string());
            reporter.progress().abandon(&e.to_string());
        }
    }
    result
}

fn send_body(
    session: &mut Session,
    source: &Path,
    meta: &fs::Metadata,
    opts: &TransferOptions,
) -> Result<TransferSummary> {
    let progress = opts.reporter.progress();
    let summary = {
        let input = session.input()?;
        if meta.is_dir() {
            TransferBody::Archive.write_header(input)?;
            let stats = pack(&[source.to_path_buf()], progress.bar().wrap_write(&mut *input))?;
            TransferSummary {
                destination: source.to_path_buf(),
                files: stats.files,
                skipped: 0,
                bytes: stats.bytes,
                resumed_from: 0,
            }
        } else {
            progress.set_total(meta.len());
            let mut counted = progress.bar().wrap_write(&mut *input);
            let sent = send_file(source, &mut counted, opts.compress, 0)?;
            progress.set_position(sent);
            TransferSummary {
                destination: source.to_path_buf(),
                files: 1,
                skipped: 0,
                bytes: sent,
                resumed_from: 0,
            }
        }
    };
    session.close_input()?;
    Ok(summary)
}

/// A remote path being served on its own session, header already read.
pub struct DownloadHandle {
    name: String,
    header: TransferBody,
    session: Session,
}

impl DownloadHandle {
    /// Start serving `remote_path` and read its header.
    pub fn open<E: Executor + ?Sized>(
        executor: &E,
        remote_path: &str,
        opts: &TransferOptions,
    ) -> Result<Self> {
        let command = RemoteCommand::Serve {
            sources: vec![remote_path.to_string()],
            uncompressed: !opts.compress,
            offset: 0,
        }
        .to_command_line(&opts.remote_program);
        let mut session = Session::start(executor, &command)?;
        match TransferBody::read_header(session.output()) {
            Ok(header) => Ok(Self {
                name: basename(remote_path).to_string(),
                header,
                session,
            }),
            Err(e) => Err(session.fail(e)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> TransferBody {
        self.header
    }

    /// Name a browser should save the body under
    pub fn file_name(&self) -> String {
        if self.header.is_archive() {
            format!("{}.tar.gz", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn content_type(&self) -> String {
        if self.header.is_archive() {
            return "application/gzip".to_string();
        }
        mime_guess::from_path(&self.name)
            .first_or_octet_stream()
            .to_string()
    }

    pub fn content_disposition(&self) -> String {
        format!(
            "attachment; filename=\"{}\"",
            self.file_name().replace('"', "'")
        )
    }

    /// `gzip` when the body is a compressed single file
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self.header {
            TransferBody::SingleFileCompressed { .. } => Some("gzip"),
            _ => None,
        }
    }

    /// Body length, known only for uncompressed single files
    pub fn content_length(&self) -> Option<u64> {
        match self.header {
            TransferBody::SingleFileRaw { size, .. } => Some(size as u64),
            _ => None,
        }
    }

    /// Materialise the entry inside `dir`. Returns the created path.
    pub fn save_to(mut self, dir: &Path, reporter: &Reporter) -> Result<PathBuf> {
        let target = dir.join(&self.name);
        let res = match self.header {
            TransferBody::Archive => unpack(
                self.session.output(),
                &target,
                &UnpackOptions::default(),
                reporter,
            )
            .map(|_| ()),
            single => recv_file(self.session.output(), single, &target, 0, reporter).map(|_| ()),
        };
        match res {
            Ok(()) => {
                self.session.wait()?;
                Ok(target)
            }
            Err(e) => Err(self.session.fail(e)),
        }
    }

    /// The body exactly as sent: gzip for archives and compressed files.
    pub fn into_body_reader(self) -> BodyReader {
        BodyReader {
            remaining: self.content_length(),
            session: self.session,
        }
    }

    pub fn stop(self) {
        self.session.stop();
    }
}

/// Streaming body of a [`DownloadHandle`]. Dropping it stops the session.
pub struct BodyReader {
    session: Session,
    remaining: Option<u64>,
}

impl BodyReader {
    /// Wait for the serving side to exit cleanly.
    pub fn finish(self) -> Result<()> {
        self.session.wait()
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = match self.remaining {
            Some(0) => return Ok(0),
            Some(n) => buf.len().min(n.min(usize::MAX as u64) as usize),
            None => buf.len(),
        };
        let n = self.session.output().read(&mut buf[..limit])?;
        if let Some(rem) = self.remaining.as_mut() {
            if n == 0 && limit > 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "download stream ended early",
                ));
            }
            *rem -= n as u64;
        }
        Ok(n)
    }
}
