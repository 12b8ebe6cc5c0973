//! Single-file codec
//!
//! Sending writes the header and body for one regular file, optionally
//! starting at a byte offset the receiver already holds. Receiving appends to
//! `<dest>.partial` and renames it into place only once the body is complete.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{IoContext, Result, TransferError};
use crate::progress::Reporter;
use crate::protocol::{COPY_CHUNK, RESUME_REJECTED};
use crate::protocol_core::{apply_mode, ensure_parent_exists, posix_mode, TransferBody};
use crate::resume::partial_path;

/// Send one file starting at `offset`. Returns the number of body bytes read
/// from disk.
pub fn send_file<W: Write + ?Sized>(
    path: &Path,
    sink: &mut W,
    compressed: bool,
    offset: u64,
) -> Result<u64> {
    let mut file = File::open(path).with_io_context(|| format!("open {}", path.display()))?;
    let meta = file
        .metadata()
        .with_io_context(|| format!("stat {}", path.display()))?;
    let len = meta.len();
    if offset > len {
        return Err(TransferError::protocol(format!(
            "{}: {} has {} bytes, asked for offset {}",
            RESUME_REJECTED,
            path.display(),
            len,
            offset
        )));
    }
    let mode = posix_mode(&meta);
    let remaining = len - offset;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .with_io_context(|| format!("seek {}", path.display()))?;
        debug!("serving {} from offset {}", path.display(), offset);
    }

    let body = if compressed {
        TransferBody::SingleFileCompressed { mode }
    } else {
        let size = u32::try_from(remaining).map_err(|_| {
            TransferError::protocol(format!(
                "{} is too large for an uncompressed transfer ({} bytes)",
                path.display(),
                remaining
            ))
        })?;
        TransferBody::SingleFileRaw { size, mode }
    };
    body.write_header(sink)?;

    let mut reader = file.take(remaining);
    let sent = if compressed {
        let mut encoder = GzEncoder::new(&mut *sink, Compression::default());
        let n = io::copy(&mut reader, &mut encoder).with_io_context(|| format!("send {}", path.display()))?;
        encoder.finish().io_context("finish gzip stream")?;
        n
    } else {
        copy_chunked(&mut reader, sink).with_io_context(|| format!("send {}", path.display()))?
    };
    if sent != remaining {
        return Err(TransferError::io(
            format!("read {}", path.display()),
            io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank while it was being sent"),
        ));
    }
    sink.flush().io_context("flush transfer")?;
    Ok(sent)
}

fn copy_chunked<R: Read, W: Write + ?Sized>(reader: &mut R, writer: &mut W) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Receive a single-file body whose header was already read.
///
/// `offset` is how many bytes of the file were negotiated as already present
/// in `<dest>.partial`; the body continues from there. Returns the number of
/// body bytes written.
///
/// The length of `<dest>.partial` is the resume offset of the next attempt,
/// so it must only ever cover bytes actually received. A raw body therefore
/// reserves its disk space without changing the file length.
pub fn recv_file<R: Read + ?Sized>(
    source: &mut R,
    body: TransferBody,
    dest: &Path,
    offset: u64,
    reporter: &Reporter,
) -> Result<u64> {
    let mode = body.mode().ok_or_else(|| {
        TransferError::protocol("expected a single-file body but got an archive")
    })?;
    let partial = partial_path(dest);
    ensure_parent_exists(&partial)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&partial)
        .with_io_context(|| format!("open {}", partial.display()))?;
    // Anything past the negotiated offset was never acknowledged by the sender.
    file.set_len(offset)
        .with_io_context(|| format!("truncate {}", partial.display()))?;
    file.seek(SeekFrom::Start(offset))
        .with_io_context(|| format!("seek {}", partial.display()))?;
    if let TransferBody::SingleFileRaw { size, .. } = body {
        reserve_space(&file, offset, size as u64)
            .with_io_context(|| format!("reserve {} bytes for {}", size, partial.display()))?;
    }
    if offset > 0 {
        reporter.logger().resume(dest, offset);
        reporter.progress().set_position(offset);
    }

    let written = {
        let mut out = BufWriter::with_capacity(COPY_CHUNK, reporter.progress().bar().wrap_write(&mut file));
        let written = if let TransferBody::SingleFileRaw { size, .. } = body {
            let size = size as u64;
            reporter.progress().set_total(offset + size);
            let n = io::copy(&mut (&mut *source).take(size), &mut out)
                .with_io_context(|| format!("write {}", partial.display()))?;
            if n != size {
                out.flush().ok();
                return Err(TransferError::protocol(format!(
                    "stream ended after {} of {} bytes of {}",
                    n,
                    size,
                    dest.display()
                )));
            }
            n
        } else {
            let mut decoder = GzDecoder::new(source);
            io::copy(&mut decoder, &mut out)
                .with_io_context(|| format!("decompress into {}", partial.display()))?
        };
        out.flush()
            .with_io_context(|| format!("flush {}", partial.display()))?;
        written
    };
    drop(file);

    apply_mode(&partial, mode)?;
    fs::rename(&partial, dest)
        .with_io_context(|| format!("rename {} to {}", partial.display(), dest.display()))?;
    reporter.logger().entry_done(dest, written);
    Ok(written)
}

/// Reserve `len` bytes past `offset` without moving the end of file, so a
/// full disk fails before any body byte is read.
#[cfg(target_os = "linux")]
fn reserve_space(file: &File, offset: u64, len: u64) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    if len == 0 {
        return Ok(());
    }
    // SAFETY: fallocate(2) on a descriptor owned by `file` for its lifetime
    let r = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            len as libc::off_t,
        )
    };
    if r == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOSPC) | Some(libc::EFBIG) => Err(err),
        _ => {
            debug!("space not reserved: {}", err);
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn reserve_space(_file: &File, _offset: u64, _len: u64) -> io::Result<()> {
    Ok(())
}
