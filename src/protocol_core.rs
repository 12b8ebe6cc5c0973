//! Shared protocol logic for both ends of a session
//!
//! Header framing for bulk transfers, the browse control vocabulary and the
//! listing codec live here so that the serving and receiving code paths cannot
//! drift apart.

use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::io::{self, BufRead, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{IoContext, Result, TransferError};
use crate::protocol::{self, browse, flags, mode};

/// Shape of a bulk-transfer body, decoded once from the leading flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferBody {
    /// gzip-compressed tar archive
    Archive,
    /// mode header followed by a gzip stream holding the file bytes
    SingleFileCompressed { mode: u32 },
    /// size header, mode header, then exactly `size` raw bytes
    SingleFileRaw { size: u32, mode: u32 },
}

impl TransferBody {
    pub fn flags(&self) -> u8 {
        match self {
            TransferBody::Archive => flags::IS_DIRECTORY,
            TransferBody::SingleFileCompressed { .. } => flags::IS_COMPRESSED,
            TransferBody::SingleFileRaw { .. } => 0,
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, TransferBody::Archive)
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, TransferBody::SingleFileRaw { .. })
    }

    /// POSIX mode of a single-file body
    pub fn mode(&self) -> Option<u32> {
        match self {
            TransferBody::Archive => None,
            TransferBody::SingleFileCompressed { mode } | TransferBody::SingleFileRaw { mode, .. } => {
                Some(*mode)
            }
        }
    }

    /// Serialize flags byte and fixed headers. Body bytes follow.
    pub fn write_header<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let mut hdr = Vec::with_capacity(9);
        hdr.push(self.flags());
        match self {
            TransferBody::Archive => {}
            TransferBody::SingleFileCompressed { mode } => write_u32(&mut hdr, *mode),
            TransferBody::SingleFileRaw { size, mode } => {
                write_u32(&mut hdr, *size);
                write_u32(&mut hdr, *mode);
            }
        }
        w.write_all(&hdr).io_context("write transfer header")?;
        Ok(())
    }

    /// Parse flags byte and fixed headers, leaving the reader at the body.
    pub fn read_header<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let mut flag = [0u8; 1];
        read_exact_or_protocol(r, &mut flag, "flags byte")?;
        let f = flag[0];
        if f & !flags::KNOWN != 0 {
            return Err(TransferError::protocol(format!("unknown flags byte {:#04x}", f)));
        }
        let is_dir = f & flags::IS_DIRECTORY != 0;
        let is_compressed = f & flags::IS_COMPRESSED != 0;
        match (is_dir, is_compressed) {
            (true, true) => Err(TransferError::protocol(
                "flags byte sets both directory and compressed-file bits",
            )),
            (true, false) => Ok(TransferBody::Archive),
            (false, true) => {
                let mode = read_u32(r, "file mode")?;
                Ok(TransferBody::SingleFileCompressed { mode })
            }
            (false, false) => {
                let size = read_u32(r, "file size")?;
                let mode = read_u32(r, "file mode")?;
                Ok(TransferBody::SingleFileRaw { size, mode })
            }
        }
    }
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn read_u32<R: Read + ?Sized>(r: &mut R, what: &str) -> Result<u32> {
    let mut b = [0u8; 4];
    read_exact_or_protocol(r, &mut b, what)?;
    Ok(u32::from_le_bytes(b))
}

/// `read_exact` that reports a short read as a protocol violation.
fn read_exact_or_protocol<R: Read + ?Sized>(r: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransferError::protocol(
            format!("stream ended before {} was received", what),
        )),
        Err(e) => Err(TransferError::io(format!("read {}", what), e)),
    }
}

/// One listed entry of a remote directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    /// POSIX mode bits: type and permissions
    pub mode: u32,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, mode: u32) -> Self {
        Self {
            name: name.into(),
            mode,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & mode::TYPE_MASK == mode::DIRECTORY
    }

    /// `ls`-style rendering, e.g. `drwxr-xr-x`
    pub fn mode_string(&self) -> String {
        let mut out = String::with_capacity(10);
        out.push(if self.is_dir() { 'd' } else { '-' });
        for shift in [6u32, 3, 0] {
            let bits = (self.mode >> shift) & 0b111;
            out.push(if bits & 0b100 != 0 { 'r' } else { '-' });
            out.push(if bits & 0b010 != 0 { 'w' } else { '-' });
            out.push(if bits & 0b001 != 0 { 'x' } else { '-' });
        }
        out
    }

    fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(protocol::GROUP_SEPARATOR);
        buf.extend_from_slice(self.mode.to_string().as_bytes());
    }

    fn deserialize(raw: &[u8]) -> Result<Self> {
        let parts: Vec<&[u8]> = raw.split(|b| *b == protocol::GROUP_SEPARATOR).collect();
        if parts.len() != 2 {
            return Err(TransferError::protocol(format!(
                "expected 2 file entry components but got {}",
                parts.len()
            )));
        }
        let name = std::str::from_utf8(parts[0])
            .map_err(|_| TransferError::protocol("entry name is not valid UTF-8"))?;
        let mode = std::str::from_utf8(parts[1])
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| TransferError::protocol("entry mode is not a decimal number"))?;
        Ok(DirEntry::new(name, mode))
    }
}

/// Serialize a listing, including the terminating END_TRANSMISSION byte.
pub fn serialize_listing(entries: &[DirEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            buf.push(protocol::FILE_SEPARATOR);
        }
        entry.serialize_into(&mut buf);
    }
    buf.push(protocol::END_TRANSMISSION);
    buf
}

/// Parse a listing. A trailing END_TRANSMISSION is accepted and ignored.
pub fn deserialize_listing(raw: &[u8]) -> Result<Vec<DirEntry>> {
    let body = raw.strip_suffix(&[protocol::END_TRANSMISSION]).unwrap_or(raw);
    body.split(|b| *b == protocol::FILE_SEPARATOR)
        // an empty directory serializes to an empty body
        .filter(|raw| !raw.is_empty())
        .map(DirEntry::deserialize)
        .collect()
}

/// Reject names that would corrupt the browse framing.
pub fn validate_name(name: &str) -> Result<()> {
    if let Some(b) = name
        .bytes()
        .find(|b| protocol::RESERVED_NAME_BYTES.contains(b))
    {
        return Err(TransferError::protocol(format!(
            "name {:?} contains reserved control byte {:#04x}",
            name, b
        )));
    }
    Ok(())
}

/// One control message on the browse channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseCommand {
    ListFiles,
    Select(String),
    Enter(String),
    Quit,
}

impl BrowseCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (byte, arg) = match self {
            BrowseCommand::ListFiles => return Ok(vec![browse::LIST_FILES]),
            BrowseCommand::Quit => return Ok(vec![browse::QUIT]),
            BrowseCommand::Select(name) => (browse::SELECT, name),
            BrowseCommand::Enter(name) => (browse::ENTER, name),
        };
        validate_name(arg)?;
        let mut buf = Vec::with_capacity(arg.len() + 2);
        buf.push(byte);
        buf.extend_from_slice(arg.as_bytes());
        buf.push(protocol::END_TRANSMISSION);
        Ok(buf)
    }

    /// Read the next command. `Ok(None)` means the peer closed the stream.
    pub fn read_from<R: BufRead + ?Sized>(r: &mut R) -> Result<Option<Self>> {
        let mut byte = [0u8; 1];
        loop {
            match r.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::io("read browse command", e)),
            }
        }
        let cmd = match byte[0] {
            browse::LIST_FILES => BrowseCommand::ListFiles,
            browse::QUIT => BrowseCommand::Quit,
            browse::SELECT => BrowseCommand::Select(read_argument(r)?),
            browse::ENTER => BrowseCommand::Enter(read_argument(r)?),
            other => {
                return Err(TransferError::protocol(format!(
                    "unexpected browse control byte {:#04x}",
                    other
                )))
            }
        };
        Ok(Some(cmd))
    }
}

fn read_argument<R: BufRead + ?Sized>(r: &mut R) -> Result<String> {
    let raw = read_until_end_transmission(r)?;
    String::from_utf8(raw).map_err(|_| TransferError::protocol("browse argument is not valid UTF-8"))
}

/// Read up to and excluding the next END_TRANSMISSION byte.
pub fn read_until_end_transmission<R: BufRead + ?Sized>(r: &mut R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut limited = r.take(protocol::MAX_CONTROL_MESSAGE as u64 + 1);
    limited
        .read_until(protocol::END_TRANSMISSION, &mut out)
        .io_context("read control message")?;
    match out.last() {
        Some(&protocol::END_TRANSMISSION) => {
            out.pop();
            Ok(out)
        }
        _ if out.len() > protocol::MAX_CONTROL_MESSAGE => Err(TransferError::protocol(format!(
            "control message exceeds {} bytes",
            protocol::MAX_CONTROL_MESSAGE
        ))),
        _ => Err(TransferError::protocol(
            "stream ended before end-of-transmission byte",
        )),
    }
}

/// Join an archive-relative path under `root`.
/// This prevents path traversal by rejecting absolute paths, parent directory
/// components and NUL bytes. Unlike a canonicalizing check it works for
/// destinations that do not exist yet.
pub fn join_under_root(root: &Path, rel: &Path) -> Result<PathBuf> {
    if rel.to_string_lossy().contains('\0') {
        return Err(TransferError::protocol("path contains NUL byte"));
    }
    let mut safe = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => safe.push(s),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::protocol(format!(
                    "path {:?} contains disallowed component {:?}",
                    rel, component
                )));
            }
        }
    }
    Ok(root.join(safe))
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        create_dir_all_with_mode(path)
            .with_io_context(|| format!("create directory {}", path.display()))?;
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir_exists(parent),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn create_dir_all_with_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o775)
        .create(path)
}

#[cfg(not(unix))]
fn create_dir_all_with_mode(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

/// POSIX mode (type + permission bits) of a file
#[cfg(unix)]
pub fn posix_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
pub fn posix_mode(meta: &Metadata) -> u32 {
    let perm = if meta.permissions().readonly() { 0o444 } else { 0o644 };
    if meta.is_dir() {
        mode::DIRECTORY | perm | 0o111
    } else if meta.file_type().is_symlink() {
        mode::SYMLINK | 0o777
    } else {
        mode::REGULAR | perm
    }
}

/// Apply the permission part of a POSIX mode.
#[cfg(unix)]
pub fn apply_mode(path: &Path, posix: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(
        path,
        std::fs::Permissions::from_mode(posix & mode::PERM_MASK),
    )
    .with_io_context(|| format!("change mode of {}", path.display()))
}

#[cfg(not(unix))]
pub fn apply_mode(path: &Path, posix: u32) -> Result<()> {
    let mut perms = std::fs::metadata(path)
        .with_io_context(|| format!("stat {}", path.display()))?
        .permissions();
    perms.set_readonly(posix & 0o200 == 0);
    std::fs::set_permissions(path, perms)
        .with_io_context(|| format!("change mode of {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn raw_header_layout_is_little_endian() {
        let body = TransferBody::SingleFileRaw {
            size: 0x0102_0304,
            mode: 0o100644,
        };
        let mut buf = Vec::new();
        body.write_header(&mut buf).unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(&buf[1..5], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[5..9], &0o100644u32.to_le_bytes());
        let parsed = TransferBody::read_header(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn compressed_header_has_no_size() {
        let body = TransferBody::SingleFileCompressed { mode: 0o100755 };
        let mut buf = Vec::new();
        body.write_header(&mut buf).unwrap();
        assert_eq!(buf.len(), 5);
        assert_eq!(buf[0], flags::IS_COMPRESSED);
    }

    #[test]
    fn archive_header_is_a_single_byte() {
        let mut buf = Vec::new();
        TransferBody::Archive.write_header(&mut buf).unwrap();
        assert_eq!(buf, vec![flags::IS_DIRECTORY]);
    }

    #[test]
    fn conflicting_or_unknown_flags_are_protocol_errors() {
        for raw in [vec![0b11u8], vec![0x80u8]] {
            let err = TransferBody::read_header(&mut Cursor::new(raw)).unwrap_err();
            assert!(matches!(err, TransferError::Protocol(_)), "{err}");
        }
    }

    #[test]
    fn truncated_header_is_protocol_error() {
        let err = TransferBody::read_header(&mut Cursor::new(vec![0u8, 1, 2])).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
        let err = TransferBody::read_header(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[test]
    fn listing_round_trip_keeps_order_and_dir_bit() {
        let entries = vec![DirEntry::new("a.txt", 0o100644), DirEntry::new("sub", 0o040755)];
        let raw = serialize_listing(&entries);
        assert_eq!(*raw.last().unwrap(), protocol::END_TRANSMISSION);
        let parsed = deserialize_listing(&raw).unwrap();
        assert_eq!(parsed, entries);
        assert!(!parsed[0].is_dir());
        assert!(parsed[1].is_dir());
    }

    #[test]
    fn empty_listing() {
        let raw = serialize_listing(&[]);
        assert_eq!(raw, vec![protocol::END_TRANSMISSION]);
        assert!(deserialize_listing(&raw).unwrap().is_empty());
    }

    #[test]
    fn listing_with_bad_mode_is_rejected() {
        let raw = b"a.txt\x1dnope\x04".to_vec();
        assert!(deserialize_listing(&raw).is_err());
        let raw = b"a.txt\x04".to_vec();
        assert!(deserialize_listing(&raw).is_err());
    }

    #[test]
    fn mode_string_rendering() {
        assert_eq!(DirEntry::new("d", 0o040755).mode_string(), "drwxr-xr-x");
        assert_eq!(DirEntry::new("f", 0o100640).mode_string(), "-rw-r-----");
    }

    #[test]
    fn browse_commands_round_trip() {
        let cmds = vec![
            BrowseCommand::Enter("sub dir".into()),
            BrowseCommand::ListFiles,
            BrowseCommand::Select("file.bin".into()),
            BrowseCommand::Quit,
        ];
        let mut wire = Vec::new();
        for c in &cmds {
            wire.extend(c.encode().unwrap());
        }
        let mut r = Cursor::new(wire);
        let mut got = Vec::new();
        while let Some(c) = BrowseCommand::read_from(&mut r).unwrap() {
            got.push(c);
        }
        assert_eq!(got, cmds);
    }

    #[test]
    fn reserved_bytes_in_names_are_rejected() {
        assert!(BrowseCommand::Enter("bad\x04name".into()).encode().is_err());
        assert!(validate_name("a\x1db").is_err());
        assert!(validate_name("plain name.txt").is_ok());
    }

    #[test]
    fn unknown_control_byte() {
        let err = BrowseCommand::read_from(&mut Cursor::new(vec![b'x'])).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[test]
    fn unterminated_argument_is_protocol_error() {
        let err = BrowseCommand::read_from(&mut Cursor::new(b"\x13sub".to_vec())).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[test]
    fn test_join_under_root_safe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let result = join_under_root(root, Path::new("subdir/file.txt")).unwrap();
        assert!(result.starts_with(root));
        assert!(result.ends_with("subdir/file.txt"));

        let result = join_under_root(root, Path::new("./subdir/./file.txt")).unwrap();
        assert!(result.ends_with("subdir/file.txt"));
    }

    #[test]
    fn test_join_under_root_unsafe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        assert!(join_under_root(root, Path::new("../etc/passwd")).is_err());
        assert!(join_under_root(root, Path::new("subdir/../../etc/passwd")).is_err());
        assert!(join_under_root(root, Path::new("/etc/passwd")).is_err());
        assert!(join_under_root(root, Path::new("file\0.txt")).is_err());
    }

    #[test]
    fn test_ensure_parent_exists() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("new").join("nested").join("file.txt");

        assert!(!file_path.parent().unwrap().exists());
        ensure_parent_exists(&file_path).unwrap();
        assert!(file_path.parent().unwrap().is_dir());

        // Should be idempotent
        ensure_parent_exists(&file_path).unwrap();
        ensure_parent_exists(Path::new("bare-name")).unwrap();
    }
}
