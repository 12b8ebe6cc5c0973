//! Shared protocol constants for the skiff transfer and browse channels
//!
//! Both peers must agree on these values bit-for-bit. A mismatch shows up as a
//! `Protocol` error on the receiving side, never as silent corruption.

/// Leading flags byte of a bulk-transfer stream
pub mod flags {
    /// Body is a single gzip-compressed file (mode header + gzip body)
    pub const IS_COMPRESSED: u8 = 0b01;
    /// Body is a gzip-compressed tar archive
    pub const IS_DIRECTORY: u8 = 0b10;
    /// Bits a well-formed flags byte may carry
    pub const KNOWN: u8 = IS_COMPRESSED | IS_DIRECTORY;
}

/// Browse control bytes (client -> presenter)
///
/// Values sit in the C0 control range so they can never collide with a
/// printable path byte.
pub mod browse {
    pub const LIST_FILES: u8 = 0x11;
    pub const SELECT: u8 = 0x12;
    pub const ENTER: u8 = 0x13;
    pub const QUIT: u8 = 0x14;
}

// Framing separators
pub const END_TRANSMISSION: u8 = 0x04;
pub const FILE_SEPARATOR: u8 = 0x1c;
pub const GROUP_SEPARATOR: u8 = 0x1d;
pub const RECORD_SEPARATOR: u8 = 0x1e;
pub const UNIT_SEPARATOR: u8 = 0x1f;

/// Bytes that may never appear inside a browse argument or listed name
pub const RESERVED_NAME_BYTES: [u8; 5] = [
    END_TRANSMISSION,
    FILE_SEPARATOR,
    GROUP_SEPARATOR,
    RECORD_SEPARATOR,
    UNIT_SEPARATOR,
];

/// Sibling suffix for an in-progress single-file download
pub const PARTIAL_SUFFIX: &str = ".partial";
/// Suffix of the marker naming the archive entry currently being received
pub const PROGRESS_SUFFIX: &str = ".progress";

/// Error text a sender uses when asked to resume past the end of a file.
/// Receivers match on it to discard a stale partial and start over.
pub const RESUME_REJECTED: &str = "resume offset is past the end of the file";

/// Prefix of the line a failing counterpart prints last on its error stream
pub const REMOTE_ERROR_PREFIX: &str = "error: ";

/// Upper bound for a single browse argument or listing (DoS guard)
pub const MAX_CONTROL_MESSAGE: usize = 16 * 1024 * 1024;

/// Copy buffer used for raw bodies
pub const COPY_CHUNK: usize = 256 * 1024;

// POSIX file type bits carried in mode headers and listings
pub mod mode {
    pub const TYPE_MASK: u32 = 0o170000;
    pub const DIRECTORY: u32 = 0o040000;
    pub const REGULAR: u32 = 0o100000;
    pub const SYMLINK: u32 = 0o120000;
    pub const PERM_MASK: u32 = 0o7777;
}
