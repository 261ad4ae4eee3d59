use num_enum::TryFromPrimitive;
use thiserror::Error;

/// Stable numeric error codes.
///
/// These are the codes that travel in the `error` field of generic
/// responses and that the messenger delivers to transactors when a
/// connection fails. The values match the classic errno assignments, so a
/// packet dump of a failed response reads like an errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(i32)]
pub enum Ferr {
    Perm = 1,
    NoEnt = 2,
    Io = 5,
    NoMem = 12,
    Access = 13,
    Exist = 17,
    NotDir = 20,
    IsDir = 21,
    Inval = 22,
    MFile = 24,
    NoSpc = 28,
    NameTooLong = 36,
    NoSys = 38,
    Overflow = 75,
    NotSup = 95,
    ConnReset = 104,
    ConnRefused = 111,
    Shutdown = 108,
    TimedOut = 110,
    NoMedium = 123,
    Canceled = 125,
}

impl Ferr {
    /// Numeric form for the wire.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Collapse an I/O error into a wire code. Unrecognized errors become
    /// `Io` rather than leaking platform-specific numbers onto the wire.
    pub fn from_io(err: &std::io::Error) -> Ferr {
        use std::io::ErrorKind;
        if let Some(raw) = err.raw_os_error() {
            if let Ok(fe) = Ferr::try_from(raw) {
                return fe;
            }
        }
        match err.kind() {
            ErrorKind::NotFound => Ferr::NoEnt,
            ErrorKind::PermissionDenied => Ferr::Access,
            ErrorKind::AlreadyExists => Ferr::Exist,
            ErrorKind::ConnectionRefused => Ferr::ConnRefused,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Ferr::ConnReset,
            ErrorKind::TimedOut => Ferr::TimedOut,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Ferr::Inval,
            ErrorKind::OutOfMemory => Ferr::NoMem,
            _ => Ferr::Io,
        }
    }
}

impl std::fmt::Display for Ferr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Ferr::Perm => "EPERM",
            Ferr::NoEnt => "ENOENT",
            Ferr::Io => "EIO",
            Ferr::NoMem => "ENOMEM",
            Ferr::Access => "EACCES",
            Ferr::Exist => "EEXIST",
            Ferr::NotDir => "ENOTDIR",
            Ferr::IsDir => "EISDIR",
            Ferr::Inval => "EINVAL",
            Ferr::MFile => "EMFILE",
            Ferr::NoSpc => "ENOSPC",
            Ferr::NameTooLong => "ENAMETOOLONG",
            Ferr::NoSys => "ENOSYS",
            Ferr::Overflow => "EOVERFLOW",
            Ferr::NotSup => "ENOTSUP",
            Ferr::ConnReset => "ECONNRESET",
            Ferr::ConnRefused => "ECONNREFUSED",
            Ferr::Shutdown => "ESHUTDOWN",
            Ferr::TimedOut => "ETIMEDOUT",
            Ferr::NoMedium => "ENOMEDIUM",
            Ferr::Canceled => "ECANCELED",
        };
        write!(f, "{} ({})", name, *self as i32)
    }
}

impl std::error::Error for Ferr {}

/// Errors raised while packing or unpacking wire data.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated field: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("unknown message type {0}")]
    UnknownType(u16),
    #[error("message type {got} where {want} was expected")]
    WrongType { got: u16, want: u16 },
    #[error("string field of {0} bytes exceeds the limit")]
    StringTooLong(usize),
    #[error("string field is not valid utf-8")]
    BadUtf8,
    #[error("frame body of {0} bytes exceeds the limit")]
    BodyTooLarge(u32),
    #[error("unknown error code {0} in response")]
    BadErrorCode(i32),
}

impl WireError {
    /// The code a peer should see when this side rejects a frame.
    pub fn errno(&self) -> Ferr {
        match self {
            WireError::UnknownType(_) => Ferr::NoSys,
            _ => Ferr::Inval,
        }
    }
}
