//! lorastation error types.

use crate::timesync::TimesyncError;
use core::fmt;

/// A lorastation error.
#[derive(Debug)]
pub enum Error {
    /// An operating system level I/O error.
    Io(std::io::Error),
    /// A JSON body or configuration file failed to parse.
    Json(serde_json::Error),
    /// A pipe record failed to encode or decode.
    Wire(lorastation_wire::WireError),
    /// Something timed out.
    Timeout,
    /// A credential store operation failed.
    Store(StoreError),
    /// A CUPS protocol error.
    Cups(CupsError),
    /// A concentrator HAL error.
    Hal(HalError),
    /// A radio abstraction layer error.
    Ral(RalError),
    /// A time base conversion failed.
    Timesync(TimesyncError),
    /// The station configuration is unusable.
    Config(ConfigError),
    /// Building a TLS context from the credential store failed.
    Tls(rustls::Error),
    /// An internal error occurred. This indicates something that shouldn't
    /// happen within lorastation.
    Internal,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io: {}", e),
            Error::Json(e) => write!(f, "json: {}", e),
            Error::Wire(e) => write!(f, "wire encode/decode error: {}", e),
            Error::Timeout => f.write_str("timeout"),
            Error::Store(e) => write!(f, "credential store: {}", e),
            Error::Cups(e) => write!(f, "cups: {}", e),
            Error::Hal(e) => write!(f, "hal: {}", e),
            Error::Ral(e) => write!(f, "ral: {}", e),
            Error::Timesync(e) => write!(f, "timesync: {}", e),
            Error::Config(e) => write!(f, "config: {}", e),
            Error::Tls(e) => write!(f, "tls: {}", e),
            Error::Internal => f.write_str("internal error"),
        }
    }
}

/// Credential store errors.
#[derive(Debug)]
pub enum StoreError {
    /// An element file could not be read or written.
    Io(std::io::Error),
    /// A credential blob is not a well-formed concatenation of ASN.1 elements.
    Asn1,
    /// A URI read from disk exceeds [`MAX_URI_LEN`](crate::MAX_URI_LEN).
    UriTooLong {
        /// Actual length on disk.
        len: usize,
    },
    /// Forward recovery found markers that could not be driven to completion.
    Recovery,
}

impl std::error::Error for StoreError {}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "io: {}", e),
            StoreError::Asn1 => f.write_str("malformed ASN.1 credential blob"),
            StoreError::UriTooLong { len } => {
                write!(f, "stored URI of {} bytes exceeds limit", len)
            }
            StoreError::Recovery => f.write_str("forward recovery failed"),
        }
    }
}

/// CUPS protocol errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CupsError {
    /// The server answered with a non-200 HTTP status.
    Rejected {
        /// HTTP status code.
        status: u16,
    },
    /// No CUPS URI is configured for the current credential set.
    NoUri,
    /// A segment length overflows its declared field width or the allocated
    /// limit for that segment kind.
    SegmentTooLong {
        /// Declared segment length.
        declared: usize,
        /// Allowed maximum.
        limit: usize,
    },
    /// The body ended in the middle of a segment.
    TruncatedBody,
    /// The ECDSA signature did not verify against any on-disk key.
    BadSignature,
    /// The server closed the connection or the transfer failed mid-stream.
    Transfer,
}

impl std::error::Error for CupsError {}

impl fmt::Display for CupsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CupsError::Rejected { status } => write!(f, "server rejected request: HTTP {}", status),
            CupsError::NoUri => f.write_str("no CUPS URI configured"),
            CupsError::SegmentTooLong { declared, limit } => {
                write!(f, "segment of {} bytes exceeds limit of {}", declared, limit)
            }
            CupsError::TruncatedBody => f.write_str("response body ended mid-segment"),
            CupsError::BadSignature => f.write_str("update signature verification failed"),
            CupsError::Transfer => f.write_str("transfer failed"),
        }
    }
}

/// Concentrator HAL errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HalError {
    /// The HAL could not be started with the given chip configuration.
    Start,
    /// The HAL rejected a transmit packet.
    Send,
    /// A HAL register/FIFO operation failed.
    Device,
    /// The HAL has not been started.
    NotStarted,
}

impl std::error::Error for HalError {}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::Start => f.write_str("failed to start concentrator"),
            HalError::Send => f.write_str("failed to submit TX packet"),
            HalError::Device => f.write_str("concentrator device error"),
            HalError::NotStarted => f.write_str("concentrator not started"),
        }
    }
}

/// Radio abstraction layer errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RalError {
    /// A txunit index is out of range or its slave pipe is closed.
    NoSuchTxUnit {
        /// The offending index.
        txunit: u8,
    },
    /// The `hwspec` string names more chips than slave configs were found.
    HwspecMismatch,
    /// A record on the up-pipe carried an unknown command code.
    ProtocolDesync {
        /// The offending code byte.
        code: u8,
    },
    /// A pipe record would exceed `PIPE_BUF` and cannot be written atomically.
    RecordTooLong {
        /// Encoded record size.
        len: usize,
    },
    /// The slave process is gone and could not be restarted.
    SlaveDead,
}

impl std::error::Error for RalError {}

impl fmt::Display for RalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RalError::NoSuchTxUnit { txunit } => write!(f, "no usable txunit {}", txunit),
            RalError::HwspecMismatch => f.write_str("hwspec names more chips than configured"),
            RalError::ProtocolDesync { code } => {
                write!(f, "unknown record code {:#04x} on slave pipe", code)
            }
            RalError::RecordTooLong { len } => {
                write!(f, "record of {} bytes exceeds PIPE_BUF", len)
            }
            RalError::SlaveDead => f.write_str("slave process unrecoverable"),
        }
    }
}

/// Station configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// `station.conf` is missing or unreadable.
    Missing(std::path::PathBuf),
    /// A required field is absent or malformed.
    Field(&'static str),
    /// A gateway EUI failed to parse.
    Eui(String),
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(path) => write!(f, "missing config file {}", path.display()),
            ConfigError::Field(name) => write!(f, "bad or missing field `{}`", name),
            ConfigError::Eui(s) => write!(f, "unparseable EUI `{}`", s),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<lorastation_wire::WireError> for Error {
    fn from(e: lorastation_wire::WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<CupsError> for Error {
    fn from(e: CupsError) -> Self {
        Self::Cups(e)
    }
}

impl From<HalError> for Error {
    fn from(e: HalError) -> Self {
        Self::Hal(e)
    }
}

impl From<RalError> for Error {
    fn from(e: RalError) -> Self {
        Self::Ral(e)
    }
}

impl From<TimesyncError> for Error {
    fn from(e: TimesyncError) -> Self {
        Self::Timesync(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
