//! Encode/decode error.

/// Wire encode/decode errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Not enough bytes in the source buffer to decode the requested field.
    ReadBufferTooShort {
        /// Bytes required by the field.
        needed: usize,
        /// Bytes available.
        got: usize,
    },
    /// The destination buffer cannot hold the packed representation.
    WriteBufferTooShort {
        /// Bytes required by the field.
        needed: usize,
        /// Bytes available.
        got: usize,
    },
    /// A decoded discriminant does not map to a known variant.
    InvalidValue,
}

impl std::error::Error for WireError {}

impl core::fmt::Display for WireError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WireError::ReadBufferTooShort { needed, got } => {
                write!(f, "record too short: field needs {} bytes, {} left", needed, got)
            }
            WireError::WriteBufferTooShort { needed, got } => {
                write!(f, "buffer too short: need {} bytes, have {}", needed, got)
            }
            WireError::InvalidValue => f.write_str("invalid value for type"),
        }
    }
}
