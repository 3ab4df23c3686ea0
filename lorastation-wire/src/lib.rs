//! Traits used to pack/unpack the fixed-layout records exchanged between the
//! lorastation master process and its concentrator slave processes.
//!
//! Records are little-endian and at most `PIPE_BUF` bytes long so that a single
//! `write(2)` on the pipe is atomic. The framing itself (command codes, length
//! fields, reassembly of partial reads) lives in the main crate; this crate only
//! knows how to move primitive fields in and out of byte buffers.

#![deny(missing_docs)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

mod error;
mod impls;

pub use error::WireError;

/// A type that can be unpacked from a pipe record (packed fields, little endian).
pub trait WireRead: Sized {
    /// Unpack this type from the beginning of the given buffer.
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError>;
}

/// A type that can be packed into a pipe record (packed fields, little endian).
pub trait WireWrite {
    /// Pack the type and write it into the beginning of `buf`.
    ///
    /// # Panics
    ///
    /// This method must panic if `buf` is too short to hold the packed data.
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8];

    /// Get the length in bytes of this item when packed.
    fn packed_len(&self) -> usize;

    /// Pack the type and write it into the beginning of `buf`, checking the
    /// buffer is long enough first.
    fn pack_to_slice<'buf>(&self, buf: &'buf mut [u8]) -> Result<&'buf [u8], WireError> {
        if buf.len() < self.packed_len() {
            return Err(WireError::WriteBufferTooShort {
                needed: self.packed_len(),
                got: buf.len(),
            });
        }

        Ok(self.pack_to_slice_unchecked(buf))
    }
}

/// Implemented for types with a known packed size at compile time.
pub trait WireSized: WireRead + WireWrite {
    /// Packed size in bytes.
    const PACKED_LEN: usize;

    /// Used to define an array of the correct length. This type should ALWAYS be
    /// of the form `[u8; N]` where `N` matches [`PACKED_LEN`](WireSized::PACKED_LEN).
    type Buffer: AsRef<[u8]> + AsMut<[u8]>;

    /// Pack this item to a fixed sized array.
    fn pack(&self) -> Self::Buffer;

    /// Create a zeroed buffer sized to hold the packed representation.
    fn buffer() -> Self::Buffer;
}

/// A cursor over a record buffer, consuming fields front to back.
///
/// Keeps the field-by-field decode in the main crate free of offset arithmetic.
pub struct WireCursor<'buf> {
    buf: &'buf [u8],
}

impl<'buf> WireCursor<'buf> {
    /// Create a cursor over `buf`.
    pub fn new(buf: &'buf [u8]) -> Self {
        Self { buf }
    }

    /// Consume and decode the next fixed-size field.
    pub fn take<T: WireSized>(&mut self) -> Result<T, WireError> {
        let value = T::unpack_from_slice(self.buf)?;

        self.buf = &self.buf[T::PACKED_LEN..];

        Ok(value)
    }

    /// Consume the next `len` raw bytes.
    pub fn take_bytes(&mut self, len: usize) -> Result<&'buf [u8], WireError> {
        let chunk = self.buf.get(0..len).ok_or(WireError::ReadBufferTooShort {
            needed: len,
            got: self.buf.len(),
        })?;

        self.buf = &self.buf[len..];

        Ok(chunk)
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// The writing counterpart of [`WireCursor`].
pub struct WireWriter<'buf> {
    buf: &'buf mut [u8],
    written: usize,
}

impl<'buf> WireWriter<'buf> {
    /// Create a writer over `buf`.
    pub fn new(buf: &'buf mut [u8]) -> Self {
        Self { buf, written: 0 }
    }

    /// Append a field to the record.
    pub fn put<T: WireWrite>(&mut self, value: &T) -> Result<(), WireError> {
        let rest = &mut self.buf[self.written..];

        value.pack_to_slice(rest)?;

        self.written += value.packed_len();

        Ok(())
    }

    /// Append raw bytes to the record.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let buf_len = self.buf.len();
        let rest = self
            .buf
            .get_mut(self.written..self.written + bytes.len())
            .ok_or(WireError::WriteBufferTooShort {
                needed: self.written + bytes.len(),
                got: buf_len,
            })?;

        rest.copy_from_slice(bytes);

        self.written += bytes.len();

        Ok(())
    }

    /// Total bytes written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cursor_walks_fields() {
        let mut buf = [0u8; 16];

        let mut w = WireWriter::new(&mut buf);
        w.put(&0x1122u16).unwrap();
        w.put(&-5i32).unwrap();
        w.put_bytes(&[0xaa, 0xbb]).unwrap();

        assert_eq!(w.written(), 8);

        let mut c = WireCursor::new(&buf);
        assert_eq!(c.take::<u16>().unwrap(), 0x1122);
        assert_eq!(c.take::<i32>().unwrap(), -5);
        assert_eq!(c.take_bytes(2).unwrap(), &[0xaa, 0xbb]);
        assert_eq!(c.remaining(), 8);
    }

    #[test]
    fn short_read_is_an_error() {
        let buf = [0u8; 3];

        let mut c = WireCursor::new(&buf);

        assert_eq!(
            c.take::<u32>(),
            Err(WireError::ReadBufferTooShort { needed: 4, got: 3 })
        );
    }
}
