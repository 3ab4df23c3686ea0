//! Builtin implementations for primitive types.

use crate::{WireError, WireRead, WireSized, WireWrite};

macro_rules! impl_primitive_wire_field {
    ($ty:ty, $size:expr) => {
        impl WireWrite for $ty {
            fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
                let chunk = &mut buf[0..$size];

                chunk.copy_from_slice(&self.to_le_bytes());

                chunk
            }

            fn packed_len(&self) -> usize {
                $size
            }
        }

        impl WireRead for $ty {
            fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
                buf.get(0..$size)
                    .ok_or(WireError::ReadBufferTooShort {
                        needed: $size,
                        got: buf.len(),
                    })
                    .and_then(|raw| raw.try_into().map_err(|_| WireError::InvalidValue))
                    .map(Self::from_le_bytes)
            }
        }

        impl WireSized for $ty {
            const PACKED_LEN: usize = $size;

            type Buffer = [u8; $size];

            fn pack(&self) -> Self::Buffer {
                self.to_le_bytes()
            }

            fn buffer() -> Self::Buffer {
                [0u8; $size]
            }
        }
    };
}

impl_primitive_wire_field!(u8, 1);
impl_primitive_wire_field!(u16, 2);
impl_primitive_wire_field!(u32, 4);
impl_primitive_wire_field!(u64, 8);
impl_primitive_wire_field!(i8, 1);
impl_primitive_wire_field!(i16, 2);
impl_primitive_wire_field!(i32, 4);
impl_primitive_wire_field!(i64, 8);
impl_primitive_wire_field!(f32, 4);
impl_primitive_wire_field!(f64, 8);

impl WireWrite for bool {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        buf[0] = *self as u8;

        &buf[0..1]
    }

    fn packed_len(&self) -> usize {
        1
    }
}

impl WireRead for bool {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        match buf.first() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            Some(_) => Err(WireError::InvalidValue),
            None => Err(WireError::ReadBufferTooShort { needed: 1, got: 0 }),
        }
    }
}

impl WireSized for bool {
    const PACKED_LEN: usize = 1;

    type Buffer = [u8; 1];

    fn pack(&self) -> Self::Buffer {
        [*self as u8; 1]
    }

    fn buffer() -> Self::Buffer {
        [0u8; 1]
    }
}

impl<const N: usize> WireWrite for [u8; N] {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..N];

        buf.copy_from_slice(self);

        buf
    }

    fn packed_len(&self) -> usize {
        N
    }
}

impl<const N: usize> WireRead for [u8; N] {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        buf.get(0..N)
            .ok_or(WireError::ReadBufferTooShort {
                needed: N,
                got: buf.len(),
            })
            .and_then(|raw| raw.try_into().map_err(|_| WireError::InvalidValue))
    }
}

impl<const N: usize> WireSized for [u8; N] {
    const PACKED_LEN: usize = N;

    type Buffer = [u8; N];

    fn pack(&self) -> Self::Buffer {
        *self
    }

    fn buffer() -> Self::Buffer {
        [0u8; N]
    }
}

impl WireWrite for &[u8] {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..self.len()];

        buf.copy_from_slice(self);

        buf
    }

    fn packed_len(&self) -> usize {
        self.len()
    }
}

// Blanket impl for references
impl<T> WireWrite for &T
where
    T: WireWrite,
{
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        WireWrite::pack_to_slice_unchecked(*self, buf)
    }

    fn packed_len(&self) -> usize {
        WireWrite::packed_len(*self)
    }
}

// Variable-length payloads ride at the end of a record; the record header
// carries the length, so decode of a `heapless::Vec` consumes the whole rest of
// the buffer.
impl<const N: usize> WireRead for heapless::Vec<u8, N> {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        heapless::Vec::from_slice(buf).map_err(|_| WireError::ReadBufferTooShort {
            needed: buf.len(),
            got: N,
        })
    }
}

impl<const N: usize> WireWrite for heapless::Vec<u8, N> {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..self.len()];

        buf.copy_from_slice(self);

        buf
    }

    fn packed_len(&self) -> usize {
        self.len()
    }
}
