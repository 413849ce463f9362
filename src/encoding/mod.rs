//! Deterministic binary encoding for every on-disk structure.
//!
//! The [`Encode`] and [`Decode`] traits define a hand-written, byte-stable
//! wire format. Owning the format means the on-disk representation can
//! never drift underneath us because of a serialization-dependency
//! upgrade.
//!
//! # Wire format
//!
//! | Rust type         | Encoding                                      |
//! |-------------------|-----------------------------------------------|
//! | `u8`              | 1 byte                                        |
//! | `u16`/`u32`/`u64` | little-endian, fixed width                    |
//! | `i64`             | 8 bytes, little-endian                        |
//! | `bool`            | 1 byte (`0x00` / `0x01`)                      |
//! | `[u8; N]`         | `N` raw bytes, no length prefix               |
//! | `Vec<u8>`         | `[u32 len][bytes]`                            |
//! | `String`          | `[u32 len][utf-8 bytes]`                      |
//! | `Option<T>`       | `[u8 tag: 0/1][T if Some]`                    |
//! | sequences         | `[u32 count][T₀][T₁]…` via [`encode_seq`]     |
//! | enums             | `[u32 variant][fields…]`, hand-written        |
//!
//! # Decode-side safety
//!
//! Variable-length decoders enforce [`MAX_BYTE_LEN`] and
//! [`MAX_SEQ_ELEMENTS`] so a corrupted length field cannot trigger an
//! allocation bomb. No code path in this module panics; all failures are
//! reported through [`EncodingError`].

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Upper bound on a single decoded byte string (covers keys, values, and
/// whole serialized blocks). 64 MiB.
pub const MAX_BYTE_LEN: u32 = 64 * 1024 * 1024;

/// Upper bound on the element count of a decoded sequence. 8 M entries.
pub const MAX_SEQ_ELEMENTS: u32 = 8 * 1024 * 1024;

/// Errors produced while encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ended before decoding completed.
    #[error("short buffer: need {needed} bytes, have {available}")]
    ShortBuffer {
        /// Bytes required to continue.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// An enum discriminant was not recognised.
    #[error("invalid tag {tag} while decoding {type_name}")]
    InvalidTag {
        /// The tag value read from the buffer.
        tag: u32,
        /// The type being decoded.
        type_name: &'static str,
    },

    /// A bool byte was neither `0x00` nor `0x01`.
    #[error("invalid bool byte 0x{0:02X}")]
    InvalidBool(u8),

    /// A decoded string was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length or count field exceeded its safety cap.
    #[error("length limit exceeded: {0}")]
    LengthLimit(String),
}

/// Serialize `self` by appending to a byte buffer.
///
/// Implementations must be deterministic: the same logical value always
/// produces the same bytes.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the start of a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can walk a buffer that
/// contains several encoded items back to back.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encode a value into a fresh `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`, returning it together with
/// the number of bytes consumed.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

#[inline]
fn ensure(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        return Err(EncodingError::ShortBuffer {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

#[inline]
fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len).map_err(|_| EncodingError::LengthLimit(format!("{len} exceeds u32::MAX")))
}

// ------------------------------------------------------------------------------------------------
// Fixed-width primitives
// ------------------------------------------------------------------------------------------------

macro_rules! impl_le_int {
    ($t:ty, $n:expr) => {
        impl Encode for $t {
            #[inline]
            fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                buf.extend_from_slice(&self.to_le_bytes());
                Ok(())
            }
        }

        impl Decode for $t {
            #[inline]
            fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                ensure(buf, $n)?;
                let mut bytes = [0u8; $n];
                bytes.copy_from_slice(&buf[..$n]);
                Ok((<$t>::from_le_bytes(bytes), $n))
            }
        }
    };
}

impl_le_int!(u16, 2);
impl_le_int!(u32, 4);
impl_le_int!(u64, 8);
impl_le_int!(i64, 8);

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        ensure(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        ensure(buf, 1)?;
        match buf[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        ensure(buf, N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(&buf[..N]);
        Ok((arr, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Variable-length byte strings
// ------------------------------------------------------------------------------------------------

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

impl Encode for &[u8] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, mut off) = u32::decode_from(buf)?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthLimit(format!(
                "byte string length {len} exceeds cap {MAX_BYTE_LEN}"
            )));
        }
        let len = len as usize;
        ensure(&buf[off..], len)?;
        let data = buf[off..off + len].to_vec();
        off += len;
        Ok((data, off))
    }
}

impl Encode for String {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_bytes().encode_to(buf)
    }
}

impl Encode for &str {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_bytes().encode_to(buf)
    }
}

impl Decode for String {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (raw, consumed) = Vec::<u8>::decode_from(buf)?;
        Ok((String::from_utf8(raw)?, consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Option<T>
// ------------------------------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => buf.push(0),
            Some(inner) => {
                buf.push(1);
                inner.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Option<T> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        ensure(buf, 1)?;
        match buf[0] {
            0 => Ok((None, 1)),
            1 => {
                let (inner, consumed) = T::decode_from(&buf[1..])?;
                Ok((Some(inner), 1 + consumed))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other as u32,
                type_name: "Option<T>",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Sequences of structs
//
// `Vec<u8>` already has a byte-string encoding, so coherence forbids a
// blanket `Vec<T>` impl. Struct sequences go through these free
// functions instead.
// ------------------------------------------------------------------------------------------------

/// Encode a slice as `[u32 count][T₀][T₁]…`.
pub fn encode_seq<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(items.len())?.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decode a sequence written by [`encode_seq`]. The element count is
/// capped at [`MAX_SEQ_ELEMENTS`].
pub fn decode_seq<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut off) = u32::decode_from(buf)?;
    if count > MAX_SEQ_ELEMENTS {
        return Err(EncodingError::LengthLimit(format!(
            "sequence length {count} exceeds cap {MAX_SEQ_ELEMENTS}"
        )));
    }
    let count = count as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let (item, consumed) = T::decode_from(&buf[off..])?;
        off += consumed;
        items.push(item);
    }
    Ok((items, off))
}
