//! Packing primitives: checked big-endian reads and length-prefixed
//! strings over [`bytes::Buf`] / [`bytes::BufMut`].

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound on a single packed string. Paths, user names and group
/// names all fit well under this.
pub const STR_MAX: usize = 4096;

fn need<B: Buf>(buf: &B, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8<B: Buf>(buf: &mut B) -> Result<u8, WireError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16<B: Buf>(buf: &mut B) -> Result<u16, WireError> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32<B: Buf>(buf: &mut B) -> Result<u32, WireError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64<B: Buf>(buf: &mut B) -> Result<u64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn get_i32<B: Buf>(buf: &mut B) -> Result<i32, WireError> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_i64<B: Buf>(buf: &mut B) -> Result<i64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

/// Pack a string as a u32 length prefix followed by the raw bytes.
pub fn put_str<B: BufMut>(buf: &mut B, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn get_str<B: Buf>(buf: &mut B) -> Result<String, WireError> {
    let len = get_u32(buf)? as usize;
    if len > STR_MAX {
        return Err(WireError::StringTooLong(len));
    }
    need(buf, len)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadUtf8)
}

/// Everything left in the buffer, for trailing-data payloads.
pub fn get_rest<B: Buf>(buf: &mut B) -> Bytes {
    let n = buf.remaining();
    buf.copy_to_bytes(n)
}

/// A record with a packed wire form.
///
/// Encoding is infallible (the buffer grows); decoding validates length
/// and content. Implementations pack fields in declaration order, all
/// big-endian.
pub trait Wire: Sized {
    fn encode<B: BufMut>(&self, buf: &mut B);

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    fn from_bytes(bytes: &Bytes) -> Result<Self, WireError> {
        let mut buf = bytes.clone();
        Self::decode(&mut buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_round_trip() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "alpha/beta");
        put_str(&mut buf, "");
        let mut rd = buf.freeze();
        assert_eq!(get_str(&mut rd).unwrap(), "alpha/beta");
        assert_eq!(get_str(&mut rd).unwrap(), "");
        assert!(!rd.has_remaining());
    }

    #[test]
    fn truncated_reads_fail() {
        let mut short = Bytes::from_static(&[0, 0]);
        assert!(matches!(
            get_u32(&mut short),
            Err(WireError::Truncated { .. })
        ));
        // A length prefix pointing past the end of the buffer.
        let mut buf = BytesMut::new();
        buf.put_u32(64);
        buf.put_slice(b"short");
        let mut rd = buf.freeze();
        assert!(matches!(get_str(&mut rd), Err(WireError::Truncated { .. })));
    }

    #[test]
    fn oversized_string_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((STR_MAX + 1) as u32);
        let mut rd = buf.freeze();
        assert!(matches!(
            get_str(&mut rd),
            Err(WireError::StringTooLong(_))
        ));
    }
}
