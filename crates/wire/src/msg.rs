//! The message frame.
//!
//! Every message starts with a fixed 16-byte header:
//!
//! ```text
//! tran_id:     u32   receiver's transactor id, 0 = open a new transaction
//! rem_tran_id: u32   sender's transactor id, echoed back in replies
//! len:         u32   body length in bytes
//! type:        u16   message type tag
//! reserved:    u16   must be written as zero
//! ```
//!
//! All fields big-endian. The framing is the stable part of the protocol;
//! payload layouts may evolve behind new type tags.

use crate::error::WireError;
use crate::types::MsgType;
use crate::xdr::{self, Wire};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MSG_HDR_LEN: usize = 16;

/// Cap on a message body. A frame claiming more than this is malformed and
/// the connection carrying it is torn down.
pub const MSG_BODY_MAX: u32 = 64 << 20;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHdr {
    pub tran_id: u32,
    pub rem_tran_id: u32,
    pub len: u32,
    pub ty: u16,
}

impl MsgHdr {
    pub fn decode(raw: &[u8; MSG_HDR_LEN]) -> Result<MsgHdr, WireError> {
        let mut buf = &raw[..];
        let hdr = MsgHdr {
            tran_id: buf.get_u32(),
            rem_tran_id: buf.get_u32(),
            len: buf.get_u32(),
            ty: buf.get_u16(),
        };
        if hdr.len > MSG_BODY_MAX {
            return Err(WireError::BodyTooLarge(hdr.len));
        }
        Ok(hdr)
    }
}

/// A message, either built for sending or received off a connection.
///
/// The transactor id fields are filled in by the messenger just before the
/// frame hits the wire; application code only supplies the type and body.
#[derive(Debug, Clone)]
pub struct Msg {
    pub tran_id: u32,
    pub rem_tran_id: u32,
    pub ty: u16,
    pub data: Bytes,
}

impl Msg {
    pub fn new(ty: MsgType, data: Bytes) -> Msg {
        Msg {
            tran_id: 0,
            rem_tran_id: 0,
            ty: ty.into(),
            data,
        }
    }

    /// Build a message by packing `payload` as the body.
    pub fn from_payload<T: Wire>(ty: MsgType, payload: &T) -> Msg {
        Msg::new(ty, payload.to_bytes())
    }

    pub fn msg_type(&self) -> Result<MsgType, WireError> {
        MsgType::try_from(self.ty).map_err(|_| WireError::UnknownType(self.ty))
    }

    /// Unpack the body as `T`, after checking the type tag.
    pub fn payload<T: Wire>(&self, want: MsgType) -> Result<T, WireError> {
        if self.ty != u16::from(want) {
            return Err(WireError::WrongType {
                got: self.ty,
                want: want.into(),
            });
        }
        T::from_bytes(&self.data)
    }

    /// Every response type leads with a signed error field, so the error
    /// can be extracted without knowing the concrete type.
    pub fn resp_errno(&self) -> Result<i32, WireError> {
        let mut buf = self.data.clone();
        xdr::get_i32(&mut buf)
    }

    /// Serialize header + body into one contiguous frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MSG_HDR_LEN + self.data.len());
        buf.put_u32(self.tran_id);
        buf.put_u32(self.rem_tran_id);
        buf.put_u32(self.data.len() as u32);
        buf.put_u16(self.ty);
        buf.put_u16(0);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}
