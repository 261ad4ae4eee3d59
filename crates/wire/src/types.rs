//! Message type registry and payload records.
//!
//! Tags are grouped by direction: 1xxx client→MDS, 2xxx MDS→client,
//! 3xxx client→OSD, 4xxx OSD→client. 30/31 are the loopback test pair.
//! A tag is never reused for a different layout.

use crate::error::WireError;
use crate::xdr::{self, Wire};
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MsgType {
    // client → MDS
    MkdirsReq = 1001,
    LocateReq = 1002,
    StatReq = 1003,
    GetMdsStatusReq = 1004,
    // MDS → client
    GenericResp = 2001,
    LocateResp = 2002,
    StatResp = 2003,
    MdsStatus = 2004,
    // client → OSD
    OsdHflushReq = 3001,
    OsdReadReq = 3002,
    // OSD → client
    OsdReadResp = 4001,
    // loopback tests
    Test30 = 30,
    Test31 = 31,
}

/// `(ip, port)` pair addressing a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: u32,
    pub port: u16,
}

impl Wire for Endpoint {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.ip);
        buf.put_u16(self.port);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(Endpoint {
            ip: xdr::get_u32(buf)?,
            port: xdr::get_u16(buf)?,
        })
    }
}

/// The response format every other response embeds as its first field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericResp {
    pub error: i32,
}

impl GenericResp {
    pub fn ok() -> GenericResp {
        GenericResp { error: 0 }
    }
}

impl Wire for GenericResp {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.error);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(GenericResp {
            error: xdr::get_i32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkdirsReq {
    pub user: String,
    pub group: String,
    pub path: String,
    pub mode: u16,
    pub ctime: i64,
}

impl Wire for MkdirsReq {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        xdr::put_str(buf, &self.user);
        xdr::put_str(buf, &self.group);
        xdr::put_str(buf, &self.path);
        buf.put_u16(self.mode);
        buf.put_i64(self.ctime);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(MkdirsReq {
            user: xdr::get_str(buf)?,
            group: xdr::get_str(buf)?,
            path: xdr::get_str(buf)?,
            mode: xdr::get_u16(buf)?,
            ctime: xdr::get_i64(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateReq {
    pub user: String,
    pub group: String,
    pub path: String,
    pub start: u64,
    pub len: u64,
}

impl Wire for LocateReq {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        xdr::put_str(buf, &self.user);
        xdr::put_str(buf, &self.group);
        xdr::put_str(buf, &self.path);
        buf.put_u64(self.start);
        buf.put_u64(self.len);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(LocateReq {
            user: xdr::get_str(buf)?,
            group: xdr::get_str(buf)?,
            path: xdr::get_str(buf)?,
            start: xdr::get_u64(buf)?,
            len: xdr::get_u64(buf)?,
        })
    }
}

/// One located extent: a byte range and the endpoints holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLoc {
    pub start: u64,
    pub len: u64,
    pub eps: Vec<Endpoint>,
}

impl Wire for BlockLoc {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.start);
        buf.put_u64(self.len);
        buf.put_u32(self.eps.len() as u32);
        for ep in &self.eps {
            ep.encode(buf);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        let start = xdr::get_u64(buf)?;
        let len = xdr::get_u64(buf)?;
        let n = xdr::get_u32(buf)? as usize;
        let mut eps = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            eps.push(Endpoint::decode(buf)?);
        }
        Ok(BlockLoc { start, len, eps })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateResp {
    pub error: i32,
    pub locs: Vec<BlockLoc>,
}

impl Wire for LocateResp {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.error);
        buf.put_u32(self.locs.len() as u32);
        for loc in &self.locs {
            loc.encode(buf);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        let error = xdr::get_i32(buf)?;
        let n = xdr::get_u32(buf)? as usize;
        let mut locs = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            locs.push(BlockLoc::decode(buf)?);
        }
        Ok(LocateResp { error, locs })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatReq {
    pub user: String,
    pub group: String,
    pub path: String,
}

impl Wire for StatReq {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        xdr::put_str(buf, &self.user);
        xdr::put_str(buf, &self.group);
        xdr::put_str(buf, &self.path);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(StatReq {
            user: xdr::get_str(buf)?,
            group: xdr::get_str(buf)?,
            path: xdr::get_str(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FishStat {
    pub length: u64,
    pub mode_and_type: u16,
    pub mtime: i64,
    pub atime: i64,
    pub owner: String,
    pub group: String,
    pub block_sz: u32,
    pub repl: u32,
    pub nid: u64,
}

impl Wire for FishStat {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.length);
        buf.put_u16(self.mode_and_type);
        buf.put_i64(self.mtime);
        buf.put_i64(self.atime);
        xdr::put_str(buf, &self.owner);
        xdr::put_str(buf, &self.group);
        buf.put_u32(self.block_sz);
        buf.put_u32(self.repl);
        buf.put_u64(self.nid);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(FishStat {
            length: xdr::get_u64(buf)?,
            mode_and_type: xdr::get_u16(buf)?,
            mtime: xdr::get_i64(buf)?,
            atime: xdr::get_i64(buf)?,
            owner: xdr::get_str(buf)?,
            group: xdr::get_str(buf)?,
            block_sz: xdr::get_u32(buf)?,
            repl: xdr::get_u32(buf)?,
            nid: xdr::get_u64(buf)?,
        })
    }
}

/// The stat body is only present when `error == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatResp {
    pub error: i32,
    pub stat: Option<FishStat>,
}

impl Wire for StatResp {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.error);
        if let Some(stat) = &self.stat {
            stat.encode(buf);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        let error = xdr::get_i32(buf)?;
        let stat = if error == 0 {
            Some(FishStat::decode(buf)?)
        } else {
            None
        };
        Ok(StatResp { error, stat })
    }
}

/// Append `data` to chunk `cid` and commit it. The data rides as the
/// trailing bytes of the frame, not length-prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdHflushReq {
    pub cid: u64,
    pub flags: u32,
    pub data: Bytes,
}

impl Wire for OsdHflushReq {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.cid);
        buf.put_u32(self.flags);
        buf.put_slice(&self.data);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(OsdHflushReq {
            cid: xdr::get_u64(buf)?,
            flags: xdr::get_u32(buf)?,
            data: xdr::get_rest(buf),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsdReadReq {
    pub cid: u64,
    pub start: u64,
    pub len: u32,
}

impl Wire for OsdReadReq {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.cid);
        buf.put_u64(self.start);
        buf.put_u32(self.len);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(OsdReadReq {
            cid: xdr::get_u64(buf)?,
            start: xdr::get_u64(buf)?,
            len: xdr::get_u32(buf)?,
        })
    }
}

/// Chunk bytes ride as the trailing bytes of the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdReadResp {
    pub error: i32,
    pub data: Bytes,
}

impl Wire for OsdReadResp {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.error);
        buf.put_slice(&self.data);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(OsdReadResp {
            error: xdr::get_i32(buf)?,
            data: xdr::get_rest(buf),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetMdsStatusReq;

impl Wire for GetMdsStatusReq {
    fn encode<B: BufMut>(&self, _buf: &mut B) {}

    fn decode<B: Buf>(_buf: &mut B) -> Result<Self, WireError> {
        Ok(GetMdsStatusReq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdsStatus {
    pub pri_mid: u16,
}

impl Wire for MdsStatus {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.pri_mid);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(MdsStatus {
            pri_mid: xdr::get_u16(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Test30 {
    pub x: u32,
    pub y: u32,
}

impl Wire for Test30 {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.x);
        buf.put_u32(self.y);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(Test30 {
            x: xdr::get_u32(buf)?,
            y: xdr::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Test31 {
    pub z: u32,
}

impl Wire for Test31 {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.z);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(Test31 {
            z: xdr::get_u32(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_resp_round_trip() {
        let resp = LocateResp {
            error: 0,
            locs: vec![
                BlockLoc {
                    start: 0,
                    len: 65536,
                    eps: vec![
                        Endpoint {
                            ip: 0x7f000001,
                            port: 7101,
                        },
                        Endpoint {
                            ip: 0x7f000001,
                            port: 7102,
                        },
                    ],
                },
                BlockLoc {
                    start: 65536,
                    len: 100,
                    eps: vec![],
                },
            ],
        };
        assert_eq!(LocateResp::from_bytes(&resp.to_bytes()).unwrap(), resp);
    }

    #[test]
    fn stat_resp_omits_body_on_error() {
        let resp = StatResp {
            error: crate::Ferr::NoEnt.code(),
            stat: None,
        };
        let raw = resp.to_bytes();
        assert_eq!(raw.len(), 4);
        assert_eq!(StatResp::from_bytes(&raw).unwrap(), resp);
    }

    #[test]
    fn hflush_carries_trailing_data() {
        let req = OsdHflushReq {
            cid: 0x123,
            flags: 0,
            data: Bytes::from_static(b"1234567890"),
        };
        let back = OsdHflushReq::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(back, req);
        assert_eq!(&back.data[..], b"1234567890");
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(MsgType::try_from(0xfffe_u16).is_err());
    }
}
