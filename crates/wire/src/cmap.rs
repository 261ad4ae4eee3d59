//! The cluster map: a versioned list of every MDS and OSD endpoint.
//!
//! Packed layout, all big-endian:
//!
//! ```text
//! epoch:   u64
//! num_osd: u32
//! num_mds: u32
//! osds:    (ip: u32, port: u16, pad: u16)[num_osd]
//! mdses:   (ip: u32, port: u16, pad: u16)[num_mds]
//! ```
//!
//! Epoch 1 is built from the parsed config file; later epochs arrive as
//! runtime updates. A map is immutable once constructed — holders swap the
//! whole map under their own lock, so readers always see one consistent
//! epoch.

use crate::error::WireError;
use crate::xdr::{self, Wire};
use bytes::{Buf, BufMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonInfo {
    pub ip: u32,
    pub port: u16,
    /// Whether the daemon is currently part of the cluster.
    pub is_in: bool,
}

impl DaemonInfo {
    pub fn new(ip: u32, port: u16) -> DaemonInfo {
        DaemonInfo {
            ip,
            port,
            is_in: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMap {
    pub epoch: u64,
    pub osds: Vec<DaemonInfo>,
    pub mdses: Vec<DaemonInfo>,
}

impl ClusterMap {
    pub fn new(epoch: u64, osds: Vec<DaemonInfo>, mdses: Vec<DaemonInfo>) -> ClusterMap {
        ClusterMap { epoch, osds, mdses }
    }

    pub fn num_osd(&self) -> usize {
        self.osds.len()
    }

    pub fn num_mds(&self) -> usize {
        self.mdses.len()
    }
}

fn encode_daemon<B: BufMut>(buf: &mut B, info: &DaemonInfo) {
    buf.put_u32(info.ip);
    buf.put_u16(info.port);
    buf.put_u16(0); // pad
}

fn decode_daemon<B: Buf>(buf: &mut B) -> Result<DaemonInfo, WireError> {
    let ip = xdr::get_u32(buf)?;
    let port = xdr::get_u16(buf)?;
    let _pad = xdr::get_u16(buf)?;
    Ok(DaemonInfo::new(ip, port))
}

impl Wire for ClusterMap {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.epoch);
        buf.put_u32(self.osds.len() as u32);
        buf.put_u32(self.mdses.len() as u32);
        for osd in &self.osds {
            encode_daemon(buf, osd);
        }
        for mds in &self.mdses {
            encode_daemon(buf, mds);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        let epoch = xdr::get_u64(buf)?;
        let num_osd = xdr::get_u32(buf)? as usize;
        let num_mds = xdr::get_u32(buf)? as usize;
        let mut osds = Vec::with_capacity(num_osd.min(1024));
        for _ in 0..num_osd {
            osds.push(decode_daemon(buf)?);
        }
        let mut mdses = Vec::with_capacity(num_mds.min(1024));
        for _ in 0..num_mds {
            mdses.push(decode_daemon(buf)?);
        }
        Ok(ClusterMap { epoch, osds, mdses })
    }
}
