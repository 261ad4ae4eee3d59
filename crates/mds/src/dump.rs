//! Human-readable listing of a metadata store, in key order.

use crate::mstor::{MstorError, NodeRec};
use std::io::Write;
use wire::types::Endpoint;
use wire::xdr::{self, Wire};

fn be64(raw: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    let n = raw.len().min(8);
    arr[..n].copy_from_slice(&raw[..n]);
    u64::from_be_bytes(arr)
}

pub(crate) fn dump_tree(db: &sled::Db, w: &mut dyn Write) -> Result<(), MstorError> {
    for item in db.iter() {
        let (key, val) = item?;
        if key.is_empty() {
            continue;
        }
        match key[0] {
            b'n' if key.len() == 9 => {
                let nid = be64(&key[1..9]);
                let mut buf = &val[..];
                match NodeRec::decode(&mut buf) {
                    Ok(node) => writeln!(
                        w,
                        "node {:#x}: mode {:#o} owner {} group {} mtime {} atime {}",
                        nid,
                        node.mode_and_type,
                        node.owner,
                        node.group,
                        node.mtime,
                        node.atime
                    )?,
                    Err(_) => writeln!(w, "node {:#x}: (corrupt record)", nid)?,
                }
            }
            b'c' if key.len() > 9 => {
                let parent = be64(&key[1..9]);
                let name = String::from_utf8_lossy(&key[9..]);
                writeln!(w, "child {:#x}/{} -> {:#x}", parent, name, be64(&val))?;
            }
            b'f' if key.len() == 17 => {
                let nid = be64(&key[1..9]);
                let off = be64(&key[9..17]);
                writeln!(w, "file {:#x} @ {} -> chunk {:#x}", nid, off, be64(&val))?;
            }
            b'h' if key.len() == 9 => {
                let cid = be64(&key[1..9]);
                write!(w, "chunk {:#x}:", cid)?;
                let mut buf = &val[..];
                if let Ok(n) = xdr::get_u32(&mut buf) {
                    for _ in 0..n {
                        match Endpoint::decode(&mut buf) {
                            Ok(ep) => write!(
                                w,
                                " {}.{}.{}.{}:{}",
                                (ep.ip >> 24) & 0xff,
                                (ep.ip >> 16) & 0xff,
                                (ep.ip >> 8) & 0xff,
                                ep.ip & 0xff,
                                ep.port
                            )?,
                            Err(_) => {
                                write!(w, " (corrupt endpoint)")?;
                                break;
                            }
                        }
                    }
                }
                writeln!(w)?;
            }
            other => {
                writeln!(w, "unknown key class {:#x} ({} bytes)", other, key.len())?;
            }
        }
    }
    Ok(())
}
