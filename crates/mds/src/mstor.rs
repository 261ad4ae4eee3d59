//! The metadata store: inodes, directory edges and chunk maps on an
//! ordered key/value engine.
//!
//! Storage scheme (all integers big-endian):
//!
//! ```text
//! 'n' nid:u64            -> node record
//! 'c' parent:u64 name    -> child nid:u64
//! 'f' nid:u64 offset:u64 -> chunk id:u64
//! 'h' cid:u64            -> endpoint list (u32 count, then ip:u32 port:u16)
//! ```
//!
//! Every operation starts from the root node and walks one path
//! component at a time, checking execute permission on each directory it
//! passes through. Node creation writes the directory edge and the node
//! record in one atomic batch.

use bytes::{Buf, BufMut};
use fishconfig::MstorConf;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};
use wire::types::{BlockLoc, Endpoint, FishStat};
use wire::xdr::{self, Wire};
use wire::{Ferr, WireError};

pub const ROOT_NID: u64 = 0;

/// Node ids at or above this are never handed out; running into the
/// ceiling is fatal for the MDS.
pub const NID_MAX: u64 = 0xffff_ffff_0000_0000;

pub const IS_DIR: u16 = 0x8000;
pub const PERM_EXEC: u16 = 0o1;
pub const PERM_WRITE: u16 = 0o2;
pub const PERM_READ: u16 = 0o4;

const ROOT_INIT_MODE: u16 = 0o755 | IS_DIR;
const PATH_COMPONENT_MAX: usize = 255;

/// Nominal chunk size; chunk_find reports extents in these units.
pub const BLOCK_SZ: u32 = 64 << 20;

pub const SUPERUSER: &str = "superuser";

#[derive(Debug, Error)]
pub enum MstorError {
    #[error("{0}")]
    Errno(Ferr),

    #[error("storage engine error: {0}")]
    Db(#[from] sled::Error),

    #[error("corrupt record: {0}")]
    Corrupt(#[from] WireError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node id space exhausted")]
    NidExhausted,
}

impl From<Ferr> for MstorError {
    fn from(e: Ferr) -> MstorError {
        MstorError::Errno(e)
    }
}

impl MstorError {
    /// The code to put in a generic response.
    pub fn errno(&self) -> Ferr {
        match self {
            MstorError::Errno(e) => *e,
            MstorError::Db(_) | MstorError::Corrupt(_) | MstorError::Io(_) => Ferr::Io,
            MstorError::NidExhausted => Ferr::Overflow,
        }
    }
}

/// Identity attached to every metadata request.
#[derive(Debug, Clone, Copy)]
pub struct MstorReq<'a> {
    pub user: &'a str,
    pub group: &'a str,
}

/// The packed node record stored under `'n' nid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRec {
    pub mode_and_type: u16,
    pub mtime: i64,
    pub atime: i64,
    pub owner: String,
    pub group: String,
}

impl NodeRec {
    pub fn is_dir(&self) -> bool {
        self.mode_and_type & IS_DIR != 0
    }
}

impl Wire for NodeRec {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.mode_and_type);
        buf.put_i64(self.mtime);
        buf.put_i64(self.atime);
        xdr::put_str(buf, &self.owner);
        xdr::put_str(buf, &self.group);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(NodeRec {
            mode_and_type: xdr::get_u16(buf)?,
            mtime: xdr::get_i64(buf)?,
            atime: xdr::get_i64(buf)?,
            owner: xdr::get_str(buf)?,
            group: xdr::get_str(buf)?,
        })
    }
}

pub(crate) fn nid_key(nid: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'n');
    key.extend_from_slice(&nid.to_be_bytes());
    key
}

pub(crate) fn child_key(parent: u64, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + name.len());
    key.push(b'c');
    key.extend_from_slice(&parent.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

pub(crate) fn file_key(nid: u64, offset: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(b'f');
    key.extend_from_slice(&nid.to_be_bytes());
    key.extend_from_slice(&offset.to_be_bytes());
    key
}

pub(crate) fn chunk_key(cid: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'h');
    key.extend_from_slice(&cid.to_be_bytes());
    key
}

fn be64(raw: &[u8]) -> Result<u64, MstorError> {
    let arr: [u8; 8] = raw
        .try_into()
        .map_err(|_| MstorError::Corrupt(WireError::Truncated {
            needed: 8,
            remaining: raw.len(),
        }))?;
    Ok(u64::from_be_bytes(arr))
}

/// Split and canonicalize an absolute path: duplicate and trailing
/// slashes collapse away.
fn path_components(path: &str) -> Result<Vec<&str>, Ferr> {
    if !path.starts_with('/') {
        return Err(Ferr::NotSup);
    }
    let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    for comp in &comps {
        if comp.len() > PATH_COMPONENT_MAX {
            return Err(Ferr::NameTooLong);
        }
    }
    Ok(comps)
}

pub struct Mstor {
    db: sled::Db,
    conf: MstorConf,
    next_nid: AtomicU64,
}

impl Mstor {
    pub fn open(conf: &MstorConf) -> Result<Mstor, MstorError> {
        if !conf.create && !conf.path.exists() {
            return Err(Ferr::NoEnt.into());
        }
        let db = sled::Config::new()
            .path(&conf.path)
            .cache_capacity(conf.cache_mb * 1024 * 1024)
            .open()?;
        let mstor = Mstor {
            db,
            conf: conf.clone(),
            next_nid: AtomicU64::new(ROOT_NID + 1),
        };
        mstor.setup()?;
        Ok(mstor)
    }

    /// Seed `next_nid` from the highest node record on disk, creating the
    /// root node on a fresh store.
    fn setup(&self) -> Result<(), MstorError> {
        if let Some((key, _)) = self.db.get_lt(nid_key(NID_MAX))? {
            if key.len() == 9 && key[0] == b'n' {
                let highest = be64(&key[1..])?;
                self.next_nid.store(highest + 1, Ordering::SeqCst);
                debug!(next_nid = highest + 1, "using existing mstor");
                return Ok(());
            }
        }
        info!("setting up new mstor");
        let now = unix_now();
        let root = NodeRec {
            mode_and_type: ROOT_INIT_MODE,
            mtime: now,
            atime: now,
            owner: SUPERUSER.to_string(),
            group: SUPERUSER.to_string(),
        };
        self.db.insert(nid_key(ROOT_NID), root.to_bytes().as_ref())?;
        self.db.flush()?;
        self.next_nid.store(ROOT_NID + 1, Ordering::SeqCst);
        Ok(())
    }

    fn alloc_nid(&self) -> Result<u64, MstorError> {
        let nid = self.next_nid.fetch_add(1, Ordering::SeqCst);
        if nid >= NID_MAX {
            return Err(MstorError::NidExhausted);
        }
        Ok(nid)
    }

    fn fetch_node(&self, nid: u64) -> Result<NodeRec, MstorError> {
        match self.db.get(nid_key(nid))? {
            None => Err(Ferr::NoEnt.into()),
            Some(raw) => {
                let mut buf = &raw[..];
                Ok(NodeRec::decode(&mut buf)?)
            }
        }
    }

    fn fetch_child_nid(&self, parent: u64, name: &str) -> Result<Option<u64>, MstorError> {
        match self.db.get(child_key(parent, name))? {
            None => Ok(None),
            Some(raw) => Ok(Some(be64(&raw)?)),
        }
    }

    /// Permission check for one access bit: world bit first, then the
    /// owner bits, then the group bits. `want_dir` also enforces the
    /// node type.
    fn mode_check(
        node: &NodeRec,
        req: &MstorReq<'_>,
        perm: u16,
        want_dir: Option<bool>,
    ) -> Result<(), Ferr> {
        match want_dir {
            Some(true) if !node.is_dir() => return Err(Ferr::NotDir),
            Some(false) if node.is_dir() => return Err(Ferr::IsDir),
            _ => {}
        }
        if req.user == SUPERUSER {
            return Ok(());
        }
        let mode = node.mode_and_type & !IS_DIR;
        if mode & perm != 0 {
            return Ok(());
        }
        if req.user == node.owner && (mode >> 6) & perm != 0 {
            return Ok(());
        }
        if req.group == node.group && (mode >> 3) & perm != 0 {
            return Ok(());
        }
        Err(Ferr::Perm)
    }

    /// Walk `comps` from the root, enforcing traversal permission on
    /// every directory passed through.
    fn resolve(&self, req: &MstorReq<'_>, comps: &[&str]) -> Result<(u64, NodeRec), MstorError> {
        let mut nid = ROOT_NID;
        let mut node = self.fetch_node(ROOT_NID)?;
        for comp in comps {
            Self::mode_check(&node, req, PERM_EXEC, Some(true))?;
            let cnid = self
                .fetch_child_nid(nid, comp)?
                .ok_or(Ferr::NoEnt)?;
            node = self.fetch_node(cnid)?;
            nid = cnid;
        }
        Ok((nid, node))
    }

    /// Create a node: one atomic batch covering the directory edge and
    /// the node record.
    fn make_node(
        &self,
        req: &MstorReq<'_>,
        mode_and_type: u16,
        ctime: i64,
        parent: u64,
        name: &str,
    ) -> Result<(u64, NodeRec), MstorError> {
        let nid = self.alloc_nid()?;
        let rec = NodeRec {
            mode_and_type,
            mtime: ctime,
            atime: ctime,
            owner: req.user.to_string(),
            group: req.group.to_string(),
        };
        let mut batch = sled::Batch::default();
        batch.insert(child_key(parent, name), &nid.to_be_bytes()[..]);
        batch.insert(nid_key(nid), rec.to_bytes().as_ref());
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok((nid, rec))
    }

    /// Create a directory chain, making missing intermediates with the
    /// requested mode. Succeeds if the full path already exists as a
    /// directory.
    pub fn mkdirs(
        &self,
        req: &MstorReq<'_>,
        path: &str,
        mode: u16,
        ctime: i64,
    ) -> Result<(), MstorError> {
        let comps = path_components(path)?;
        let mut nid = ROOT_NID;
        let mut node = self.fetch_node(ROOT_NID)?;
        for comp in comps {
            Self::mode_check(&node, req, PERM_EXEC, Some(true))?;
            match self.fetch_child_nid(nid, comp)? {
                Some(cnid) => {
                    node = self.fetch_node(cnid)?;
                    nid = cnid;
                }
                None => {
                    let (cnid, cnode) =
                        self.make_node(req, (mode & 0o7777) | IS_DIR, ctime, nid, comp)?;
                    node = cnode;
                    nid = cnid;
                }
            }
        }
        if !node.is_dir() {
            return Err(Ferr::NotDir.into());
        }
        Ok(())
    }

    /// Create a regular file. The final component must not exist.
    pub fn creat(
        &self,
        req: &MstorReq<'_>,
        path: &str,
        mode: u16,
        ctime: i64,
    ) -> Result<u64, MstorError> {
        let comps = path_components(path)?;
        let Some((name, dir)) = comps.split_last() else {
            return Err(Ferr::Exist.into());
        };
        let (pnid, pnode) = self.resolve(req, dir)?;
        Self::mode_check(&pnode, req, PERM_EXEC, Some(true))?;
        if self.fetch_child_nid(pnid, name)?.is_some() {
            return Err(Ferr::Exist.into());
        }
        let (nid, _) = self.make_node(req, mode & 0o7777, ctime, pnid, name)?;
        Ok(nid)
    }

    pub fn stat(&self, req: &MstorReq<'_>, path: &str) -> Result<FishStat, MstorError> {
        let comps = path_components(path)?;
        let (nid, node) = self.resolve(req, &comps)?;
        let length = if node.is_dir() {
            0
        } else {
            // Allocated length: one nominal block per mapped chunk.
            match self.last_chunk_offset(nid)? {
                Some(off) => off + BLOCK_SZ as u64,
                None => 0,
            }
        };
        Ok(FishStat {
            length,
            mode_and_type: node.mode_and_type,
            mtime: node.mtime,
            atime: node.atime,
            owner: node.owner,
            group: node.group,
            block_sz: BLOCK_SZ,
            repl: self.conf.man_repl,
            nid,
        })
    }

    /// Names and node ids of a directory's children, in name order.
    pub fn listdir(
        &self,
        req: &MstorReq<'_>,
        path: &str,
    ) -> Result<Vec<(String, u64)>, MstorError> {
        let comps = path_components(path)?;
        let (nid, node) = self.resolve(req, &comps)?;
        Self::mode_check(&node, req, PERM_READ, Some(true))?;
        let mut entries = Vec::new();
        let prefix = {
            let mut p = Vec::with_capacity(9);
            p.push(b'c');
            p.extend_from_slice(&nid.to_be_bytes());
            p
        };
        for item in self.db.scan_prefix(&prefix) {
            let (key, val) = item?;
            let name = String::from_utf8_lossy(&key[9..]).into_owned();
            entries.push((name, be64(&val)?));
        }
        Ok(entries)
    }

    /// Change permission bits; only the owner (or the superuser) may.
    pub fn chmod(&self, req: &MstorReq<'_>, path: &str, mode: u16) -> Result<(), MstorError> {
        self.update_node(req, path, true, |node| {
            node.mode_and_type = (node.mode_and_type & IS_DIR) | (mode & 0o7777);
        })
    }

    /// Change ownership; superuser only.
    pub fn chown(
        &self,
        req: &MstorReq<'_>,
        path: &str,
        owner: &str,
        group: &str,
    ) -> Result<(), MstorError> {
        if req.user != SUPERUSER {
            return Err(Ferr::Perm.into());
        }
        self.update_node(req, path, false, |node| {
            node.owner = owner.to_string();
            node.group = group.to_string();
        })
    }

    /// Set the node's timestamps; owner or superuser.
    pub fn utimes(
        &self,
        req: &MstorReq<'_>,
        path: &str,
        mtime: i64,
        atime: i64,
    ) -> Result<(), MstorError> {
        self.update_node(req, path, true, |node| {
            node.mtime = mtime;
            node.atime = atime;
        })
    }

    fn update_node(
        &self,
        req: &MstorReq<'_>,
        path: &str,
        owner_may: bool,
        apply: impl FnOnce(&mut NodeRec),
    ) -> Result<(), MstorError> {
        let comps = path_components(path)?;
        let (nid, mut node) = self.resolve(req, &comps)?;
        let allowed = req.user == SUPERUSER || (owner_may && req.user == node.owner);
        if !allowed {
            return Err(Ferr::Perm.into());
        }
        apply(&mut node);
        self.db.insert(nid_key(nid), node.to_bytes().as_ref())?;
        self.db.flush()?;
        Ok(())
    }

    fn last_chunk_offset(&self, nid: u64) -> Result<Option<u64>, MstorError> {
        match self.db.get_lt(file_key(nid, u64::MAX))? {
            Some((key, _)) if key.len() == 17 && key[0] == b'f' && be64(&key[1..9])? == nid => {
                Ok(Some(be64(&key[9..17])?))
            }
            _ => Ok(None),
        }
    }

    /// Map a new chunk at `offset` of the file at `path`, stored on
    /// `eps`. Returns the chunk id.
    pub fn chunk_alloc(
        &self,
        req: &MstorReq<'_>,
        path: &str,
        offset: u64,
        eps: &[Endpoint],
    ) -> Result<u64, MstorError> {
        let comps = path_components(path)?;
        let (nid, node) = self.resolve(req, &comps)?;
        Self::mode_check(&node, req, PERM_WRITE, Some(false))?;
        let cid = self.alloc_nid()?;
        let mut hval = bytes::BytesMut::new();
        hval.put_u32(eps.len() as u32);
        for ep in eps {
            ep.encode(&mut hval);
        }
        let mut batch = sled::Batch::default();
        batch.insert(file_key(nid, offset), &cid.to_be_bytes()[..]);
        batch.insert(chunk_key(cid), hval.as_ref());
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(cid)
    }

    /// The extents of `path` overlapping `[start, start + len)`, each
    /// with the endpoints holding its chunk.
    pub fn chunk_find(
        &self,
        req: &MstorReq<'_>,
        path: &str,
        start: u64,
        len: u64,
    ) -> Result<Vec<BlockLoc>, MstorError> {
        let comps = path_components(path)?;
        let (nid, node) = self.resolve(req, &comps)?;
        Self::mode_check(&node, req, PERM_READ, Some(false))?;
        let end = start.saturating_add(len);
        let mut locs = Vec::new();
        let prefix = {
            let mut p = Vec::with_capacity(9);
            p.push(b'f');
            p.extend_from_slice(&nid.to_be_bytes());
            p
        };
        for item in self.db.scan_prefix(&prefix) {
            let (key, val) = item?;
            let off = be64(&key[9..17])?;
            if off >= end || off + BLOCK_SZ as u64 <= start {
                continue;
            }
            let cid = be64(&val)?;
            let eps = match self.db.get(chunk_key(cid))? {
                None => {
                    warn!(cid, "chunk with no endpoint record");
                    Vec::new()
                }
                Some(raw) => {
                    let mut buf = &raw[..];
                    let n = xdr::get_u32(&mut buf)? as usize;
                    let mut eps = Vec::with_capacity(n.min(64));
                    for _ in 0..n {
                        eps.push(Endpoint::decode(&mut buf)?);
                    }
                    eps
                }
            };
            locs.push(BlockLoc {
                start: off,
                len: BLOCK_SZ as u64,
                eps,
            });
        }
        Ok(locs)
    }

    /// Emit a human-readable listing of the whole store, in key order.
    pub fn dump(&self, w: &mut dyn Write) -> Result<(), MstorError> {
        crate::dump::dump_tree(&self.db, w)
    }
}

pub(crate) fn unix_now() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}
