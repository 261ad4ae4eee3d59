//! A delegation: one subtree of the namespace and the MDSes serving it.

use std::collections::BTreeMap;
use wire::Ferr;

/// What this MDS knows about a peer MDS serving a delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DgMdsInfo {
    pub mid: u16,
    pub ip: u32,
    pub port: u16,
    /// When we last sent a message to this MDS (unix seconds).
    pub send_time: i64,
    /// When we last heard from this MDS (unix seconds).
    pub recv_time: i64,
}

impl DgMdsInfo {
    fn new(mid: u16) -> DgMdsInfo {
        DgMdsInfo {
            mid,
            ip: 0,
            port: 0,
            send_time: 0,
            recv_time: 0,
        }
    }
}

/// Invariant: `primary`, when set, names a member of `replicas`.
#[derive(Debug, Clone)]
pub struct Delegation {
    pub dgid: u64,
    primary: Option<u16>,
    replicas: BTreeMap<u16, DgMdsInfo>,
}

impl Delegation {
    pub fn new(dgid: u64) -> Delegation {
        Delegation {
            dgid,
            primary: None,
            replicas: BTreeMap::new(),
        }
    }

    /// Add (or find) the replica entry for `mid`, optionally promoting it
    /// to primary.
    pub fn alloc_mds(&mut self, mid: u16, is_primary: bool) -> &mut DgMdsInfo {
        if is_primary {
            self.primary = Some(mid);
        }
        self.replicas.entry(mid).or_insert_with(|| DgMdsInfo::new(mid))
    }

    pub fn lookup_mds(&self, mid: u16) -> Option<&DgMdsInfo> {
        self.replicas.get(&mid)
    }

    pub fn lookup_mds_mut(&mut self, mid: u16) -> Option<&mut DgMdsInfo> {
        self.replicas.get_mut(&mid)
    }

    pub fn primary(&self) -> Option<&DgMdsInfo> {
        self.primary.and_then(|mid| self.replicas.get(&mid))
    }

    pub fn is_primary(&self, mid: u16) -> bool {
        self.primary == Some(mid)
    }

    /// Drop the replica entry for `mid`. The primary cannot be removed;
    /// promote a different replica first.
    pub fn remove_mds(&mut self, mid: u16) -> Result<(), Ferr> {
        if self.primary == Some(mid) {
            return Err(Ferr::Inval);
        }
        match self.replicas.remove(&mid) {
            Some(_) => Ok(()),
            None => Err(Ferr::NoEnt),
        }
    }

    pub fn replicas(&self) -> impl Iterator<Item = &DgMdsInfo> {
        self.replicas.values()
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }
}
