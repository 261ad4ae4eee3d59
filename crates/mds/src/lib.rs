//! Metadata-server internals: the delegation namespace and the metadata
//! store.
//!
//! * [`Dmap`] maps paths to delegation ids through a trie of path
//!   components.
//! * [`Dslots`] holds the delegations themselves in lock-striped buckets.
//! * [`Mstor`] is the metadata store proper: inode records, directory
//!   edges and chunk maps over an ordered key/value engine.

pub mod delegation;
pub mod dmap;
pub mod dslots;
mod dump;
pub mod mstor;

pub use delegation::{Delegation, DgMdsInfo};
pub use dmap::{Dmap, INVAL_DGID, ROOT_DGID};
pub use dslots::Dslots;
pub use mstor::{MstorError, MstorReq, Mstor};
