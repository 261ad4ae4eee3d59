//! Lock-striped storage for delegations.
//!
//! Delegations live in a fixed bank of buckets, each guarded by its own
//! mutex. Bulk add/remove sorts by bucket index first, so each bucket's
//! lock is taken exactly once per batch and every path through this
//! module acquires bucket locks in the same monotonic order.

use crate::delegation::Delegation;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

struct Slot {
    dgs: Mutex<Vec<Delegation>>,
}

pub struct Dslots {
    slots: Vec<Slot>,
}

/// A locked delegation. Holds the bucket mutex until dropped.
pub struct DgGuard<'a> {
    guard: MutexGuard<'a, Vec<Delegation>>,
    idx: usize,
}

impl Deref for DgGuard<'_> {
    type Target = Delegation;

    fn deref(&self) -> &Delegation {
        &self.guard[self.idx]
    }
}

impl DerefMut for DgGuard<'_> {
    fn deref_mut(&mut self) -> &mut Delegation {
        &mut self.guard[self.idx]
    }
}

impl Dslots {
    pub fn new(num_slots: usize) -> Dslots {
        let slots = (0..num_slots.max(1))
            .map(|_| Slot {
                dgs: Mutex::new(Vec::new()),
            })
            .collect();
        Dslots { slots }
    }

    fn slot_of(&self, dgid: u64) -> usize {
        (((17u64.wrapping_add(dgid)).wrapping_mul(13)) % self.slots.len() as u64) as usize
    }

    /// Insert a batch of delegations. Sorted by bucket first so each
    /// bucket lock is taken once, in increasing order.
    pub fn add(&self, dgs: Vec<Delegation>) {
        let mut keyed: Vec<(usize, Delegation)> =
            dgs.into_iter().map(|dg| (self.slot_of(dg.dgid), dg)).collect();
        keyed.sort_by_key(|(slot, _)| *slot);
        let mut iter = keyed.into_iter().peekable();
        while let Some((slot, dg)) = iter.next() {
            let mut guard = self.slots[slot].dgs.lock().unwrap();
            guard.push(dg);
            while let Some((next_slot, _)) = iter.peek() {
                if *next_slot != slot {
                    break;
                }
                if let Some((_, dg)) = iter.next() {
                    guard.push(dg);
                }
            }
        }
    }

    /// Remove every delegation named in `dgids`. Returns how many were
    /// actually dropped.
    pub fn remove(&self, dgids: &[u64]) -> usize {
        let mut keyed: Vec<(usize, u64)> =
            dgids.iter().map(|&dgid| (self.slot_of(dgid), dgid)).collect();
        keyed.sort_by_key(|(slot, _)| *slot);
        let mut removed = 0;
        let mut iter = keyed.into_iter().peekable();
        while let Some((slot, dgid)) = iter.next() {
            let mut guard = self.slots[slot].dgs.lock().unwrap();
            let before = guard.len();
            guard.retain(|dg| dg.dgid != dgid);
            removed += before - guard.len();
            while let Some((next_slot, _)) = iter.peek() {
                if *next_slot != slot {
                    break;
                }
                if let Some((_, dgid)) = iter.next() {
                    let before = guard.len();
                    guard.retain(|dg| dg.dgid != dgid);
                    removed += before - guard.len();
                }
            }
        }
        removed
    }

    /// Find `dgid` and return it with its bucket locked. The lock is
    /// released when the guard drops.
    pub fn lock(&self, dgid: u64) -> Option<DgGuard<'_>> {
        let slot = self.slot_of(dgid);
        let guard = self.slots[slot].dgs.lock().unwrap();
        let idx = guard.iter().position(|dg| dg.dgid == dgid)?;
        Some(DgGuard { guard, idx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dg(dgid: u64) -> Delegation {
        let mut dg = Delegation::new(dgid);
        dg.alloc_mds((dgid % 5) as u16, true);
        dg
    }

    #[test]
    fn add_lock_remove() {
        let slots = Dslots::new(16);
        slots.add((0..100).map(dg).collect());

        for dgid in 0..100 {
            let found = slots.lock(dgid).expect("delegation missing");
            assert_eq!(found.dgid, dgid);
        }
        assert!(slots.lock(1000).is_none());

        let to_remove: Vec<u64> = (0..100).step_by(2).collect();
        assert_eq!(slots.remove(&to_remove), 50);
        assert!(slots.lock(0).is_none());
        assert!(slots.lock(1).is_some());
        assert_eq!(slots.remove(&to_remove), 0);
    }

    #[test]
    fn guard_allows_mutation() {
        let slots = Dslots::new(4);
        slots.add(vec![dg(9)]);
        {
            let mut guard = slots.lock(9).unwrap();
            guard.alloc_mds(3, false).recv_time = 77;
        }
        let guard = slots.lock(9).unwrap();
        assert_eq!(guard.lookup_mds(3).unwrap().recv_time, 77);
    }

    #[test]
    fn batches_spanning_buckets() {
        // More delegations than buckets forces same-bucket runs.
        let slots = Dslots::new(3);
        slots.add((0..30).map(dg).collect());
        assert_eq!(slots.remove(&(0..30).collect::<Vec<_>>()), 30);
        for dgid in 0..30 {
            assert!(slots.lock(dgid).is_none());
        }
    }

    #[test]
    fn concurrent_lock_and_add() {
        use std::sync::Arc;
        let slots = Arc::new(Dslots::new(8));
        slots.add((0..50).map(dg).collect());
        let mut handles = Vec::new();
        for t in 0..4 {
            let slots = slots.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50u64 {
                    if let Some(mut guard) = slots.lock(i) {
                        guard.alloc_mds(t, false).send_time += 1;
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // dgid 25 started with primary mid 0; threads added mids 0..4.
        let guard = slots.lock(25).unwrap();
        assert_eq!(guard.num_replicas(), 4);
    }
}
