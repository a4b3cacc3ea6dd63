//! Active sets and the subcommunicator cache.
//!
//! A collective names its participants with a `(start, log_stride, size)`
//! triple. The world triple `(0, 0, N)` short-circuits to the world
//! communicator; anything else is mapped to a subgroup/subcommunicator
//! pair, cached in a small table keyed by the triple. On cache overflow the
//! communicator is created per call and freed on release.

use crate::runtime::Runtime;
use crate::substrate::{Comm, Group, RANK_UNDEFINED};

/// A strided subset of PE ranks: `{start + i * 2^log_stride : 0 <= i < size}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveSet {
    pub start: i32,
    pub log_stride: i32,
    pub size: i32,
}

impl ActiveSet {
    pub const fn new(start: i32, log_stride: i32, size: i32) -> Self {
        Self {
            start,
            log_stride,
            size,
        }
    }

    /// The whole world of `n` PEs.
    pub const fn world(n: i32) -> Self {
        Self::new(0, 0, n)
    }

    pub fn stride(&self) -> i32 {
        1 << self.log_stride
    }

    /// The denoted world ranks, in active-set order.
    pub fn ranks(&self) -> Vec<i32> {
        (0..self.size).map(|i| self.start + i * self.stride()).collect()
    }

    pub fn contains(&self, rank: i32) -> bool {
        let stride = self.stride();
        rank >= self.start
            && (rank - self.start) % stride == 0
            && (rank - self.start) / stride < self.size
    }

    pub(crate) fn is_world(&self, world_size: i32) -> bool {
        self.start == 0 && self.log_stride == 0 && self.size == world_size
    }

    /// Check the triple denotes ranks inside `[0, world_size)`.
    pub(crate) fn validate(&self, world_size: i32) -> Result<(), String> {
        if self.size < 1 {
            return Err(format!("active set size {} < 1", self.size));
        }
        if !(0..=30).contains(&self.log_stride) {
            return Err(format!("active set log_stride {} out of range", self.log_stride));
        }
        if self.start < 0 {
            return Err(format!("active set start {} < 0", self.start));
        }
        let last = self.start as i64 + (self.size as i64 - 1) * (1i64 << self.log_stride);
        if last >= world_size as i64 {
            return Err(format!(
                "active set ({}, {}, {}) reaches PE {} outside the world of {}",
                self.start, self.log_stride, self.size, last, world_size
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Subcommunicator cache
// ============================================================================

/// Cache capacity; lookup is a linear scan so this stays small.
pub(crate) const COMM_CACHE_SIZE: usize = 16;

pub(crate) struct CacheEntry {
    pub set: ActiveSet,
    pub comm: Comm,
    pub group: Group,
}

pub(crate) struct CommCache {
    entries: Vec<Option<CacheEntry>>,
}

impl CommCache {
    pub fn new() -> Self {
        Self {
            entries: (0..COMM_CACHE_SIZE).map(|_| None).collect(),
        }
    }

    fn lookup(&self, set: ActiveSet) -> Option<&CacheEntry> {
        self.entries
            .iter()
            .flatten()
            .find(|entry| entry.set == set)
    }

    fn insert(&mut self, entry: CacheEntry) -> bool {
        for slot in self.entries.iter_mut() {
            if slot.is_none() {
                *slot = Some(entry);
                return true;
            }
        }
        false
    }

    /// Drain every cached entry for teardown.
    pub fn drain(&mut self) -> Vec<CacheEntry> {
        self.entries.iter_mut().filter_map(|slot| slot.take()).collect()
    }
}

/// An acquired communicator plus the translated root; uncached acquisitions
/// are freed by [`release`].
pub(crate) struct Acquired {
    pub comm: Comm,
    pub root: i32,
    cached: bool,
}

fn translate_root(rt: &Runtime, group: Group, root_world: i32) -> i32 {
    let translated = rt.ok(rt
        .sub
        .group_translate_ranks(rt.world_group, &[root_world], group));
    if translated[0] == RANK_UNDEFINED {
        rt.fatal(1, &format!("root PE {} is not in the active set", root_world));
    }
    translated[0]
}

/// Map the active set to a communicator, translating `root` (a world rank,
/// negative for "no root") into active-set coordinates on the way.
pub(crate) fn acquire(rt: &mut Runtime, set: ActiveSet, root: i32) -> Acquired {
    if let Err(msg) = set.validate(rt.world_size) {
        rt.fatal(1, &msg);
    }

    // Fast path: the world triple needs no translation at all.
    if set.is_world(rt.world_size) {
        return Acquired {
            comm: rt.world,
            root,
            cached: true,
        };
    }

    if let Some(entry) = rt.cache.lookup(set) {
        let (comm, group) = (entry.comm, entry.group);
        let translated = if root >= 0 {
            translate_root(rt, group, root)
        } else {
            root
        };
        return Acquired {
            comm,
            root: translated,
            cached: true,
        };
    }

    let group = rt.ok(rt.sub.group_incl(rt.world_group, &set.ranks()));
    // `start` disambiguates simultaneous creations on disjoint sets.
    let comm = rt.ok(rt.sub.comm_create_group(rt.world, group, set.start));
    let translated = if root >= 0 {
        translate_root(rt, group, root)
    } else {
        root
    };

    if rt.cache.insert(CacheEntry { set, comm, group }) {
        return Acquired {
            comm,
            root: translated,
            cached: true,
        };
    }

    // Cache overflow: hand the communicator out uncached; the group is no
    // longer needed once the root is translated.
    let r = rt.sub.group_free(group);
    rt.ok(r);
    Acquired {
        comm,
        root: translated,
        cached: false,
    }
}

pub(crate) fn release(rt: &mut Runtime, acquired: Acquired) {
    if !acquired.cached {
        let r = rt.sub.comm_free(acquired.comm);
        rt.ok(r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_follow_the_stride() {
        assert_eq!(ActiveSet::new(0, 0, 4).ranks(), vec![0, 1, 2, 3]);
        assert_eq!(ActiveSet::new(1, 1, 3).ranks(), vec![1, 3, 5]);
        assert_eq!(ActiveSet::new(2, 2, 2).ranks(), vec![2, 6]);
    }

    #[test]
    fn membership() {
        let set = ActiveSet::new(1, 1, 3);
        assert!(set.contains(1));
        assert!(set.contains(3));
        assert!(set.contains(5));
        assert!(!set.contains(0));
        assert!(!set.contains(2));
        assert!(!set.contains(7));
    }

    #[test]
    fn validation() {
        assert!(ActiveSet::new(0, 0, 4).validate(4).is_ok());
        assert!(ActiveSet::new(0, 0, 0).validate(4).is_err());
        assert!(ActiveSet::new(-1, 0, 2).validate(4).is_err());
        assert!(ActiveSet::new(0, 0, 5).validate(4).is_err());
        assert!(ActiveSet::new(2, 1, 2).validate(4).is_err());
        assert!(ActiveSet::new(0, 31, 2).validate(4).is_err());
    }

    #[test]
    fn world_detection() {
        assert!(ActiveSet::new(0, 0, 8).is_world(8));
        assert!(!ActiveSet::new(0, 0, 4).is_world(8));
        assert!(!ActiveSet::new(0, 1, 8).is_world(8));
    }

    #[test]
    fn cache_overflow_reports_failure() {
        let mut cache = CommCache::new();
        for i in 0..COMM_CACHE_SIZE as i32 {
            assert!(cache.insert(CacheEntry {
                set: ActiveSet::new(i, 0, 1),
                comm: Comm(i as u32 + 1),
                group: Group(i as u32),
            }));
        }
        assert!(!cache.insert(CacheEntry {
            set: ActiveSet::new(99, 0, 1),
            comm: Comm(99),
            group: Group(99),
        }));
        assert!(cache.lookup(ActiveSet::new(3, 0, 1)).is_some());
        assert!(cache.lookup(ActiveSet::new(99, 0, 1)).is_none());
        assert_eq!(cache.drain().len(), COMM_CACHE_SIZE);
    }
}
