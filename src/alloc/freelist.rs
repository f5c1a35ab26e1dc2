//! # Free-Space Manager
//!
//! Free slab space is tracked in a side table, never in the free bytes
//! themselves. Every free block is a node in an index-based arena:
//!
//! ```text
//! nodes: Vec<FreeNode>        by_size: BTreeMap<size, head>
//! +----+----+----+----+        16 -> 3
//! | 0  | 1  | 2  | 3  |        48 -> 0 <-> 2 <-> 0 (circular)
//! +----+----+----+----+       4096 -> 1
//!
//! by_pos: BTreeMap<ref, node>  neighbour lookup for merging
//! ```
//!
//! Blocks of the same size form a circular doubly linked list threaded through
//! `prev`/`next` node indices; the ordered `by_size` map stores one head per
//! size. Removed nodes go on a vacant list and are reused by the next insert.
//!
//! ## Lookup
//!
//! - `find(size)`: head of the exact-size list
//! - `find_larger(size)`: head of the smallest strictly larger list
//!
//! `take` prefers an exact fit, otherwise splits the next larger block from
//! the front. A remainder smaller than `MIN_SPLIT_REMAINDER` is not worth a
//! node, so the whole block is handed out and the caller records its real
//! size.
//!
//! ## Merging
//!
//! `release` merges eagerly with the free blocks directly before and after,
//! but only when they belong to the same slab. After every operation no two
//! adjacent free blocks of one slab exist unmerged. A released range that
//! overlaps an existing free block means the bookkeeping is corrupt and is
//! reported as `InvalidFreeSpace`.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use eyre::{bail, Result};

use super::Ref;
use crate::config::MIN_SPLIT_REMAINDER;
use crate::error::ArenaError;

type NodeIdx = u32;

#[derive(Debug, Clone, Copy)]
struct FreeNode {
    at: Ref,
    size: usize,
    slab: u32,
    prev: NodeIdx,
    next: NodeIdx,
}

/// A block handed out by [`FreeSpaceManager::take`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Carved {
    pub at: Ref,
    pub size: usize,
    pub slab: u32,
}

#[derive(Debug, Default)]
pub struct FreeSpaceManager {
    nodes: Vec<FreeNode>,
    vacant: Vec<NodeIdx>,
    by_size: BTreeMap<usize, NodeIdx>,
    by_pos: BTreeMap<Ref, NodeIdx>,
    free_bytes: usize,
}

impl FreeSpaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn block_count(&self) -> usize {
        self.by_pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pos.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.vacant.clear();
        self.by_size.clear();
        self.by_pos.clear();
        self.free_bytes = 0;
    }

    /// Free blocks as `(ref, size)` in address order.
    pub fn blocks(&self) -> impl Iterator<Item = (Ref, usize)> + '_ {
        self.by_pos.values().map(|&idx| {
            let node = &self.nodes[idx as usize];
            (node.at, node.size)
        })
    }

    /// Exact-size bucket head, as `(ref, size)`.
    pub fn find(&self, size: usize) -> Option<(Ref, usize)> {
        self.by_size.get(&size).map(|&idx| {
            let node = &self.nodes[idx as usize];
            (node.at, node.size)
        })
    }

    /// Head of the smallest bucket strictly larger than `size`.
    pub fn find_larger(&self, size: usize) -> Option<(Ref, usize)> {
        self.by_size
            .range((Excluded(size), Unbounded))
            .next()
            .map(|(_, &idx)| {
                let node = &self.nodes[idx as usize];
                (node.at, node.size)
            })
    }

    /// Removes a block of at least `size` bytes from the free space.
    pub fn take(&mut self, size: usize) -> Option<Carved> {
        let idx = match self.by_size.get(&size) {
            Some(&idx) => idx,
            None => *self
                .by_size
                .range((Excluded(size), Unbounded))
                .next()?
                .1,
        };

        let node = self.nodes[idx as usize];
        self.remove_node(idx);

        let remainder = node.size - size;
        if remainder < MIN_SPLIT_REMAINDER {
            return Some(Carved {
                at: node.at,
                size: node.size,
                slab: node.slab,
            });
        }

        self.insert_node(node.at + size as Ref, remainder, node.slab);
        Some(Carved {
            at: node.at,
            size,
            slab: node.slab,
        })
    }

    /// Adds a fresh block without merging. Used for new slabs, whose
    /// neighbours are never free blocks of the same slab.
    pub fn insert(&mut self, at: Ref, size: usize, slab: u32) {
        self.insert_node(at, size, slab);
    }

    /// Returns `[at, at + size)` to the free space, merging with free
    /// neighbours of the same slab.
    pub fn release(&mut self, at: Ref, size: usize, slab: u32) -> Result<()> {
        let end = at + size as Ref;
        let mut start = at;
        let mut merged_size = size;

        if let Some((_, &prev_idx)) = self.by_pos.range(..at).next_back() {
            let prev = self.nodes[prev_idx as usize];
            let prev_end = prev.at + prev.size as Ref;
            if prev_end > at {
                bail!(ArenaError::invalid_free_space(format!(
                    "released block [{}, {}) overlaps free block [{}, {})",
                    at, end, prev.at, prev_end
                )));
            }
            if prev_end == at && prev.slab == slab {
                self.remove_node(prev_idx);
                start = prev.at;
                merged_size += prev.size;
            }
        }

        if let Some((_, &next_idx)) = self.by_pos.range(at..).next() {
            let next = self.nodes[next_idx as usize];
            if next.at < end {
                bail!(ArenaError::invalid_free_space(format!(
                    "released block [{}, {}) overlaps free block [{}, {})",
                    at,
                    end,
                    next.at,
                    next.at + next.size as Ref
                )));
            }
            if next.at == end && next.slab == slab {
                self.remove_node(next_idx);
                merged_size += next.size;
            }
        }

        self.insert_node(start, merged_size, slab);
        Ok(())
    }

    fn insert_node(&mut self, at: Ref, size: usize, slab: u32) {
        let node = FreeNode {
            at,
            size,
            slab,
            prev: 0,
            next: 0,
        };
        let idx = match self.vacant.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeIdx
            }
        };

        match self.by_size.get(&size) {
            Some(&head) => {
                let tail = self.nodes[head as usize].prev;
                self.nodes[idx as usize].prev = tail;
                self.nodes[idx as usize].next = head;
                self.nodes[tail as usize].next = idx;
                self.nodes[head as usize].prev = idx;
            }
            None => {
                self.nodes[idx as usize].prev = idx;
                self.nodes[idx as usize].next = idx;
                self.by_size.insert(size, idx);
            }
        }

        self.by_pos.insert(at, idx);
        self.free_bytes += size;
    }

    fn remove_node(&mut self, idx: NodeIdx) {
        let node = self.nodes[idx as usize];

        if node.next == idx {
            self.by_size.remove(&node.size);
        } else {
            self.nodes[node.prev as usize].next = node.next;
            self.nodes[node.next as usize].prev = node.prev;
            if self.by_size.get(&node.size) == Some(&idx) {
                self.by_size.insert(node.size, node.next);
            }
        }

        self.by_pos.remove(&node.at);
        self.vacant.push(idx);
        self.free_bytes -= node.size;
    }

    #[cfg(test)]
    fn bucket_len(&self, size: usize) -> usize {
        let Some(&head) = self.by_size.get(&size) else {
            return 0;
        };
        let mut len = 1;
        let mut cur = self.nodes[head as usize].next;
        while cur != head {
            assert_eq!(self.nodes[self.nodes[cur as usize].prev as usize].next, cur);
            len += 1;
            cur = self.nodes[cur as usize].next;
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn exact_fit_is_preferred() {
        let mut fsm = FreeSpaceManager::new();
        fsm.insert(1000, 64, 0);
        fsm.insert(2000, 32, 0);

        let carved = fsm.take(32).unwrap();

        assert_eq!(carved.at, 2000);
        assert_eq!(carved.size, 32);
        assert_eq!(fsm.free_bytes(), 64);
    }

    #[test]
    fn larger_block_is_split_from_the_front() {
        let mut fsm = FreeSpaceManager::new();
        fsm.insert(1000, 256, 0);

        let carved = fsm.take(64).unwrap();

        assert_eq!(carved.at, 1000);
        assert_eq!(carved.size, 64);
        assert_eq!(fsm.blocks().collect::<Vec<_>>(), vec![(1064, 192)]);
    }

    #[test]
    fn tiny_remainder_is_handed_out_with_the_block() {
        let mut fsm = FreeSpaceManager::new();
        fsm.insert(1000, 72, 0);

        let carved = fsm.take(64).unwrap();

        assert_eq!(carved.size, 72);
        assert!(fsm.is_empty());
    }

    #[test]
    fn take_from_empty_is_none() {
        let mut fsm = FreeSpaceManager::new();
        fsm.insert(1000, 32, 0);

        assert!(fsm.take(64).is_none());
        assert_eq!(fsm.free_bytes(), 32);
    }

    #[test]
    fn find_larger_skips_exact_bucket() {
        let mut fsm = FreeSpaceManager::new();
        fsm.insert(1000, 32, 0);
        fsm.insert(2000, 128, 0);

        assert_eq!(fsm.find(32), Some((1000, 32)));
        assert_eq!(fsm.find_larger(32), Some((2000, 128)));
        assert_eq!(fsm.find_larger(128), None);
    }

    #[test]
    fn release_merges_both_neighbours() {
        let mut fsm = FreeSpaceManager::new();
        fsm.insert(1000, 16, 0);
        fsm.insert(1032, 16, 0);

        fsm.release(1016, 16, 0).unwrap();

        assert_eq!(fsm.blocks().collect::<Vec<_>>(), vec![(1000, 48)]);
        assert_eq!(fsm.bucket_len(16), 0);
        assert_eq!(fsm.bucket_len(48), 1);
    }

    #[test]
    fn merge_result_does_not_depend_on_release_order() {
        let layout = |first: usize, second: usize| {
            let mut fsm = FreeSpaceManager::new();
            fsm.insert(0, 1024, 0);
            let carved: Vec<_> = (0..3).map(|_| fsm.take(128).unwrap()).collect();
            fsm.release(carved[first].at, carved[first].size, 0).unwrap();
            fsm.release(carved[second].at, carved[second].size, 0).unwrap();
            fsm.blocks().collect::<Vec<_>>()
        };

        let forward = layout(0, 1);
        let backward = layout(1, 0);

        assert_eq!(forward, vec![(0, 256), (384, 640)]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn release_never_merges_across_slabs() {
        let mut fsm = FreeSpaceManager::new();
        fsm.insert(4096, 4096, 0);

        fsm.release(8192, 4096, 1).unwrap();

        assert_eq!(fsm.block_count(), 2);
    }

    #[test]
    fn overlapping_release_is_invalid_free_space() {
        let mut fsm = FreeSpaceManager::new();
        fsm.insert(1000, 64, 0);

        let err = fsm.release(1032, 16, 0).unwrap_err();
        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::InvalidFreeSpace));

        let err = fsm.release(992, 16, 0).unwrap_err();
        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::InvalidFreeSpace));
    }

    #[test]
    fn same_size_blocks_share_a_circular_list() {
        let mut fsm = FreeSpaceManager::new();
        for i in 0..5 {
            fsm.insert(1000 + i * 100, 32, 0);
        }
        assert_eq!(fsm.bucket_len(32), 5);

        fsm.take(32).unwrap();
        fsm.take(32).unwrap();

        assert_eq!(fsm.bucket_len(32), 3);
        assert_eq!(fsm.free_bytes(), 96);
    }

    #[test]
    fn vacant_nodes_are_reused() {
        let mut fsm = FreeSpaceManager::new();
        fsm.insert(1000, 64, 0);
        fsm.take(64).unwrap();
        fsm.insert(2000, 64, 0);

        assert_eq!(fsm.nodes.len(), 1);
    }

    #[test]
    fn free_everything_coalesces_to_one_block() {
        let mut fsm = FreeSpaceManager::new();
        fsm.insert(0, 1024, 0);
        let carved: Vec<_> = (0..8).map(|_| fsm.take(128).unwrap()).collect();
        assert!(fsm.is_empty());

        for c in carved.iter().rev().step_by(2) {
            fsm.release(c.at, c.size, 0).unwrap();
        }
        for c in carved.iter().step_by(2) {
            fsm.release(c.at, c.size, 0).unwrap();
        }

        assert_eq!(fsm.blocks().collect::<Vec<_>>(), vec![(0, 1024)]);
    }
}
