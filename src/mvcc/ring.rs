//! # Read-Lock Ring Buffer
//!
//! Every committed version a reader may still ask for has an entry in this
//! ring. Entries are linked through `next` indices rather than laid out by
//! position, which lets the ring grow without moving anything: a reader's
//! `reader_index` stays valid for the lifetime of its lock.
//!
//! ```text
//!          old                     put
//!           v                       v
//!   ... -> [v5|2] -> [v6|0] -> [v7|1] -> [free] -> [free] -> (back to old)
//! ```
//!
//! ## Growth
//!
//! When `put.next == old` the ring is full. New entries are spliced in
//! between `put` and `old`, and the vector only ever grows:
//!
//! ```text
//! before:  put -> old
//! after:   put -> n0 -> n1 -> ... -> nk -> old
//! ```
//!
//! ## Pruning
//!
//! Entries leave from the oldest end only, while the oldest entry has no
//! readers and is not the newest. An unreferenced entry behind a referenced
//! older one stays until everything older is gone.

use eyre::{bail, ensure, Result};

use crate::alloc::Ref;
use crate::error::ArenaError;

/// A pinned version, as handed to a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLockInfo {
    pub version: u64,
    pub reader_index: u32,
    pub top_ref: Ref,
    pub file_size: u64,
}

/// The committed state published for one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishedVersion {
    pub version: u64,
    pub top_ref: Ref,
    pub file_size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct RingEntry {
    published: PublishedVersion,
    count: u32,
    next: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub live: usize,
    pub capacity: usize,
    pub oldest_version: u64,
    pub newest_version: u64,
    pub readers: u64,
}

#[derive(Debug)]
pub struct ReadLockRing {
    entries: Vec<RingEntry>,
    old: u32,
    put: u32,
}

impl ReadLockRing {
    pub fn new(capacity: usize, initial: PublishedVersion) -> Self {
        let capacity = capacity.max(2);
        let mut entries: Vec<RingEntry> = (0..capacity)
            .map(|i| RingEntry {
                next: ((i + 1) % capacity) as u32,
                ..RingEntry::default()
            })
            .collect();
        entries[0].published = initial;
        Self {
            entries,
            old: 0,
            put: 0,
        }
    }

    pub fn newest(&self) -> PublishedVersion {
        self.entries[self.put as usize].published
    }

    pub fn oldest(&self) -> PublishedVersion {
        self.entries[self.old as usize].published
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn is_full(&self) -> bool {
        self.entries[self.put as usize].next == self.old
    }

    /// Indices of live entries, oldest first.
    fn live_indices(&self) -> impl Iterator<Item = u32> + '_ {
        let mut cur = Some(self.old);
        std::iter::from_fn(move || {
            let idx = cur?;
            cur = if idx == self.put {
                None
            } else {
                Some(self.entries[idx as usize].next)
            };
            Some(idx)
        })
    }

    pub fn live_len(&self) -> usize {
        self.live_indices().count()
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            live: self.live_len(),
            capacity: self.capacity(),
            oldest_version: self.oldest().version,
            newest_version: self.newest().version,
            readers: self
                .live_indices()
                .map(|i| self.entries[i as usize].count as u64)
                .sum(),
        }
    }

    /// Records a newly committed version. Versions must strictly increase.
    pub fn append(&mut self, published: PublishedVersion) -> Result<()> {
        let newest = self.newest().version;
        ensure!(
            published.version > newest,
            "version {} does not follow newest version {}",
            published.version,
            newest
        );

        if self.is_full() {
            self.expand();
        }

        let idx = self.entries[self.put as usize].next;
        let entry = &mut self.entries[idx as usize];
        entry.published = published;
        entry.count = 0;
        self.put = idx;
        Ok(())
    }

    fn expand(&mut self) {
        let old_len = self.entries.len();
        let new_len = old_len * 2;
        let first_new = old_len as u32;

        for i in old_len..new_len {
            let next = if i + 1 == new_len { self.old } else { (i + 1) as u32 };
            self.entries.push(RingEntry {
                next,
                ..RingEntry::default()
            });
        }
        self.entries[self.put as usize].next = first_new;

        tracing::debug!(from = old_len, to = new_len, "expanded read-lock ring");
    }

    pub fn grab_latest(&mut self) -> ReadLockInfo {
        let idx = self.put;
        self.pin(idx)
    }

    pub fn grab(&mut self, version: u64) -> Result<ReadLockInfo> {
        let found = self
            .live_indices()
            .find(|&i| self.entries[i as usize].published.version == version);
        match found {
            Some(idx) => Ok(self.pin(idx)),
            None => bail!(ArenaError::BadVersion { version }),
        }
    }

    fn pin(&mut self, idx: u32) -> ReadLockInfo {
        let entry = &mut self.entries[idx as usize];
        entry.count += 1;
        ReadLockInfo {
            version: entry.published.version,
            reader_index: idx,
            top_ref: entry.published.top_ref,
            file_size: entry.published.file_size,
        }
    }

    /// Drops one reference and prunes. Returns how many entries were pruned.
    pub fn release(&mut self, lock: &ReadLockInfo) -> Result<usize> {
        let entry = self
            .entries
            .get_mut(lock.reader_index as usize)
            .filter(|e| e.published.version == lock.version && e.count > 0);
        let Some(entry) = entry else {
            bail!(
                "read lock on version {} (slot {}) is not held",
                lock.version,
                lock.reader_index
            );
        };
        entry.count -= 1;
        Ok(self.prune())
    }

    pub fn prune(&mut self) -> usize {
        let mut pruned = 0;
        while self.old != self.put && self.entries[self.old as usize].count == 0 {
            self.old = self.entries[self.old as usize].next;
            pruned += 1;
        }
        pruned
    }
}
