// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Hashed directory index with stable iteration cookies
//!
//! Entries are keyed by a 30-bit hash of their name in an ordered map. A hash
//! shared by several names is held by a duplicate head: a list of entries
//! ordered by cookie, where each member draws a unique cookie from the
//! reserved duplicate range above every hash value. Cookies `0` and `1` are
//! the synthetic `.` and `..` entries and `2` marks end of directory; none of
//! them is ever stored here.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::node::Node;

pub const COOKIE_DOT: u64 = 0;
pub const COOKIE_DOTDOT: u64 = 1;
pub const COOKIE_EOF: u64 = 2;
/// Smallest cookie a stored entry can carry.
pub const COOKIE_MIN: u64 = 4;
pub const COOKIE_MASK: u64 = 0x3fff_ffff;
/// Flag bit marking cookies handed out to colliding entries.
pub const COOKIE_DUP: u64 = 0x4000_0000;
pub const COOKIE_DUP_MIN: u64 = COOKIE_DUP;
pub const COOKIE_DUP_MAX: u64 = COOKIE_DUP | COOKIE_MASK;

/// Tombstones kept per directory for removed duplicate cookies.
const RETIRED_COOKIE_LIMIT: usize = 1024;

/// Deterministic name hash, clamped into `[COOKIE_MIN, COOKIE_MASK]`.
pub fn name_hash(name: &[u8]) -> u64 {
    let mut h: u32 = 5381;
    for &b in name {
        h = (h << 5).wrapping_add(h).wrapping_add(b as u32);
    }
    let h = h as u64 & COOKIE_MASK;
    if h < COOKIE_MIN {
        h + COOKIE_MIN
    } else {
        h
    }
}

pub fn is_dup_cookie(cookie: u64) -> bool {
    cookie & COOKIE_DUP != 0
}

/// One name → node binding inside a directory. A whiteout entry has no node.
pub struct DirEntry {
    name: Box<[u8]>,
    hash: u64,
    cookie: AtomicU64,
    node: Option<Arc<Node>>,
}

impl DirEntry {
    pub(crate) fn new(name: &[u8], node: Option<Arc<Node>>) -> Self {
        let hash = name_hash(name);
        Self {
            name: name.into(),
            hash,
            cookie: AtomicU64::new(hash),
            node,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Iteration cookie. Only changes while the owning directory is locked.
    pub fn cookie(&self) -> u64 {
        self.cookie.load(Ordering::Acquire)
    }

    fn set_cookie(&self, cookie: u64) {
        self.cookie.store(cookie, Ordering::Release);
    }

    pub fn node(&self) -> Option<&Arc<Node>> {
        self.node.as_ref()
    }

    pub fn is_whiteout(&self) -> bool {
        self.node.is_none()
    }
}

impl std::fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirEntry")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("hash", &format_args!("{:#x}", self.hash))
            .field("cookie", &format_args!("{:#x}", self.cookie()))
            .field("node", &self.node.as_ref().map(|n| n.id()))
            .finish()
    }
}

/// Entries sharing one hash, ordered by ascending cookie.
#[derive(Debug)]
struct DupHead {
    entries: Vec<Arc<DirEntry>>,
}

impl DupHead {
    fn insert(&mut self, entry: Arc<DirEntry>) {
        let cookie = entry.cookie();
        let pos = self.entries.partition_point(|e| e.cookie() < cookie);
        self.entries.insert(pos, entry);
    }
}

#[derive(Debug)]
enum Slot {
    Single(Arc<DirEntry>),
    Dup(DupHead),
}

impl Slot {
    fn entries(&self) -> std::slice::Iter<'_, Arc<DirEntry>> {
        match self {
            Slot::Single(entry) => std::slice::from_ref(entry).iter(),
            Slot::Dup(head) => head.entries.iter(),
        }
    }
}

/// Where an iteration resumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Position {
    /// First entry whose hash is at least this value.
    Hash(u64),
    /// Inside the duplicate head for `hash`, at the first cookie `>= cookie`.
    Dup { hash: u64, cookie: u64 },
    End,
}

/// The next entry a sequential reader will ask for.
#[derive(Clone, Copy, Debug)]
struct CursorCache {
    cookie: u64,
    hash: u64,
}

/// Ordered index of one directory's entries.
#[derive(Debug)]
pub struct DirIndex {
    tree: BTreeMap<u64, Slot>,
    /// Duplicate cookie → hash of the head holding it.
    dup_index: BTreeMap<u64, u64>,
    /// Cookies of removed duplicates → the hash they lived under, so a
    /// reader holding one resumes inside the right head. Dropped when the
    /// cookie is handed out again.
    retired: BTreeMap<u64, u64>,
    /// Entries given the top cookie after the range ran out. They share it
    /// with its indexed owner.
    overflow: Vec<Arc<DirEntry>>,
    dup_range: (u64, u64),
    len: usize,
    cursor: Option<CursorCache>,
}

impl Default for DirIndex {
    fn default() -> Self {
        Self {
            tree: BTreeMap::new(),
            dup_index: BTreeMap::new(),
            retired: BTreeMap::new(),
            overflow: Vec::new(),
            dup_range: (COOKIE_DUP_MIN, COOKIE_DUP_MAX),
            len: 0,
            cursor: None,
        }
    }
}

impl DirIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_dup_range(min: u64, max: u64) -> Self {
        Self {
            dup_range: (min, max),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lookup(&self, name: &[u8]) -> Option<&Arc<DirEntry>> {
        match self.tree.get(&name_hash(name))? {
            Slot::Single(entry) => (entry.name() == name).then_some(entry),
            Slot::Dup(head) => head.entries.iter().find(|e| e.name() == name),
        }
    }

    /// Insert `entry`. An existing entry with the same name is displaced and
    /// returned; the caller owns releasing it.
    pub fn attach(&mut self, entry: Arc<DirEntry>) -> Option<Arc<DirEntry>> {
        self.cursor = None;
        let hash = entry.hash();
        let displaced = match self.tree.remove(&hash) {
            None => {
                entry.set_cookie(hash);
                self.tree.insert(hash, Slot::Single(entry));
                None
            }
            Some(Slot::Single(existing)) if existing.name() == entry.name() => {
                entry.set_cookie(hash);
                self.tree.insert(hash, Slot::Single(entry));
                Some(existing)
            }
            Some(Slot::Single(existing)) => {
                // Build the complete head before it becomes reachable.
                let mut head = DupHead {
                    entries: Vec::with_capacity(2),
                };
                self.assign_dup_cookie(&existing);
                head.insert(existing);
                self.assign_dup_cookie(&entry);
                head.insert(entry);
                self.tree.insert(hash, Slot::Dup(head));
                None
            }
            Some(Slot::Dup(mut head)) => {
                let displaced = head
                    .entries
                    .iter()
                    .position(|e| e.name() == entry.name())
                    .map(|pos| head.entries.remove(pos));
                if let Some(old) = &displaced {
                    self.release_dup_cookie(old);
                }
                self.assign_dup_cookie(&entry);
                head.insert(entry);
                self.tree.insert(hash, Slot::Dup(head));
                displaced
            }
        };
        if displaced.is_none() {
            self.len += 1;
        }
        displaced
    }

    /// Remove exactly this entry. Returns false if it is not in the index.
    pub fn detach(&mut self, entry: &Arc<DirEntry>) -> bool {
        let hash = entry.hash();
        let removed = match self.tree.get_mut(&hash) {
            Some(Slot::Single(existing)) if Arc::ptr_eq(existing, entry) => {
                self.tree.remove(&hash);
                true
            }
            Some(Slot::Dup(head)) => match head.entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
                Some(pos) => {
                    head.entries.remove(pos);
                    let emptied = head.entries.is_empty();
                    self.release_dup_cookie(entry);
                    if emptied {
                        self.tree.remove(&hash);
                    }
                    true
                }
                None => false,
            },
            _ => false,
        };
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// Remove and return every entry, in iteration order.
    pub fn drain(&mut self) -> Vec<Arc<DirEntry>> {
        let tree = std::mem::take(&mut self.tree);
        self.dup_index.clear();
        self.retired.clear();
        self.overflow.clear();
        self.len = 0;
        self.cursor = None;
        tree.into_values()
            .flat_map(|slot| match slot {
                Slot::Single(entry) => vec![entry],
                Slot::Dup(head) => head.entries,
            })
            .collect()
    }

    /// Give up the duplicate cookie held by `entry`, which has just left its
    /// head. An overflow holder leaves the owner's record alone; an owner
    /// hands its record to a remaining overflow holder if there is one.
    fn release_dup_cookie(&mut self, entry: &Arc<DirEntry>) {
        let cookie = entry.cookie();
        if let Some(pos) = self.overflow.iter().position(|e| Arc::ptr_eq(e, entry)) {
            self.overflow.swap_remove(pos);
            return;
        }
        if let Some(heir) = self.overflow.pop() {
            debug_assert_eq!(heir.cookie(), cookie);
            self.dup_index.insert(cookie, heir.hash());
            return;
        }
        self.dup_index.remove(&cookie);
        if self.retired.len() >= RETIRED_COOKIE_LIMIT {
            self.retired.pop_first();
        }
        self.retired.insert(cookie, entry.hash());
    }

    /// Hand out a duplicate cookie to `entry`, which is about to join the
    /// head for its hash.
    fn assign_dup_cookie(&mut self, entry: &Arc<DirEntry>) {
        let hash = entry.hash();
        match self.alloc_dup_cookie(hash) {
            Some(cookie) => entry.set_cookie(cookie),
            None => {
                let max = self.dup_range.1;
                tracing::warn!(
                    "duplicate cookie range exhausted; entry with hash {:#x} gets {:#x}",
                    hash,
                    max
                );
                entry.set_cookie(max);
                self.overflow.push(Arc::clone(entry));
            }
        }
    }

    fn alloc_dup_cookie(&mut self, hash: u64) -> Option<u64> {
        let (min, max) = self.dup_range;
        // Retired cookies count toward the top so they are reused only once
        // the range has wrapped.
        let top = self.dup_index.keys().next_back().max(self.retired.keys().next_back());
        let cookie = match top {
            None => min,
            Some(&top) if top < max => top + 1,
            Some(_) => self.find_dup_gap()?,
        };
        self.retired.remove(&cookie);
        self.dup_index.insert(cookie, hash);
        Some(cookie)
    }

    /// Highest unused cookie below the top of the range, scanning down.
    fn find_dup_gap(&self) -> Option<u64> {
        let (min, max) = self.dup_range;
        let mut above = max + 1;
        for &cookie in self.dup_index.keys().rev() {
            if above - cookie > 1 {
                return Some(above - 1);
            }
            above = cookie;
        }
        (above > min).then(|| above - 1)
    }

    fn resolve(&self, cookie: u64) -> Position {
        if cookie == COOKIE_EOF {
            return Position::End;
        }
        if cookie < COOKIE_MIN {
            return Position::Hash(COOKIE_MIN);
        }
        if !is_dup_cookie(cookie) {
            return Position::Hash(cookie);
        }
        if let Some(cache) = self.cursor.filter(|c| c.cookie == cookie) {
            return Position::Dup {
                hash: cache.hash,
                cookie,
            };
        }
        if let Some(&hash) = self.dup_index.get(&cookie) {
            return Position::Dup { hash, cookie };
        }
        if let Some(&hash) = self.retired.get(&cookie) {
            return Position::Dup { hash, cookie };
        }
        // Never issued, or its tombstone was evicted: continue with the next
        // surviving duplicate.
        match self.dup_index.range(cookie..).next() {
            Some((&next, &hash)) => Position::Dup { hash, cookie: next },
            None => Position::End,
        }
    }

    fn entries_at(&self, pos: Position) -> impl Iterator<Item = &Arc<DirEntry>> + '_ {
        let (head, min_cookie, rest) = match pos {
            Position::Hash(h) => (None, 0, (Bound::Included(h), Bound::Unbounded)),
            Position::Dup { hash, cookie } => {
                let head = match self.tree.get(&hash) {
                    Some(Slot::Dup(head)) => Some(head),
                    _ => None,
                };
                (head, cookie, (Bound::Excluded(hash), Bound::Unbounded))
            }
            Position::End => (None, 0, (Bound::Excluded(u64::MAX), Bound::Unbounded)),
        };
        head.into_iter()
            .flat_map(|h| h.entries.iter())
            .filter(move |e| e.cookie() >= min_cookie)
            .chain(self.tree.range(rest).flat_map(|(_, slot)| slot.entries()))
    }

    /// Every entry in iteration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DirEntry>> + '_ {
        self.entries_at(Position::Hash(0))
    }

    /// Up to `limit` entries starting at `cookie`, plus the cookie of the
    /// first entry not returned (`COOKIE_EOF` when exhausted).
    ///
    /// The iteration position only moves forward: hash order, and cookie
    /// order inside a duplicate head. The raw cookies returned are not
    /// increasing, since duplicate cookies sit above every hash value.
    pub fn read_from(&mut self, cookie: u64, limit: usize) -> (Vec<Arc<DirEntry>>, u64) {
        let pos = self.resolve(cookie);
        let (batch, next) = {
            let mut iter = self.entries_at(pos);
            let batch: Vec<Arc<DirEntry>> = iter.by_ref().take(limit).cloned().collect();
            (batch, iter.next().map(|e| (e.cookie(), e.hash())))
        };
        match next {
            Some((cookie, hash)) => {
                self.cursor = Some(CursorCache { cookie, hash });
                (batch, cookie)
            }
            None => {
                self.cursor = None;
                (batch, COOKIE_EOF)
            }
        }
    }
}
