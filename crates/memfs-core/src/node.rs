// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem nodes
//!
//! A [`Node`] keeps its identity, type, device number and symlink target in
//! immutable fields and everything else in a [`NodeState`] behind its own
//! mutex. For directories that mutex is also the directory lock guarding the
//! entry index.
//!
//! Lock order: a directory is locked before any node it contains, and of two
//! directories the ancestor is locked first (unrelated pairs are only locked
//! together under the mount's rename lock). The mount's live-set lock may be
//! taken while a node lock is held, never the reverse.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bitflags::bitflags;

use crate::binder::Binding;
use crate::dirindex::{DirEntry, DirIndex};
use crate::error::{FsError, FsResult};
use crate::pages::PageStore;
use crate::types::{Attributes, FileTimes, NodeId, NodeSpec, NodeType, Owner};

bitflags! {
    /// Timestamp updates recorded by operations and folded in lazily.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NodeStatus: u8 {
        const ACCESSED = 0b001;
        const MODIFIED = 0b010;
        const CHANGED = 0b100;
    }
}

/// Targets up to this length live inside the node itself.
pub const INLINE_TARGET_LEN: usize = 40;

enum TargetStorage {
    Inline { len: u8, bytes: [u8; INLINE_TARGET_LEN] },
    Heap(Box<[u8]>),
}

/// Immutable symlink target, readable without taking the node lock.
///
/// The bytes are fully written before the node is shared. Destruction only
/// flips `live`, after which every reader sees the cleared state.
pub struct SymlinkTarget {
    storage: TargetStorage,
    live: AtomicBool,
}

impl SymlinkTarget {
    pub(crate) fn new(target: &[u8]) -> Self {
        let storage = if target.len() <= INLINE_TARGET_LEN {
            let mut bytes = [0u8; INLINE_TARGET_LEN];
            bytes[..target.len()].copy_from_slice(target);
            TargetStorage::Inline {
                len: target.len() as u8,
                bytes,
            }
        } else {
            TargetStorage::Heap(target.into())
        };
        Self {
            storage,
            live: AtomicBool::new(true),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.storage, TargetStorage::Inline { .. })
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            TargetStorage::Inline { len, .. } => *len as usize,
            TargetStorage::Heap(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The target, or `None` once the node has been destroyed.
    pub fn get(&self) -> Option<&[u8]> {
        if !self.live.load(Ordering::Acquire) {
            return None;
        }
        Some(match &self.storage {
            TargetStorage::Inline { len, bytes } => &bytes[..*len as usize],
            TargetStorage::Heap(bytes) => bytes,
        })
    }

    pub(crate) fn clear(&self) {
        self.live.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for SymlinkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymlinkTarget")
            .field("inline", &self.is_inline())
            .field("target", &self.get().map(String::from_utf8_lossy))
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct DirPayload {
    pub index: DirIndex,
    /// Back-reference only. `None` once the directory has been removed.
    pub parent: Option<Weak<Node>>,
}

#[derive(Debug)]
pub(crate) enum Payload {
    Directory(DirPayload),
    Regular(PageStore),
    /// Symlinks, devices, fifos and sockets keep nothing mutable.
    Empty,
}

#[derive(Debug)]
pub(crate) struct NodeState {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub times: FileTimes,
    pub status: NodeStatus,
    pub generation: u64,
    pub ever_bound: bool,
    pub binding: Binding,
    /// Counted in the mount's node total.
    pub attached: bool,
    /// Present in the mount's live-scan set.
    pub listed: bool,
    pub destroyed: bool,
    pub payload: Payload,
}

impl NodeState {
    pub fn touch(&mut self, flags: NodeStatus) {
        self.status |= flags;
    }

    /// Apply pending status flags to the timestamps.
    pub fn fold_times(&mut self, now: i64) {
        if self.status.contains(NodeStatus::ACCESSED) {
            self.times.atime = now;
        }
        if self.status.contains(NodeStatus::MODIFIED) {
            self.times.mtime = now;
        }
        if self.status.contains(NodeStatus::CHANGED) {
            self.times.ctime = now;
        }
        self.status = NodeStatus::empty();
    }

    pub fn dir(&self) -> FsResult<&DirPayload> {
        match &self.payload {
            Payload::Directory(dir) => Ok(dir),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn dir_mut(&mut self) -> FsResult<&mut DirPayload> {
        match &mut self.payload {
            Payload::Directory(dir) => Ok(dir),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn file(&self) -> FsResult<&PageStore> {
        match &self.payload {
            Payload::Regular(pages) => Ok(pages),
            Payload::Directory(_) => Err(FsError::IsADirectory),
            Payload::Empty => Err(FsError::InvalidArgument),
        }
    }

    pub fn file_mut(&mut self) -> FsResult<&mut PageStore> {
        match &mut self.payload {
            Payload::Regular(pages) => Ok(pages),
            Payload::Directory(_) => Err(FsError::IsADirectory),
            Payload::Empty => Err(FsError::InvalidArgument),
        }
    }
}

/// One filesystem object.
pub struct Node {
    id: NodeId,
    node_type: NodeType,
    rdev: u64,
    symlink: Option<SymlinkTarget>,
    /// Holders: directory entries, bound handles and transient references.
    refcount: AtomicU64,
    state: Mutex<NodeState>,
    binding_changed: Condvar,
}

impl Node {
    /// A fresh node holding one reference for its creator. Directories start
    /// with the link for their own `.` entry.
    pub(crate) fn new(
        id: NodeId,
        spec: &NodeSpec,
        owner: Owner,
        mode: u32,
        parent: Option<Weak<Node>>,
        generation: u64,
        now: i64,
    ) -> Self {
        let (payload, nlink, rdev, symlink) = match spec {
            NodeSpec::Directory => (
                Payload::Directory(DirPayload {
                    index: DirIndex::new(),
                    parent,
                }),
                1,
                0,
                None,
            ),
            NodeSpec::Regular => (Payload::Regular(PageStore::new()), 0, 0, None),
            NodeSpec::Symlink { target } => (Payload::Empty, 0, 0, Some(SymlinkTarget::new(target))),
            NodeSpec::BlockDevice { rdev } | NodeSpec::CharDevice { rdev } => {
                (Payload::Empty, 0, *rdev, None)
            }
            NodeSpec::Fifo | NodeSpec::Socket => (Payload::Empty, 0, 0, None),
        };
        Self {
            id,
            node_type: spec.node_type(),
            rdev,
            symlink,
            refcount: AtomicU64::new(1),
            state: Mutex::new(NodeState {
                mode: mode & 0o7777,
                uid: owner.uid,
                gid: owner.gid,
                nlink,
                times: FileTimes::all(now),
                status: NodeStatus::empty(),
                generation,
                ever_bound: false,
                binding: Binding::Unbound,
                attached: false,
                listed: false,
                destroyed: false,
                payload,
            }),
            binding_changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    pub fn rdev(&self) -> u64 {
        self.rdev
    }

    pub fn symlink(&self) -> Option<&SymlinkTarget> {
        self.symlink.as_ref()
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn nlink(&self) -> u32 {
        self.lock().nlink
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Parent directory; the root is its own parent. `None` for
    /// non-directories and removed directories.
    pub fn parent(&self) -> Option<Arc<Node>> {
        self.lock().dir().ok()?.parent.as_ref()?.upgrade()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn wait_binding<'a>(
        &self,
        guard: MutexGuard<'a, NodeState>,
        timeout: Duration,
    ) -> MutexGuard<'a, NodeState> {
        self.binding_changed.wait_timeout(guard, timeout).unwrap().0
    }

    pub(crate) fn notify_binding(&self) {
        self.binding_changed.notify_all();
    }

    /// Returns the previous count.
    pub(crate) fn refcount_inc(&self) -> u64 {
        self.refcount.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the previous count.
    pub(crate) fn refcount_dec(&self) -> u64 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "release of node {} without matching acquire", self.id);
        prev
    }

    pub(crate) fn attributes_locked(&self, state: &NodeState) -> Attributes {
        let (size, pages) = match &state.payload {
            Payload::Regular(store) => (store.size(), store.charged_pages()),
            Payload::Directory(dir) => (
                (dir.index.len() as u64 + 2) * std::mem::size_of::<DirEntry>() as u64,
                0,
            ),
            Payload::Empty => (self.symlink.as_ref().map_or(0, |t| t.len() as u64), 0),
        };
        Attributes {
            id: self.id,
            node_type: self.node_type,
            mode: state.mode,
            uid: state.uid,
            gid: state.gid,
            nlink: state.nlink,
            size,
            pages,
            rdev: self.rdev,
            generation: state.generation,
            times: state.times,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("type", &self.node_type)
            .field("refcount", &self.refcount())
            .finish_non_exhaustive()
    }
}
