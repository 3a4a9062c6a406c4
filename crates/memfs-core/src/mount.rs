// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount: node lifecycle and the operations the VFS layer drives
//!
//! Every directory entry holds one reference on its node, as does every
//! bound handle and the mount itself for the root. A node is destroyed when
//! both its reference count and its link count are zero. Payload teardown
//! always runs after the node's own lock is dropped by the caller chain, and
//! the children of a destroyed directory are released from a work list
//! rather than by recursion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::accounting::{MountAccounting, SystemBudget};
use crate::binder::{self, Handle};
use crate::config::MountConfig;
use crate::dirindex::{DirEntry, COOKIE_DOT, COOKIE_DOTDOT, COOKIE_EOF, COOKIE_MIN};
use crate::error::{FsError, FsResult};
use crate::fault::FaultInjector;
use crate::node::{Node, NodeState, NodeStatus, Payload};
use crate::pages::PageCtx;
use crate::types::{
    current_timestamp, Attributes, BindingState, DirEntryInfo, FsStats, HandleId, NodeId,
    NodeSpec, NodeType, Owner, ReadDir, SetAttr,
};

pub const NAME_MAX: usize = 255;
pub const SYMLINK_MAX: usize = 1024;

/// Rename re-resolves its operands when they change between lookup and
/// locking; give up after this many attempts.
const MAX_RENAME_ATTEMPTS: u32 = 16;

/// Reject names a directory entry can never carry.
pub fn validate_name(name: &[u8]) -> FsResult<()> {
    if name.is_empty() || name == b"." || name == b".." || name.iter().any(|&b| b == b'/' || b == 0)
    {
        return Err(FsError::InvalidName);
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

#[derive(Debug)]
struct MountInner {
    config: MountConfig,
    accounting: MountAccounting,
    faults: FaultInjector,
    root: Arc<Node>,
    /// Nodes with at least one holder, keyed by id.
    live: Mutex<HashMap<NodeId, Arc<Node>>>,
    next_id: AtomicU64,
    next_handle: AtomicU64,
    next_generation: AtomicU64,
    handles: AtomicU64,
    rename_lock: Mutex<()>,
    read_only: AtomicBool,
    unmounted: AtomicBool,
}

enum RenameStep {
    Done(Option<Arc<Node>>),
    Stale,
}

/// One filesystem instance. Clones share the same mount.
#[derive(Clone, Debug)]
pub struct Mount {
    inner: Arc<MountInner>,
}

impl Mount {
    pub fn new(config: MountConfig, budget: Arc<SystemBudget>) -> Self {
        let max_pages = config.max_pages.resolve(budget.system_total_pages());
        let accounting = MountAccounting::new(budget, config.max_nodes, max_pages);
        let owner = Owner::new(config.root_uid, config.root_gid);
        let root = Arc::new_cyclic(|weak: &Weak<Node>| {
            Node::new(
                NodeId::ROOT,
                &NodeSpec::Directory,
                owner,
                config.root_mode,
                Some(weak.clone()),
                1,
                current_timestamp(),
            )
        });
        {
            let mut state = root.lock();
            // "." plus the mount point's own reference.
            state.nlink = 2;
            state.attached = true;
            state.listed = true;
        }
        accounting.force_node();

        tracing::info!(
            "mounted memfs: max_nodes={:?} max_pages={:?} read_only={}",
            config.max_nodes,
            max_pages,
            config.read_only
        );
        let read_only = config.read_only;
        Self {
            inner: Arc::new(MountInner {
                config,
                accounting,
                faults: FaultInjector::new(),
                live: Mutex::new(HashMap::from([(NodeId::ROOT, Arc::clone(&root))])),
                root,
                next_id: AtomicU64::new(NodeId::ROOT.0 + 1),
                next_handle: AtomicU64::new(1),
                next_generation: AtomicU64::new(2),
                handles: AtomicU64::new(0),
                rename_lock: Mutex::new(()),
                read_only: AtomicBool::new(read_only),
                unmounted: AtomicBool::new(false),
            }),
        }
    }

    /// Mount budgeted against the host's memory with the default reserve.
    pub fn with_host_budget(config: MountConfig) -> Self {
        Self::new(config, Arc::new(SystemBudget::host()))
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::with_config(MountConfig::default())
    }

    #[cfg(test)]
    pub(crate) fn with_config(config: MountConfig) -> Self {
        use crate::accounting::FixedMemory;
        let budget = SystemBudget::new(Arc::new(FixedMemory::unbounded()), 0);
        Self::new(config, Arc::new(budget))
    }

    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.inner.root)
    }

    pub fn config(&self) -> &MountConfig {
        &self.inner.config
    }

    pub fn accounting(&self) -> &MountAccounting {
        &self.inner.accounting
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.inner.faults
    }

    pub fn is_unmounted(&self) -> bool {
        self.inner.unmounted.load(Ordering::SeqCst)
    }

    /// Snapshot of the live-scan set.
    pub fn live_nodes(&self) -> Vec<Arc<Node>> {
        self.inner.live.lock().unwrap().values().cloned().collect()
    }

    fn ctx(&self) -> PageCtx<'_> {
        PageCtx {
            accounting: &self.inner.accounting,
            faults: &self.inner.faults,
        }
    }

    fn check_live(&self) -> FsResult<()> {
        if self.is_unmounted() {
            return Err(FsError::Busy);
        }
        Ok(())
    }

    fn check_writable(&self) -> FsResult<()> {
        self.check_live()?;
        if self.inner.read_only.load(Ordering::SeqCst) {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    fn list(&self, node: &Arc<Node>) {
        self.inner
            .live
            .lock()
            .unwrap()
            .insert(node.id(), Arc::clone(node));
    }

    fn unlist(&self, id: NodeId) {
        self.inner.live.lock().unwrap().remove(&id);
    }

    // ---- reference counting ----

    /// Take a reference. Fails with `NotFound` once the node is destroyed.
    pub fn acquire(&self, node: &Arc<Node>) -> FsResult<()> {
        let mut state = node.lock();
        if state.destroyed {
            return Err(FsError::NotFound);
        }
        self.acquire_locked(node, &mut state);
        Ok(())
    }

    fn acquire_locked(&self, node: &Arc<Node>, state: &mut NodeState) {
        if node.refcount_inc() == 0 && state.attached && !state.listed {
            state.listed = true;
            self.list(node);
        }
    }

    pub fn release(&self, node: &Arc<Node>) {
        self.free_locked(node, false);
    }

    /// Drop one reference. With `detach`, the node (and anything its
    /// destruction releases) stops counting against the mount right away,
    /// even if other holders keep it alive.
    pub fn free_locked(&self, node: &Arc<Node>, detach: bool) {
        let mut work = vec![Arc::clone(node)];
        while let Some(node) = work.pop() {
            for entry in self.put_ref(&node, detach) {
                if let Some(child) = entry.node() {
                    self.drop_link(child);
                    work.push(Arc::clone(child));
                }
            }
        }
    }

    /// Returns the entries of a directory destroyed by this release.
    fn put_ref(&self, node: &Arc<Node>, detach: bool) -> Vec<Arc<DirEntry>> {
        let prev = node.refcount_dec();
        if prev > 1 && !detach {
            return Vec::new();
        }

        let mut state = node.lock();
        if detach {
            self.detach_locked(node, &mut state);
        }
        if node.refcount() != 0 || state.destroyed {
            return Vec::new();
        }
        if state.nlink > 0 {
            // Still reachable through entries; only leaves the scan set.
            if state.listed {
                state.listed = false;
                self.unlist(node.id());
            }
            return Vec::new();
        }

        state.destroyed = true;
        self.detach_locked(node, &mut state);
        let orphans = match &mut state.payload {
            Payload::Regular(pages) => {
                let released = pages.clear(self.ctx());
                tracing::trace!("node {} released {} pages", node.id(), released);
                Vec::new()
            }
            Payload::Directory(dir) => {
                dir.parent = None;
                dir.index.drain()
            }
            Payload::Empty => {
                if let Some(target) = node.symlink() {
                    target.clear();
                }
                Vec::new()
            }
        };
        drop(state);
        tracing::debug!("destroyed node {} ({:?})", node.id(), node.node_type());
        orphans
    }

    fn detach_locked(&self, node: &Arc<Node>, state: &mut NodeState) {
        if !state.attached {
            return;
        }
        state.attached = false;
        if state.listed {
            state.listed = false;
            self.unlist(node.id());
        }
        self.inner.accounting.release_node();
    }

    /// Account for an entry naming `child` going away without the usual
    /// unlink bookkeeping (its directory is being torn down).
    fn drop_link(&self, child: &Arc<Node>) {
        let mut state = child.lock();
        if child.is_dir() {
            if let Ok(dir) = state.dir_mut() {
                dir.parent = None;
            }
            state.nlink = 0;
        } else {
            assert!(state.nlink > 0, "link count underflow on node {}", child.id());
            state.nlink -= 1;
        }
    }

    // ---- namespace ----

    /// Allocate a node and link it into `parent` under `name`.
    pub fn create(
        &self,
        parent: &Arc<Node>,
        name: &[u8],
        spec: NodeSpec,
        owner: Owner,
        mode: u32,
    ) -> FsResult<Arc<Node>> {
        self.check_writable()?;
        validate_name(name)?;
        if let NodeSpec::Symlink { target } = &spec {
            if target.is_empty() {
                return Err(FsError::InvalidArgument);
            }
            if target.len() > SYMLINK_MAX {
                return Err(FsError::NameTooLong);
            }
        }
        if !parent.is_dir() {
            return Err(FsError::NotADirectory);
        }

        self.inner.accounting.reserve_node()?;
        let created = {
            let mut state = parent.lock();
            self.create_locked(parent, &mut state, name, &spec, owner, mode)
        };
        match created {
            Ok(node) => {
                // Drop the allocation reference; the entry keeps its own.
                self.release(&node);
                tracing::debug!(
                    "created {:?} {} as {:?} in {}",
                    spec.node_type(),
                    node.id(),
                    String::from_utf8_lossy(name),
                    parent.id()
                );
                Ok(node)
            }
            Err(err) => {
                self.inner.accounting.release_node();
                Err(err)
            }
        }
    }

    fn create_locked(
        &self,
        parent: &Arc<Node>,
        state: &mut NodeState,
        name: &[u8],
        spec: &NodeSpec,
        owner: Owner,
        mode: u32,
    ) -> FsResult<Arc<Node>> {
        let dir = state.dir()?;
        if state.destroyed || dir.parent.is_none() {
            return Err(FsError::NotFound);
        }
        if dir.index.lookup(name).is_some_and(|e| !e.is_whiteout()) {
            return Err(FsError::AlreadyExists);
        }

        let id = NodeId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let back = matches!(spec, NodeSpec::Directory).then(|| Arc::downgrade(parent));
        let node = Arc::new(Node::new(
            id,
            spec,
            owner,
            mode,
            back,
            generation,
            current_timestamp(),
        ));
        {
            let mut child = node.lock();
            child.attached = true;
            child.listed = true;
            child.nlink += 1;
            node.refcount_inc();
        }
        self.list(&node);

        if node.is_dir() {
            state.nlink += 1;
        }
        let entry = Arc::new(DirEntry::new(name, Some(Arc::clone(&node))));
        if let Some(whiteout) = state.dir_mut()?.index.attach(entry) {
            assert!(whiteout.is_whiteout(), "create displaced a live entry");
        }
        state.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        Ok(node)
    }

    /// Find `name` in `dir`. Whiteouts come back as entries without a node.
    pub fn lookup(&self, dir: &Arc<Node>, name: &[u8]) -> FsResult<Arc<DirEntry>> {
        self.check_live()?;
        validate_name(name)?;
        let state = dir.lock();
        state
            .dir()?
            .index
            .lookup(name)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    /// Add another name for a non-directory node.
    pub fn link(&self, dir: &Arc<Node>, name: &[u8], node: &Arc<Node>) -> FsResult<()> {
        self.check_writable()?;
        validate_name(name)?;
        if node.is_dir() {
            return Err(FsError::NotPermitted);
        }
        let mut state = dir.lock();
        let d = state.dir()?;
        if d.parent.is_none() {
            return Err(FsError::NotFound);
        }
        if d.index.lookup(name).is_some_and(|e| !e.is_whiteout()) {
            return Err(FsError::AlreadyExists);
        }
        {
            let mut target = node.lock();
            if target.destroyed || target.nlink == 0 {
                return Err(FsError::NotFound);
            }
            self.acquire_locked(node, &mut target);
            target.nlink += 1;
            target.touch(NodeStatus::CHANGED);
        }
        state
            .dir_mut()?
            .index
            .attach(Arc::new(DirEntry::new(name, Some(Arc::clone(node)))));
        state.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        Ok(())
    }

    /// Remove a non-directory entry.
    pub fn unlink(&self, dir: &Arc<Node>, name: &[u8]) -> FsResult<()> {
        self.check_writable()?;
        validate_name(name)?;
        let child = {
            let mut state = dir.lock();
            let index = &mut state.dir_mut()?.index;
            let entry = index.lookup(name).cloned().ok_or(FsError::NotFound)?;
            let child = entry.node().cloned().ok_or(FsError::NotFound)?;
            if child.is_dir() {
                return Err(FsError::IsADirectory);
            }
            index.detach(&entry);
            {
                let mut cs = child.lock();
                assert!(cs.nlink > 0, "link count underflow on node {}", child.id());
                cs.nlink -= 1;
                cs.touch(NodeStatus::CHANGED);
            }
            state.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
            child
        };
        self.release(&child);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, dir: &Arc<Node>, name: &[u8]) -> FsResult<()> {
        self.check_writable()?;
        validate_name(name)?;
        let child = {
            let mut state = dir.lock();
            let index = &mut state.dir_mut()?.index;
            let entry = index.lookup(name).cloned().ok_or(FsError::NotFound)?;
            let child = entry.node().cloned().ok_or(FsError::NotFound)?;
            if !child.is_dir() {
                return Err(FsError::NotADirectory);
            }
            {
                let mut cs = child.lock();
                let cdir = cs.dir_mut()?;
                if !cdir.index.is_empty() {
                    return Err(FsError::NotEmpty);
                }
                cdir.parent = None;
                cs.nlink = 0;
                cs.touch(NodeStatus::CHANGED);
            }
            index.detach(&entry);
            state.nlink -= 1;
            state.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
            child
        };
        self.release(&child);
        Ok(())
    }

    /// Insert a whiteout marker.
    pub fn whiteout(&self, dir: &Arc<Node>, name: &[u8]) -> FsResult<()> {
        self.check_writable()?;
        validate_name(name)?;
        let mut state = dir.lock();
        let d = state.dir_mut()?;
        if d.parent.is_none() {
            return Err(FsError::NotFound);
        }
        if d.index.lookup(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        d.index.attach(Arc::new(DirEntry::new(name, None)));
        state.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        Ok(())
    }

    pub fn remove_whiteout(&self, dir: &Arc<Node>, name: &[u8]) -> FsResult<()> {
        self.check_writable()?;
        validate_name(name)?;
        let mut state = dir.lock();
        let index = &mut state.dir_mut()?.index;
        let entry = index.lookup(name).cloned().ok_or(FsError::NotFound)?;
        if !entry.is_whiteout() {
            return Err(FsError::InvalidArgument);
        }
        index.detach(&entry);
        state.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        Ok(())
    }

    fn is_ancestor(&self, ancestor: &Arc<Node>, node: &Arc<Node>) -> bool {
        let mut cur = Arc::clone(node);
        loop {
            if Arc::ptr_eq(&cur, ancestor) {
                return true;
            }
            match cur.parent() {
                Some(parent) if !Arc::ptr_eq(&parent, &cur) => cur = parent,
                _ => return false,
            }
        }
    }

    /// Move `src_name` in `src_dir` to `dst_name` in `dst_dir`, replacing a
    /// compatible target.
    pub fn rename(
        &self,
        src_dir: &Arc<Node>,
        src_name: &[u8],
        dst_dir: &Arc<Node>,
        dst_name: &[u8],
    ) -> FsResult<()> {
        self.check_writable()?;
        validate_name(src_name)?;
        validate_name(dst_name)?;
        if !src_dir.is_dir() || !dst_dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let _serial = self.inner.rename_lock.lock().unwrap();

        for _ in 0..MAX_RENAME_ATTEMPTS {
            let src_entry = self.lookup(src_dir, src_name)?;
            let node = src_entry.node().cloned().ok_or(FsError::NotFound)?;
            let target = self.lookup(dst_dir, dst_name).ok();
            if let Some(existing) = target.as_ref().and_then(|t| t.node()) {
                if Arc::ptr_eq(existing, &node) {
                    return Ok(());
                }
                match (node.is_dir(), existing.is_dir()) {
                    (true, false) => return Err(FsError::NotADirectory),
                    (false, true) => return Err(FsError::IsADirectory),
                    _ => {}
                }
                if existing.is_dir() && self.is_ancestor(existing, src_dir) {
                    return Err(FsError::NotEmpty);
                }
            }
            if node.is_dir() && self.is_ancestor(&node, dst_dir) {
                return Err(FsError::InvalidArgument);
            }

            let step = if Arc::ptr_eq(src_dir, dst_dir) {
                let mut state = src_dir.lock();
                self.rename_locked(&mut state, None, dst_dir, &src_entry, target.as_ref(), &node, dst_name)
            } else {
                let src_first = !self.is_ancestor(dst_dir, src_dir)
                    && (self.is_ancestor(src_dir, dst_dir) || src_dir.id() < dst_dir.id());
                let (mut s, mut d) = if src_first {
                    let s = src_dir.lock();
                    (s, dst_dir.lock())
                } else {
                    let d = dst_dir.lock();
                    (src_dir.lock(), d)
                };
                self.rename_locked(&mut s, Some(&mut *d), dst_dir, &src_entry, target.as_ref(), &node, dst_name)
            };
            match step? {
                RenameStep::Done(replaced) => {
                    if let Some(old) = replaced {
                        self.release(&old);
                    }
                    tracing::debug!(
                        "renamed {} to {:?} in {}",
                        node.id(),
                        String::from_utf8_lossy(dst_name),
                        dst_dir.id()
                    );
                    return Ok(());
                }
                RenameStep::Stale => continue,
            }
        }
        Err(FsError::Busy)
    }

    #[allow(clippy::too_many_arguments)]
    fn rename_locked(
        &self,
        src: &mut NodeState,
        mut dst: Option<&mut NodeState>,
        dst_dir: &Arc<Node>,
        src_entry: &Arc<DirEntry>,
        target: Option<&Arc<DirEntry>>,
        node: &Arc<Node>,
        dst_name: &[u8],
    ) -> FsResult<RenameStep> {
        let sdir = src.dir()?;
        if sdir.parent.is_none() {
            return Err(FsError::NotFound);
        }
        if !sdir
            .index
            .lookup(src_entry.name())
            .is_some_and(|e| Arc::ptr_eq(e, src_entry))
        {
            return Ok(RenameStep::Stale);
        }
        {
            let d = match dst.as_deref_mut() {
                Some(d) => d,
                None => &mut *src,
            };
            let ddir = d.dir()?;
            if ddir.parent.is_none() {
                return Err(FsError::NotFound);
            }
            match (ddir.index.lookup(dst_name), target) {
                (None, None) => {}
                (Some(current), Some(expected)) if Arc::ptr_eq(current, expected) => {}
                _ => return Ok(RenameStep::Stale),
            }
        }
        if let Some(existing) = target.and_then(|t| t.node()) {
            if existing.is_dir() && !existing.lock().dir()?.index.is_empty() {
                return Err(FsError::NotEmpty);
            }
        }

        src.dir_mut()?.index.detach(src_entry);
        let entry = Arc::new(DirEntry::new(dst_name, Some(Arc::clone(node))));
        let replaced = {
            let d = match dst.as_deref_mut() {
                Some(d) => d,
                None => &mut *src,
            };
            let replaced = d.dir_mut()?.index.attach(entry).and_then(|e| e.node().cloned());
            if let Some(old) = &replaced {
                let mut os = old.lock();
                if old.is_dir() {
                    if let Ok(odir) = os.dir_mut() {
                        odir.parent = None;
                    }
                    os.nlink = 0;
                    d.nlink -= 1;
                } else {
                    os.nlink -= 1;
                }
                os.touch(NodeStatus::CHANGED);
            }
            replaced
        };

        {
            let mut ns = node.lock();
            if let Ok(ndir) = ns.dir_mut() {
                ndir.parent = Some(Arc::downgrade(dst_dir));
                if let Some(d) = dst.as_deref_mut() {
                    src.nlink -= 1;
                    d.nlink += 1;
                }
            }
            ns.touch(NodeStatus::CHANGED);
        }
        src.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        if let Some(d) = dst {
            d.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        }
        Ok(RenameStep::Done(replaced))
    }

    /// Up to `max_entries` records starting at `cookie`.
    pub fn readdir(&self, dir: &Arc<Node>, cookie: u64, max_entries: usize) -> FsResult<ReadDir> {
        self.check_live()?;
        let mut state = dir.lock();
        let parent = state.dir()?.parent.as_ref().and_then(Weak::upgrade);
        let mut entries = Vec::new();
        let mut cookie = cookie;

        if cookie == COOKIE_DOT && entries.len() < max_entries {
            entries.push(DirEntryInfo {
                name: b".".to_vec(),
                id: dir.id(),
                kind: Some(NodeType::Directory),
                cookie: COOKIE_DOT,
            });
            cookie = COOKIE_DOTDOT;
        }
        if cookie == COOKIE_DOTDOT && entries.len() < max_entries {
            let parent = parent.ok_or(FsError::NotFound)?;
            entries.push(DirEntryInfo {
                name: b"..".to_vec(),
                id: parent.id(),
                kind: Some(NodeType::Directory),
                cookie: COOKIE_DOTDOT,
            });
            cookie = COOKIE_MIN;
        }

        let next_cookie = if cookie == COOKIE_EOF || entries.len() >= max_entries {
            cookie
        } else {
            let room = max_entries - entries.len();
            let (batch, next) = state.dir_mut()?.index.read_from(cookie, room);
            entries.extend(batch.iter().map(entry_info));
            next
        };
        state.touch(NodeStatus::ACCESSED);
        Ok(ReadDir {
            entries,
            next_cookie,
        })
    }

    // ---- data ----

    pub fn read(&self, node: &Arc<Node>, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.check_live()?;
        let mut state = node.lock();
        let n = state.file()?.read(self.ctx(), offset, buf)?;
        state.touch(NodeStatus::ACCESSED);
        Ok(n)
    }

    fn check_file_size(&self, end: u64) -> FsResult<()> {
        match self.inner.config.max_file_size {
            Some(max) if end > max => Err(FsError::FileTooLarge),
            _ => Ok(()),
        }
    }

    pub fn write(&self, node: &Arc<Node>, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.check_writable()?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::FileTooLarge)?;
        self.check_file_size(end)?;
        let mut state = node.lock();
        let n = state.file_mut()?.write(self.ctx(), offset, data)?;
        state.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        Ok(n)
    }

    pub fn truncate(&self, node: &Arc<Node>, size: u64) -> FsResult<()> {
        self.truncate_with(node, size, false)
    }

    /// Truncate, optionally leaving a partial last page unzeroed when the
    /// zero fill fails. Teardown callers that no longer care about the freed
    /// bytes pass `ignore_errors`.
    pub fn truncate_with(&self, node: &Arc<Node>, size: u64, ignore_errors: bool) -> FsResult<()> {
        self.check_writable()?;
        self.check_file_size(size)?;
        let mut state = node.lock();
        state.file_mut()?.resize(self.ctx(), size, ignore_errors)?;
        state.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        Ok(())
    }

    /// Deallocate a byte range; returns the range actually affected.
    pub fn punch_hole(&self, node: &Arc<Node>, offset: u64, len: u64) -> FsResult<(u64, u64)> {
        self.check_writable()?;
        let mut state = node.lock();
        let punched = state.file_mut()?.punch_hole(self.ctx(), offset, len)?;
        if punched.1 > 0 {
            state.touch(NodeStatus::MODIFIED | NodeStatus::CHANGED);
        }
        Ok(punched)
    }

    /// Symlink target, read without taking the node lock.
    pub fn readlink(&self, node: &Arc<Node>) -> FsResult<Vec<u8>> {
        self.check_live()?;
        let target = node.symlink().ok_or(FsError::InvalidArgument)?;
        target.get().map(<[u8]>::to_vec).ok_or(FsError::NotFound)
    }

    // ---- attributes ----

    pub fn getattr(&self, node: &Arc<Node>) -> FsResult<Attributes> {
        self.check_live()?;
        let mut state = node.lock();
        state.fold_times(current_timestamp());
        Ok(node.attributes_locked(&state))
    }

    /// Fold pending timestamp updates without reading attributes.
    pub fn sync_times(&self, node: &Arc<Node>) -> FsResult<()> {
        self.check_live()?;
        node.lock().fold_times(current_timestamp());
        Ok(())
    }

    pub fn setattr(&self, node: &Arc<Node>, attr: &SetAttr) -> FsResult<Attributes> {
        self.check_writable()?;
        if let Some(size) = attr.size {
            self.truncate(node, size)?;
        }
        let mut state = node.lock();
        if let Some(mode) = attr.mode {
            state.mode = mode & 0o7777;
        }
        if let Some(uid) = attr.uid {
            state.uid = uid;
        }
        if let Some(gid) = attr.gid {
            state.gid = gid;
        }
        if let Some(atime) = attr.atime {
            state.times.atime = atime;
            state.status.remove(NodeStatus::ACCESSED);
        }
        if let Some(mtime) = attr.mtime {
            state.times.mtime = mtime;
            state.status.remove(NodeStatus::MODIFIED);
        }
        state.touch(NodeStatus::CHANGED);
        state.fold_times(current_timestamp());
        Ok(node.attributes_locked(&state))
    }

    // ---- handles ----

    pub fn get_handle(&self, node: &Arc<Node>) -> FsResult<Handle> {
        self.check_live()?;
        binder::get_or_create(self, node)
    }

    /// Give up one clone of a handle; the last one unbinds it.
    pub fn drop_handle(&self, handle: Handle) {
        drop(handle);
    }

    pub fn binding_state(&self, node: &Arc<Node>) -> BindingState {
        node.lock().binding.state()
    }

    pub(crate) fn next_handle_id(&self) -> HandleId {
        HandleId::new(self.inner.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn handle_bound(&self, _node: &Arc<Node>) {
        self.inner.handles.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn handle_reclaimed(&self, node: &Arc<Node>) {
        self.inner.handles.fetch_sub(1, Ordering::SeqCst);
        self.release(node);
    }

    // ---- memory manager hooks ----

    /// A page of `node` became backed. Returns whether it was newly counted.
    pub fn on_page_materialized(&self, node: &Arc<Node>, index: u64) -> FsResult<bool> {
        let mut state = node.lock();
        let counted = state.file_mut()?.page_inserted(index);
        if counted {
            self.inner.accounting.charge_pages(1);
            tracing::trace!("node {} page {} materialized", node.id(), index);
        }
        Ok(counted)
    }

    /// A page of `node` stopped being backed. Returns whether it was counted.
    pub fn on_page_released(&self, node: &Arc<Node>, index: u64) -> FsResult<bool> {
        let mut state = node.lock();
        let counted = state.file_mut()?.page_removed(index);
        if counted {
            self.inner.accounting.release_pages(1);
            tracing::trace!("node {} page {} released", node.id(), index);
        }
        Ok(counted)
    }

    pub fn query_admission(&self, pages: u64) -> bool {
        self.inner.accounting.admit(pages)
    }

    // ---- mount state ----

    pub fn statfs(&self) -> FsStats {
        let acct = &self.inner.accounting;
        FsStats {
            nodes_in_use: acct.nodes_in_use(),
            nodes_max: acct.max_nodes(),
            data_pages: acct.data_pages(),
            metadata_pages: acct.metadata_pages(),
            pages_in_use: acct.pages_in_use(),
            pages_max: acct.max_pages(),
            pages_available: acct.budget().pages_available(),
            live_nodes: self.inner.live.lock().unwrap().len() as u64,
            handles: self.inner.handles.load(Ordering::SeqCst),
            read_only: self.inner.read_only.load(Ordering::SeqCst),
        }
    }

    pub fn set_read_only(&self, read_only: bool) -> FsResult<()> {
        self.check_live()?;
        self.inner.read_only.store(read_only, Ordering::SeqCst);
        tracing::info!("memfs now {}", if read_only { "read-only" } else { "read-write" });
        Ok(())
    }

    /// Tear the tree down. Without `force`, refuses while handles are bound.
    /// Nodes kept alive by handles stop counting against the mount now and
    /// release their pages when the last handle goes.
    pub fn unmount(&self, force: bool) -> FsResult<()> {
        let handles = self.inner.handles.load(Ordering::SeqCst);
        if !force && handles > 0 {
            return Err(FsError::Busy);
        }
        if self.inner.unmounted.swap(true, Ordering::SeqCst) {
            return Err(FsError::Busy);
        }
        tracing::info!("unmounting memfs: force={} handles={}", force, handles);

        let root = &self.inner.root;
        let mut dirs = vec![Arc::clone(root)];
        let mut linked = Vec::new();
        while let Some(dir) = dirs.pop() {
            let entries = match dir.lock().dir_mut() {
                Ok(d) => d.index.drain(),
                Err(_) => Vec::new(),
            };
            for entry in entries {
                let Some(child) = entry.node() else { continue };
                self.drop_link(child);
                if child.is_dir() {
                    dirs.push(Arc::clone(child));
                }
                linked.push(Arc::clone(child));
            }
        }
        {
            let mut state = root.lock();
            state.nlink = 0;
            if let Ok(d) = state.dir_mut() {
                d.parent = None;
            }
        }
        for node in &linked {
            self.free_locked(node, true);
        }
        self.free_locked(root, true);

        // Unlinked nodes still held open by handles.
        for node in self.live_nodes() {
            let mut state = node.lock();
            self.detach_locked(&node, &mut state);
        }
        Ok(())
    }
}

fn entry_info(entry: &Arc<DirEntry>) -> DirEntryInfo {
    DirEntryInfo {
        name: entry.name().to_vec(),
        id: entry.node().map_or(NodeId::WHITEOUT, |n| n.id()),
        kind: entry.node().map(|n| n.node_type()),
        cookie: entry.cookie(),
    }
}
