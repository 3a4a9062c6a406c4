// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Page and node budget accounting
//!
//! Two levels are tracked. [`SystemBudget`] is shared by every mount in the
//! process and holds back a reserve of free system pages that no mount may
//! consume. [`MountAccounting`] tracks one mount's node and page usage against
//! its own ceilings.
//!
//! Reservations are taken optimistically: the counter is bumped first and the
//! result validated against the ceilings afterwards, rolling back on failure.
//! Because every increment and validating load is `SeqCst`, two racing
//! reservations can never both pass a check that only one of them fits into.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::dirindex::DirEntry;
use crate::error::{FsError, FsResult};
use crate::node::Node;
use crate::pages::PAGE_SIZE;

/// Minimum free memory kept back from all mounts: 4 MiB worth of pages.
pub const DEFAULT_RESERVED_PAGES: u64 = 4 * 1024 * 1024 / PAGE_SIZE as u64;

/// Estimated bookkeeping cost of one node, charged against the page budget.
pub const NODE_OVERHEAD_BYTES: u64 =
    (std::mem::size_of::<Node>() + std::mem::size_of::<DirEntry>()) as u64;

/// Metadata pages charged for `nodes` live nodes.
pub fn metadata_pages_for(nodes: u64) -> u64 {
    nodes.saturating_mul(NODE_OVERHEAD_BYTES).div_ceil(PAGE_SIZE as u64)
}

/// Gauge of system memory, supplied by the memory manager.
#[cfg_attr(test, mockall::automock)]
pub trait SystemMemory: Send + Sync {
    /// Pages currently free system-wide, in units of [`PAGE_SIZE`].
    fn free_pages(&self) -> u64;

    /// Total pages of system memory, in units of [`PAGE_SIZE`].
    fn total_pages(&self) -> u64;
}

/// Reads the gauge from the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostMemory;

impl HostMemory {
    fn sysconf_pages(name: libc::c_int) -> Option<u64> {
        // SAFETY: sysconf has no memory-safety preconditions.
        let (count, page) = unsafe { (libc::sysconf(name), libc::sysconf(libc::_SC_PAGESIZE)) };
        if count < 0 || page <= 0 {
            return None;
        }
        Some((count as u64).saturating_mul(page as u64) / PAGE_SIZE as u64)
    }
}

impl SystemMemory for HostMemory {
    #[cfg(target_os = "linux")]
    fn free_pages(&self) -> u64 {
        Self::sysconf_pages(libc::_SC_AVPHYS_PAGES).unwrap_or(u64::MAX)
    }

    #[cfg(not(target_os = "linux"))]
    fn free_pages(&self) -> u64 {
        self.total_pages()
    }

    fn total_pages(&self) -> u64 {
        Self::sysconf_pages(libc::_SC_PHYS_PAGES).unwrap_or(u64::MAX)
    }
}

/// Settable gauge for tests and load harnesses.
#[derive(Debug)]
pub struct FixedMemory {
    free: AtomicU64,
    total: AtomicU64,
}

impl FixedMemory {
    pub fn new(free: u64, total: u64) -> Self {
        Self {
            free: AtomicU64::new(free),
            total: AtomicU64::new(total),
        }
    }

    /// A gauge that never limits anything.
    pub fn unbounded() -> Self {
        Self::new(u64::MAX, u64::MAX)
    }

    pub fn set_free(&self, pages: u64) {
        self.free.store(pages, Ordering::SeqCst);
    }
}

impl SystemMemory for FixedMemory {
    fn free_pages(&self) -> u64 {
        self.free.load(Ordering::SeqCst)
    }

    fn total_pages(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

/// Process-wide budget shared by all mounts created with it.
pub struct SystemBudget {
    memory: Arc<dyn SystemMemory>,
    reserved_pages: u64,
}

impl SystemBudget {
    pub fn new(memory: Arc<dyn SystemMemory>, reserved_pages: u64) -> Self {
        Self {
            memory,
            reserved_pages,
        }
    }

    /// Host gauge with the default reserve.
    pub fn host() -> Self {
        Self::new(Arc::new(HostMemory), DEFAULT_RESERVED_PAGES)
    }

    pub fn system_free_pages(&self) -> u64 {
        self.memory.free_pages()
    }

    pub fn system_total_pages(&self) -> u64 {
        self.memory.total_pages()
    }

    pub fn reserved_pages(&self) -> u64 {
        self.reserved_pages
    }

    /// Free pages minus the reserve floor, saturating at zero.
    pub fn pages_available(&self) -> u64 {
        self.system_free_pages().saturating_sub(self.reserved_pages)
    }
}

impl std::fmt::Debug for SystemBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemBudget")
            .field("reserved_pages", &self.reserved_pages)
            .finish_non_exhaustive()
    }
}

/// Node and page counters for one mount.
#[derive(Debug)]
pub struct MountAccounting {
    budget: Arc<SystemBudget>,
    max_nodes: Option<u64>,
    max_pages: Option<u64>,
    nodes_in_use: AtomicU64,
    data_pages: AtomicU64,
}

impl MountAccounting {
    pub fn new(budget: Arc<SystemBudget>, max_nodes: Option<u64>, max_pages: Option<u64>) -> Self {
        Self {
            budget,
            max_nodes,
            max_pages,
            nodes_in_use: AtomicU64::new(0),
            data_pages: AtomicU64::new(0),
        }
    }

    pub fn budget(&self) -> &SystemBudget {
        &self.budget
    }

    pub fn max_nodes(&self) -> Option<u64> {
        self.max_nodes
    }

    pub fn max_pages(&self) -> Option<u64> {
        self.max_pages
    }

    pub fn nodes_in_use(&self) -> u64 {
        self.nodes_in_use.load(Ordering::SeqCst)
    }

    pub fn data_pages(&self) -> u64 {
        self.data_pages.load(Ordering::SeqCst)
    }

    pub fn metadata_pages(&self) -> u64 {
        metadata_pages_for(self.nodes_in_use())
    }

    /// Data pages plus the metadata estimate for live nodes.
    pub fn pages_in_use(&self) -> u64 {
        self.data_pages() + self.metadata_pages()
    }

    /// Whether `requested` more pages would currently be admitted.
    pub fn admit(&self, requested: u64) -> bool {
        self.check(requested, self.pages_in_use()).is_ok()
    }

    fn check(&self, requested: u64, in_use: u64) -> FsResult<()> {
        if let Some(max) = self.max_pages {
            if max.saturating_sub(in_use) < requested {
                return Err(FsError::OutOfQuota);
            }
        }
        if self.budget.pages_available() < requested {
            return Err(FsError::OutOfMemory);
        }
        Ok(())
    }

    /// Reserve `pages` data pages, failing without side effects if either
    /// the mount ceiling or the system reserve would be breached.
    pub fn reserve_pages(&self, pages: u64) -> FsResult<()> {
        if pages == 0 {
            return Ok(());
        }
        let before = self.data_pages.fetch_add(pages, Ordering::SeqCst);
        let in_use = before + metadata_pages_for(self.nodes_in_use.load(Ordering::SeqCst));
        if let Err(err) = self.check(pages, in_use) {
            self.data_pages.fetch_sub(pages, Ordering::SeqCst);
            tracing::debug!("page admission refused: requested={} in_use={} err={}", pages, in_use, err);
            return Err(err);
        }
        Ok(())
    }

    /// Count pages that are already backed, without admission.
    pub fn charge_pages(&self, pages: u64) {
        self.data_pages.fetch_add(pages, Ordering::SeqCst);
    }

    pub fn release_pages(&self, pages: u64) {
        if pages == 0 {
            return;
        }
        let before = self.data_pages.fetch_sub(pages, Ordering::SeqCst);
        assert!(
            before >= pages,
            "data page counter underflow: releasing {} of {}",
            pages,
            before
        );
    }

    /// Admit one more node. The mount's page usage with the new node's
    /// metadata estimate included must stay within the ceiling.
    pub fn reserve_node(&self) -> FsResult<()> {
        let before = self.nodes_in_use.fetch_add(1, Ordering::SeqCst);
        if let Some(max) = self.max_nodes {
            if before >= max {
                self.nodes_in_use.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!("node admission refused: {} nodes in use, max {}", before, max);
                return Err(FsError::OutOfNodes);
            }
        }
        let after = self.data_pages.load(Ordering::SeqCst) + metadata_pages_for(before + 1);
        let delta = metadata_pages_for(before + 1) - metadata_pages_for(before);
        let refused = match self.max_pages {
            Some(max) if after > max => Some(FsError::OutOfQuota),
            _ if self.budget.pages_available() < delta => Some(FsError::OutOfMemory),
            _ => None,
        };
        if let Some(err) = refused {
            self.nodes_in_use.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("node metadata admission refused: pages_after={} err={}", after, err);
            return Err(err);
        }
        Ok(())
    }

    /// Count a node that must exist regardless of budget (the root).
    pub(crate) fn force_node(&self) {
        self.nodes_in_use.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_node(&self) {
        let before = self.nodes_in_use.fetch_sub(1, Ordering::SeqCst);
        assert!(before > 0, "node counter underflow");
    }
}
