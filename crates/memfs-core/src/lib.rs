// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! MemFS Core: an in-memory filesystem engine
//!
//! Nodes live entirely in memory. Regular file data is held in sparse
//! page stores charged against per-mount and process-wide budgets, and
//! directories are hash-indexed with stable readdir cookies.
//!
//! # Example
//!
//! ```
//! use memfs_core::{Mount, MountConfig, NodeSpec, Owner, COOKIE_DOT};
//!
//! let mount = Mount::with_host_budget(MountConfig::default());
//! let root = mount.root();
//! let file = mount
//!     .create(&root, b"hello", NodeSpec::Regular, Owner::default(), 0o644)
//!     .unwrap();
//! mount.write(&file, 0, b"world").unwrap();
//!
//! let listing = mount.readdir(&root, COOKIE_DOT, 16).unwrap();
//! assert_eq!(listing.entries.len(), 3);
//! ```

pub mod accounting;
pub mod binder;
pub mod config;
pub mod dirindex;
pub mod error;
pub mod fault;
pub mod mount;
pub mod node;
pub mod pages;
pub mod types;

pub use accounting::{FixedMemory, HostMemory, MountAccounting, SystemBudget, SystemMemory};
pub use binder::Handle;
pub use config::{MountConfig, PageLimit};
pub use dirindex::{
    name_hash, DirEntry, DirIndex, COOKIE_DOT, COOKIE_DOTDOT, COOKIE_EOF, COOKIE_MIN,
};
pub use error::{FsError, FsResult};
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultRule};
pub use mount::{Mount, NAME_MAX, SYMLINK_MAX};
pub use node::{Node, NodeStatus, SymlinkTarget};
pub use pages::{PageStore, PAGE_SIZE};
pub use types::{
    Attributes, BindingState, DirEntryInfo, FileTimes, FsStats, HandleId, NodeId, NodeSpec,
    NodeType, Owner, ReadDir, SetAttr,
};

#[cfg(test)]
mod test_concurrency;
#[cfg(test)]
mod test_scenarios;
