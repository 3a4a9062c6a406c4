// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for MemFS

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique node identity within one mount. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Identity reported for whiteout entries, which have no node.
    pub const WHITEOUT: NodeId = NodeId(1);
    pub const ROOT: NodeId = NodeId(2);
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Node type tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Directory,
    Regular,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl NodeType {
    /// `S_IFMT` bits for this node type.
    pub fn format_bits(self) -> u32 {
        let bits = match self {
            NodeType::Directory => libc::S_IFDIR,
            NodeType::Regular => libc::S_IFREG,
            NodeType::Symlink => libc::S_IFLNK,
            NodeType::BlockDevice => libc::S_IFBLK,
            NodeType::CharDevice => libc::S_IFCHR,
            NodeType::Fifo => libc::S_IFIFO,
            NodeType::Socket => libc::S_IFSOCK,
        };
        bits as u32
    }

    pub fn from_format_bits(mode: u32) -> Option<Self> {
        let fmt = mode & libc::S_IFMT as u32;
        [
            NodeType::Directory,
            NodeType::Regular,
            NodeType::Symlink,
            NodeType::BlockDevice,
            NodeType::CharDevice,
            NodeType::Fifo,
            NodeType::Socket,
        ]
        .into_iter()
        .find(|t| t.format_bits() == fmt)
    }
}

/// What to create, together with its type-specific payload arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeSpec {
    Directory,
    Regular,
    Symlink { target: Vec<u8> },
    BlockDevice { rdev: u64 },
    CharDevice { rdev: u64 },
    Fifo,
    Socket,
}

impl NodeSpec {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeSpec::Directory => NodeType::Directory,
            NodeSpec::Regular => NodeType::Regular,
            NodeSpec::Symlink { .. } => NodeType::Symlink,
            NodeSpec::BlockDevice { .. } => NodeType::BlockDevice,
            NodeSpec::CharDevice { .. } => NodeType::CharDevice,
            NodeSpec::Fifo => NodeType::Fifo,
            NodeSpec::Socket => NodeType::Socket,
        }
    }
}

/// Owning user and group of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// File timestamps, nanoseconds since the Unix epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FileTimes {
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub birthtime: i64,
}

impl FileTimes {
    pub fn all(now: i64) -> Self {
        Self {
            atime: now,
            mtime: now,
            ctime: now,
            birthtime: now,
        }
    }
}

pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Node attributes as reported to the VFS layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub id: NodeId,
    pub node_type: NodeType,
    /// Permission bits only; combine with [`NodeType::format_bits`] for a full mode.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    /// Pages currently materialized for a regular file.
    pub pages: u64,
    pub rdev: u64,
    pub generation: u64,
    pub times: FileTimes,
}

impl Attributes {
    pub fn full_mode(&self) -> u32 {
        self.node_type.format_bits() | self.mode
    }
}

/// Attribute changes applied by `Mount::setattr`
#[derive(Clone, Debug, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

/// One record produced by `Mount::readdir`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: Vec<u8>,
    pub id: NodeId,
    /// `None` for whiteout entries.
    pub kind: Option<NodeType>,
    /// Cookie identifying this entry's position.
    pub cookie: u64,
}

/// Result of one readdir batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadDir {
    pub entries: Vec<DirEntryInfo>,
    /// Cookie to pass to the next call; `COOKIE_EOF` once the directory is exhausted.
    pub next_cookie: u64,
}

/// Handle binding state of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    Allocating,
    Bound,
    ReclaimPending,
}

/// Filesystem statistics
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub nodes_in_use: u64,
    pub nodes_max: Option<u64>,
    pub data_pages: u64,
    pub metadata_pages: u64,
    pub pages_in_use: u64,
    pub pages_max: Option<u64>,
    pub pages_available: u64,
    pub live_nodes: u64,
    /// Handles currently bound.
    pub handles: u64,
    pub read_only: bool,
}
