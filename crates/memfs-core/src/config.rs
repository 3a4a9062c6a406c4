// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FsError, FsResult};
use crate::pages::PAGE_SIZE;

/// Page ceiling for a single mount
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageLimit {
    /// Bounded only by the process-wide reserve.
    #[default]
    Unlimited,
    /// Absolute number of pages.
    Pages(u64),
    /// Percentage of total system memory, sampled when the mount is created.
    Percent(u8),
}

impl PageLimit {
    /// Resolve against the total system page count; `None` means unlimited.
    pub fn resolve(self, total_system_pages: u64) -> Option<u64> {
        match self {
            PageLimit::Unlimited => None,
            PageLimit::Pages(n) => Some(n),
            PageLimit::Percent(p) => {
                Some((total_system_pages as u128 * p.min(100) as u128 / 100) as u64)
            }
        }
    }
}

/// Per-mount configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Maximum live nodes; `None` is unlimited.
    pub max_nodes: Option<u64>,
    pub max_pages: PageLimit,
    /// Largest logical size a regular file may reach; `None` is unlimited.
    pub max_file_size: Option<u64>,
    pub root_mode: u32,
    pub root_uid: u32,
    pub root_gid: u32,
    pub read_only: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            max_nodes: None,
            max_pages: PageLimit::Unlimited,
            max_file_size: None,
            root_mode: 0o755,
            root_uid: 0,
            root_gid: 0,
            read_only: false,
        }
    }
}

impl MountConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn from_json_file(path: &Path) -> FsResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_json_bytes(&bytes).map_err(|err| {
            tracing::debug!("rejecting mount config {}: {}", path.display(), err);
            FsError::InvalidArgument
        })
    }

    /// Parse a comma separated tmpfs-style option string, e.g.
    /// `size=64m,nr_inodes=10k,mode=1777,uid=0,gid=0,maxfilesize=1g,ro`.
    pub fn from_options(options: &str) -> FsResult<Self> {
        let mut config = Self::default();
        for opt in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = match opt.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (opt, None),
            };
            match (key, value) {
                ("ro", None) => config.read_only = true,
                ("rw", None) => config.read_only = false,
                ("size", Some(v)) => config.max_pages = parse_size_limit(v)?,
                ("nr_inodes", Some(v)) => {
                    config.max_nodes = match parse_scaled(v)? {
                        0 => None,
                        n => Some(n),
                    }
                }
                ("maxfilesize", Some(v)) => {
                    config.max_file_size = match parse_scaled(v)? {
                        0 => None,
                        n => Some(n),
                    }
                }
                ("mode", Some(v)) => {
                    let mode = u32::from_str_radix(v, 8).map_err(|_| FsError::InvalidArgument)?;
                    if mode > 0o7777 {
                        return Err(FsError::InvalidArgument);
                    }
                    config.root_mode = mode;
                }
                ("uid", Some(v)) => config.root_uid = v.parse().map_err(|_| FsError::InvalidArgument)?,
                ("gid", Some(v)) => config.root_gid = v.parse().map_err(|_| FsError::InvalidArgument)?,
                _ => {
                    tracing::debug!("unknown or malformed mount option: {}", opt);
                    return Err(FsError::InvalidArgument);
                }
            }
        }
        Ok(config)
    }
}

fn parse_size_limit(value: &str) -> FsResult<PageLimit> {
    if let Some(pct) = value.strip_suffix('%') {
        let pct: u8 = pct.parse().map_err(|_| FsError::InvalidArgument)?;
        if pct == 0 || pct > 100 {
            return Err(FsError::InvalidArgument);
        }
        return Ok(PageLimit::Percent(pct));
    }
    match parse_scaled(value)? {
        0 => Ok(PageLimit::Unlimited),
        bytes => Ok(PageLimit::Pages(bytes.div_ceil(PAGE_SIZE as u64))),
    }
}

/// Number with an optional binary `k`/`m`/`g`/`t` suffix.
fn parse_scaled(value: &str) -> FsResult<u64> {
    let (digits, shift) = match value.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&value[..value.len() - 1], 10),
        Some('m') => (&value[..value.len() - 1], 20),
        Some('g') => (&value[..value.len() - 1], 30),
        Some('t') => (&value[..value.len() - 1], 40),
        _ => (value, 0),
    };
    let n: u64 = digits.parse().map_err(|_| FsError::InvalidArgument)?;
    n.checked_mul(1u64 << shift).ok_or(FsError::InvalidArgument)
}
