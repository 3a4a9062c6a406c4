// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Demand-paged backing store for regular files
//!
//! Pages materialize on first write and are charged to the mount as they
//! appear. Bytes past the logical size inside the last page are always zero,
//! so growing a file never has to touch memory.

use std::collections::BTreeMap;

use crate::accounting::MountAccounting;
use crate::error::{FsError, FsResult};
use crate::fault::{FaultInjector, FaultOp};

pub const PAGE_SIZE: usize = 4096;

type Page = Box<[u8; PAGE_SIZE]>;

fn zero_page() -> Page {
    Box::new([0u8; PAGE_SIZE])
}

/// Number of pages needed to hold `size` bytes.
pub fn page_count(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE as u64)
}

/// Mount-level collaborators a page store reports to.
#[derive(Clone, Copy)]
pub(crate) struct PageCtx<'a> {
    pub accounting: &'a MountAccounting,
    pub faults: &'a FaultInjector,
}

/// Materialized pages of one regular file plus its logical size.
#[derive(Debug, Default)]
pub struct PageStore {
    pages: BTreeMap<u64, Page>,
    size: u64,
}

impl PageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Pages currently charged to the mount for this file.
    pub fn charged_pages(&self) -> u64 {
        self.pages.len() as u64
    }

    pub fn is_materialized(&self, index: u64) -> bool {
        self.pages.contains_key(&index)
    }

    pub(crate) fn read(&self, ctx: PageCtx<'_>, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        ctx.faults.check(FaultOp::Read)?;
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let len = (self.size - offset).min(buf.len() as u64) as usize;
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let index = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - in_page).min(len - done);
            let dst = &mut buf[done..done + chunk];
            match self.pages.get(&index) {
                Some(page) => dst.copy_from_slice(&page[in_page..in_page + chunk]),
                None => dst.fill(0),
            }
            done += chunk;
        }
        Ok(len)
    }

    /// Write `data` at `offset`, materializing missing pages. Either every
    /// missing page is admitted or nothing changes.
    pub(crate) fn write(&mut self, ctx: PageCtx<'_>, offset: u64, data: &[u8]) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::FileTooLarge)?;
        ctx.faults.check(FaultOp::Write)?;

        let first = offset / PAGE_SIZE as u64;
        let last = (end - 1) / PAGE_SIZE as u64;
        let missing: Vec<u64> = (first..=last).filter(|i| !self.pages.contains_key(i)).collect();
        if !missing.is_empty() {
            ctx.faults.check(FaultOp::PageAlloc)?;
            ctx.accounting.reserve_pages(missing.len() as u64)?;
            for index in missing {
                self.pages.insert(index, zero_page());
            }
        }

        let mut done = 0;
        while done < data.len() {
            let pos = offset + done as u64;
            let index = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - in_page).min(data.len() - done);
            let page = self
                .pages
                .get_mut(&index)
                .unwrap_or_else(|| unreachable!("page {} materialized above", index));
            page[in_page..in_page + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        self.size = self.size.max(end);
        Ok(data.len())
    }

    /// Change the logical size. Shrinking zero-fills the tail of the new
    /// last page and releases every page past it.
    pub(crate) fn resize(
        &mut self,
        ctx: PageCtx<'_>,
        new_size: u64,
        ignore_errors: bool,
    ) -> FsResult<()> {
        let old_size = self.size;
        if new_size >= old_size {
            self.size = new_size;
            return Ok(());
        }

        let tail = (new_size % PAGE_SIZE as u64) as usize;
        if tail != 0 {
            let index = new_size / PAGE_SIZE as u64;
            self.zero_range(ctx, index, tail, PAGE_SIZE, ignore_errors)?;
        }
        let freed = self.release_from(ctx, page_count(new_size));
        if freed > 0 {
            tracing::trace!(
                "resize {} -> {} released {} pages",
                old_size,
                new_size,
                freed
            );
        }
        self.size = new_size;
        Ok(())
    }

    /// Deallocate `[offset, offset + length)`, clamped to the file size.
    /// Returns the range actually affected.
    pub(crate) fn punch_hole(
        &mut self,
        ctx: PageCtx<'_>,
        offset: u64,
        length: u64,
    ) -> FsResult<(u64, u64)> {
        if offset >= self.size {
            return Ok((offset, 0));
        }
        let length = length.min(self.size - offset);
        if length == 0 {
            return Ok((offset, 0));
        }
        let end = offset + length;
        let ps = PAGE_SIZE as u64;

        let first_index = offset / ps;
        let last_index = (end - 1) / ps;
        let head = (offset % ps) as usize;
        let tail = (end % ps) as usize;

        if first_index == last_index && (head != 0 || tail != 0) {
            let stop = if tail == 0 { PAGE_SIZE } else { tail };
            self.zero_range(ctx, first_index, head, stop, false)?;
            return Ok((offset, length));
        }
        if head != 0 {
            self.zero_range(ctx, first_index, head, PAGE_SIZE, false)?;
        }
        if tail != 0 {
            self.zero_range(ctx, last_index, 0, tail, false)?;
        }

        let whole_start = offset.div_ceil(ps);
        let whole_end = end / ps;
        if whole_start < whole_end {
            self.release_range(ctx, whole_start, whole_end);
        }
        Ok((offset, length))
    }

    fn zero_range(
        &mut self,
        ctx: PageCtx<'_>,
        index: u64,
        from: usize,
        to: usize,
        ignore_errors: bool,
    ) -> FsResult<()> {
        let Some(page) = self.pages.get_mut(&index) else {
            return Ok(());
        };
        if let Err(err) = ctx.faults.check(FaultOp::ZeroFill) {
            if !ignore_errors {
                return Err(err);
            }
            tracing::debug!("ignoring zero-fill failure on page {}: {}", index, err);
            return Ok(());
        }
        page[from..to].fill(0);
        Ok(())
    }

    fn release_from(&mut self, ctx: PageCtx<'_>, first: u64) -> u64 {
        let released = self.pages.split_off(&first).len() as u64;
        ctx.accounting.release_pages(released);
        released
    }

    fn release_range(&mut self, ctx: PageCtx<'_>, start: u64, end: u64) -> u64 {
        let doomed: Vec<u64> = self.pages.range(start..end).map(|(i, _)| *i).collect();
        for index in &doomed {
            self.pages.remove(index);
        }
        let released = doomed.len() as u64;
        ctx.accounting.release_pages(released);
        released
    }

    /// Release every page; used on node destruction.
    pub(crate) fn clear(&mut self, ctx: PageCtx<'_>) -> u64 {
        let released = self.pages.len() as u64;
        self.pages.clear();
        self.size = 0;
        ctx.accounting.release_pages(released);
        released
    }

    /// Record a page the memory manager has backed. Pages past the end of
    /// the file are ignored. Returns whether the page was newly counted;
    /// the caller charges the mount.
    pub(crate) fn page_inserted(&mut self, index: u64) -> bool {
        if index >= page_count(self.size) || self.pages.contains_key(&index) {
            return false;
        }
        self.pages.insert(index, zero_page());
        true
    }

    /// Record a page the memory manager stopped backing. Returns whether a
    /// counted page went away; the caller uncharges the mount.
    pub(crate) fn page_removed(&mut self, index: u64) -> bool {
        self.pages.remove(&index).is_some()
    }
}
