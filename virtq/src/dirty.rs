//! Dirty-page tracking for live migration.
//!
//! Every guest-memory write the engine issues is reported through
//! [`DirtyLog`] before the data can land, so a migration pass never misses a
//! page. Completion-element sends are reported as well, with no address, so
//! the embedder can track used-ring activity separately.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// Sink for guest-memory write notifications.
pub trait DirtyLog {
    /// Record a guest write of `len` bytes at `addr`.
    ///
    /// `is_completion` marks completion-element delivery; `addr` and `len`
    /// are 0 for those.
    fn mark_dirty(&self, addr: u64, len: u32, is_completion: bool);
}

/// Page-granular dirty map, a ready-made [`DirtyLog`].
#[derive(Debug)]
pub struct DirtyPageMap {
    page_size: u32,
    pages: RefCell<HashSet<u64>>,
    comp_marks: Cell<u64>,
}

impl DirtyPageMap {
    /// Create a map tracking pages of `page_size` bytes.
    pub fn new(page_size: u32) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::InvalidPageSize(page_size));
        }
        Ok(Self {
            page_size,
            pages: RefCell::new(HashSet::new()),
            comp_marks: Cell::new(0),
        })
    }

    /// Mark every page touched by `[addr, addr + len)`.
    pub fn add_range(&self, addr: u64, len: u32) {
        if len == 0 {
            return;
        }
        let ps = self.page_size as u64;
        let end = addr + len as u64;
        let mut pa = addr & !(ps - 1);
        let mut pages = self.pages.borrow_mut();
        while pa < end {
            pages.insert(pa);
            pa += ps;
        }
    }

    /// Take the dirty set, sorted by page address.
    pub fn drain_sorted(&self) -> Vec<u64> {
        let mut pages: Vec<u64> = self.pages.borrow_mut().drain().collect();
        pages.sort_unstable();
        pages
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages.borrow().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.borrow().is_empty()
    }

    /// Number of completion-element marks observed.
    #[inline]
    pub fn completion_marks(&self) -> u64 {
        self.comp_marks.get()
    }
}

impl DirtyLog for DirtyPageMap {
    fn mark_dirty(&self, addr: u64, len: u32, is_completion: bool) {
        if is_completion {
            self.comp_marks.set(self.comp_marks.get() + 1);
        } else {
            self.add_range(addr, len);
        }
    }
}
