use std::time::Instant;

use log::debug;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use thiserror::Error;

use crate::process::ProcessHandle;

use super::io;
use super::pages::{collect_pages, EnumerationError, MemoryPage, PageKind, Protection};
use super::pattern::Pattern;

/// Inclusion filter over page properties: a `true` flag requires the page
/// to carry that property, a `false` flag leaves it unconstrained.
#[derive(Clone, Copy, Debug, Default)]
pub struct PageFilter {
    pub mapped: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl PageFilter {
    pub fn admits(&self, page: &MemoryPage) -> bool {
        (!self.mapped || page.kind == PageKind::Mapped)
            && (!self.readable || page.protection.contains(Protection::READ))
            && (!self.writable || page.protection.contains(Protection::WRITE))
            && (!self.executable || page.protection.contains(Protection::EXECUTE))
    }
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("process handle is detached")]
    Detached,
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),
}

/// Scans every page admitted by `filter` for `pattern` and returns the
/// matching absolute addresses, ascending.
///
/// "Not found" is an empty `Ok`; only handle and enumeration failures are
/// errors. A page that cannot be read in full is skipped so one unreadable
/// region cannot hide matches elsewhere, and matches never span two
/// non-contiguous pages.
pub fn aob_scan(
    handle: &ProcessHandle,
    pattern: &Pattern,
    filter: PageFilter,
) -> Result<Vec<usize>, ScanError> {
    if !handle.is_alive() {
        return Err(ScanError::Detached);
    }

    let pages = collect_pages(handle)?;
    let start = Instant::now();

    let mut addresses: Vec<usize> = pages
        .par_iter()
        .filter(|page| page.protection.contains(Protection::READ) && filter.admits(page))
        .flat_map_iter(|page| {
            let contents = io::read_bytes(handle, page.base, page.size);
            let hits = if contents.len() == page.size {
                pattern.find_all(&contents)
            } else {
                Vec::new()
            };
            hits.into_iter().map(move |offset| page.base + offset)
        })
        .collect();

    addresses.sort_unstable();
    debug!(
        "scan matched {} address(es) across {} page(s) in {:?}",
        addresses.len(),
        pages.len(),
        start.elapsed()
    );
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(protection: Protection, kind: PageKind) -> MemoryPage {
        MemoryPage {
            base: 0x1000,
            size: 0x1000,
            protection,
            kind,
            usage: None,
            allocation_base: 0x1000,
        }
    }

    #[test]
    fn default_filter_admits_everything() {
        let filter = PageFilter::default();
        assert!(filter.admits(&page(Protection::empty(), PageKind::Private)));
        assert!(filter.admits(&page(Protection::all(), PageKind::Image)));
    }

    #[test]
    fn each_flag_requires_its_property() {
        let filter = PageFilter {
            writable: true,
            ..Default::default()
        };
        assert!(filter.admits(&page(Protection::READ | Protection::WRITE, PageKind::Private)));
        assert!(!filter.admits(&page(Protection::READ, PageKind::Private)));

        let filter = PageFilter {
            executable: true,
            ..Default::default()
        };
        assert!(filter.admits(&page(Protection::READ | Protection::EXECUTE, PageKind::Image)));
        assert!(!filter.admits(&page(Protection::READ | Protection::WRITE, PageKind::Image)));

        let filter = PageFilter {
            mapped: true,
            ..Default::default()
        };
        assert!(filter.admits(&page(Protection::READ, PageKind::Mapped)));
        assert!(!filter.admits(&page(Protection::READ, PageKind::Private)));
    }

    #[test]
    fn unset_flags_are_not_required() {
        let filter = PageFilter {
            readable: true,
            ..Default::default()
        };
        assert!(filter.admits(&page(Protection::READ, PageKind::Image)));
    }
}
