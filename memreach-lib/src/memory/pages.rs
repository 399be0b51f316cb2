use bitflags::bitflags;
use thiserror::Error;

use crate::process::ProcessHandle;

bitflags! {
    /// Page protection bits, reduced to the three flags every platform
    /// can express.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// `rwx`-style triplet, e.g. `"rw-"`.
    pub fn label(&self) -> String {
        let mut label = String::with_capacity(3);
        label.push(if self.contains(Self::READ) { 'r' } else { '-' });
        label.push(if self.contains(Self::WRITE) { 'w' } else { '-' });
        label.push(if self.contains(Self::EXECUTE) { 'x' } else { '-' });
        label
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    Private,
    Mapped,
    Image,
}

impl PageKind {
    pub fn label(&self) -> &'static str {
        match self {
            PageKind::Private => "private",
            PageKind::Mapped => "mapped",
            PageKind::Image => "image",
        }
    }
}

/// Snapshot of one contiguous region with uniform protection and backing.
/// Produced fresh on every enumeration; the target's layout may change
/// between calls.
#[derive(Clone, Debug)]
pub struct MemoryPage {
    pub base: usize,
    pub size: usize,
    pub protection: Protection,
    pub kind: PageKind,
    pub usage: Option<String>,
    pub allocation_base: usize,
}

impl MemoryPage {
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

#[derive(Error, Debug)]
pub enum EnumerationError {
    #[error("process handle is detached")]
    Detached,
    #[error("failed to query address space: {0}")]
    QueryFailed(String),
}

/// Walks the target's address space and returns every backed region,
/// ascending by base address. Partial results are never returned: the walk
/// either completes or fails as a whole.
pub fn collect_pages(handle: &ProcessHandle) -> Result<Vec<MemoryPage>, EnumerationError> {
    if !handle.is_alive() {
        return Err(EnumerationError::Detached);
    }

    let mut pages = platform::collect_os_pages(handle)?;
    pages.sort_unstable_by_key(|page| page.base);
    Ok(pages)
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{EnumerationError, MemoryPage, PageKind, Protection};
    use crate::process::ProcessHandle;

    pub fn collect_os_pages(
        handle: &ProcessHandle,
    ) -> Result<Vec<MemoryPage>, EnumerationError> {
        let maps = std::fs::read_to_string(format!("/proc/{}/maps", handle.pid()))
            .map_err(|e| EnumerationError::QueryFailed(e.to_string()))?;

        Ok(maps.lines().filter_map(parse_maps_line).collect())
    }

    pub(super) fn parse_maps_line(line: &str) -> Option<MemoryPage> {
        let mut fields = line.split_ascii_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?.as_bytes();
        let _offset = fields.next()?;
        let _device = fields.next()?;
        let _inode = fields.next()?;
        let rest: Vec<&str> = fields.collect();

        let (start, end) = range.split_once('-')?;
        let base = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if perms.len() < 4 || end <= base {
            return None;
        }

        let mut protection = Protection::empty();
        if perms[0] == b'r' {
            protection |= Protection::READ;
        }
        if perms[1] == b'w' {
            protection |= Protection::WRITE;
        }
        if perms[2] == b'x' {
            protection |= Protection::EXECUTE;
        }

        let usage = if rest.is_empty() {
            None
        } else {
            Some(rest.join(" "))
        };

        let kind = if perms[3] == b's' {
            PageKind::Mapped
        } else if usage.as_deref().map_or(false, |u| u.starts_with('/')) {
            PageKind::Image
        } else {
            PageKind::Private
        };

        Some(MemoryPage {
            base,
            size: end - base,
            protection,
            kind,
            usage,
            allocation_base: base,
        })
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::CStr;
    use std::mem::{size_of, zeroed};

    use winapi::shared::minwindef::{LPCVOID, LPVOID, MAX_PATH};
    use winapi::um::memoryapi::VirtualQueryEx;
    use winapi::um::psapi::GetMappedFileNameA;
    use winapi::um::winnt::{
        MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_IMAGE, MEM_MAPPED,
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
        PAGE_GUARD, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
    };

    use super::{EnumerationError, MemoryPage, PageKind, Protection};
    use crate::process::ProcessHandle;

    fn protection_from_mask(protect: u32) -> Protection {
        if protect & (PAGE_GUARD | PAGE_NOACCESS) != 0 {
            return Protection::empty();
        }

        let mut protection = Protection::empty();
        if protect
            & (PAGE_READONLY
                | PAGE_READWRITE
                | PAGE_WRITECOPY
                | PAGE_EXECUTE_READ
                | PAGE_EXECUTE_READWRITE
                | PAGE_EXECUTE_WRITECOPY)
            != 0
        {
            protection |= Protection::READ;
        }
        if protect
            & (PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY)
            != 0
        {
            protection |= Protection::WRITE;
        }
        if protect
            & (PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY)
            != 0
        {
            protection |= Protection::EXECUTE;
        }
        protection
    }

    fn mapped_file_name(handle: &ProcessHandle, base: usize) -> Option<String> {
        let mut name = [0i8; MAX_PATH];
        let len = unsafe {
            GetMappedFileNameA(
                handle.raw_handle(),
                base as LPVOID,
                name.as_mut_ptr(),
                MAX_PATH as u32,
            )
        };
        if len == 0 {
            return None;
        }

        let name = unsafe { CStr::from_ptr(name.as_ptr()) };
        Some(name.to_string_lossy().into_owned())
    }

    pub fn collect_os_pages(
        handle: &ProcessHandle,
    ) -> Result<Vec<MemoryPage>, EnumerationError> {
        let mut pages = Vec::new();
        let mut address = 0usize;

        loop {
            let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { zeroed() };
            let queried = unsafe {
                VirtualQueryEx(
                    handle.raw_handle(),
                    address as LPCVOID,
                    &mut mbi,
                    size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if queried == 0 {
                // The walk runs off the top of user space; a failure before
                // anything was collected means the query itself is broken.
                if pages.is_empty() {
                    return Err(EnumerationError::QueryFailed(
                        std::io::Error::last_os_error().to_string(),
                    ));
                }
                break;
            }

            let base = mbi.BaseAddress as usize;
            if mbi.State == MEM_COMMIT {
                let kind = match mbi.Type {
                    MEM_IMAGE => PageKind::Image,
                    MEM_MAPPED => PageKind::Mapped,
                    _ => PageKind::Private,
                };
                let usage = match mbi.Type {
                    MEM_IMAGE | MEM_MAPPED => mapped_file_name(handle, base),
                    _ => None,
                };

                pages.push(MemoryPage {
                    base,
                    size: mbi.RegionSize,
                    protection: protection_from_mask(mbi.Protect),
                    kind,
                    usage,
                    allocation_base: mbi.AllocationBase as usize,
                });
            }

            address = match base.checked_add(mbi.RegionSize) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(pages)
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use std::mem::{size_of, zeroed};

    use mach::kern_return::KERN_SUCCESS;
    use mach::message::mach_msg_type_number_t;
    use mach::port::mach_port_t;
    use mach::vm::mach_vm_region;
    use mach::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
    use mach::vm_region::{vm_region_basic_info_data_64_t, VM_REGION_BASIC_INFO_64};
    use mach::vm_types::{mach_vm_address_t, mach_vm_size_t};

    use super::{EnumerationError, MemoryPage, PageKind, Protection};
    use crate::process::ProcessHandle;

    pub fn collect_os_pages(
        handle: &ProcessHandle,
    ) -> Result<Vec<MemoryPage>, EnumerationError> {
        let mut pages = Vec::new();
        let mut address: mach_vm_address_t = 0;

        loop {
            let mut size: mach_vm_size_t = 0;
            let mut info: vm_region_basic_info_data_64_t = unsafe { zeroed() };
            let mut count =
                (size_of::<vm_region_basic_info_data_64_t>() / size_of::<i32>())
                    as mach_msg_type_number_t;
            let mut object_name: mach_port_t = 0;

            let result = unsafe {
                mach_vm_region(
                    handle.task_port(),
                    &mut address,
                    &mut size,
                    VM_REGION_BASIC_INFO_64,
                    &mut info as *mut _ as *mut i32,
                    &mut count,
                    &mut object_name,
                )
            };
            if result != KERN_SUCCESS {
                // KERN_INVALID_ADDRESS past the last region ends the walk.
                if pages.is_empty() {
                    return Err(EnumerationError::QueryFailed(format!(
                        "mach_vm_region failed with {result}"
                    )));
                }
                break;
            }

            let mut protection = Protection::empty();
            if info.protection & VM_PROT_READ != 0 {
                protection |= Protection::READ;
            }
            if info.protection & VM_PROT_WRITE != 0 {
                protection |= Protection::WRITE;
            }
            if info.protection & VM_PROT_EXECUTE != 0 {
                protection |= Protection::EXECUTE;
            }

            pages.push(MemoryPage {
                base: address as usize,
                size: size as usize,
                protection,
                kind: if info.shared != 0 {
                    PageKind::Mapped
                } else {
                    PageKind::Private
                },
                usage: None,
                allocation_base: address as usize,
            });

            address = match address.checked_add(size) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::{PageKind, Protection};

    #[test]
    fn protection_label_is_an_rwx_triplet() {
        assert_eq!((Protection::READ | Protection::WRITE).label(), "rw-");
        assert_eq!(Protection::empty().label(), "---");
        assert_eq!(Protection::all().label(), "rwx");
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(PageKind::Private.label(), "private");
        assert_eq!(PageKind::Mapped.label(), "mapped");
        assert_eq!(PageKind::Image.label(), "image");
    }

    #[cfg(target_os = "linux")]
    mod maps {
        use super::super::platform::parse_maps_line;
        use super::super::{PageKind, Protection};

        #[test]
        fn parses_an_anonymous_rw_mapping() {
            let page = parse_maps_line("7f5a1c000000-7f5a1c021000 rw-p 00000000 00:00 0").unwrap();
            assert_eq!(page.base, 0x7f5a1c000000);
            assert_eq!(page.size, 0x21000);
            assert_eq!(page.protection, Protection::READ | Protection::WRITE);
            assert_eq!(page.kind, PageKind::Private);
            assert!(page.usage.is_none());
            assert_eq!(page.allocation_base, page.base);
        }

        #[test]
        fn parses_a_file_backed_mapping_as_image() {
            let page = parse_maps_line(
                "7f0e8a400000-7f0e8a5c8000 r-xp 00000000 08:01 655360 /usr/lib/x86_64-linux-gnu/libc.so.6",
            )
            .unwrap();
            assert_eq!(page.kind, PageKind::Image);
            assert_eq!(
                page.usage.as_deref(),
                Some("/usr/lib/x86_64-linux-gnu/libc.so.6")
            );
            assert_eq!(page.protection, Protection::READ | Protection::EXECUTE);
        }

        #[test]
        fn parses_a_shared_mapping_as_mapped() {
            let page =
                parse_maps_line("7f0e8a600000-7f0e8a601000 rw-s 00000000 00:05 1024 /dev/shm/region")
                    .unwrap();
            assert_eq!(page.kind, PageKind::Mapped);
        }

        #[test]
        fn keeps_special_region_labels() {
            let page =
                parse_maps_line("7ffc54f22000-7ffc54f43000 rw-p 00000000 00:00 0 [stack]").unwrap();
            assert_eq!(page.usage.as_deref(), Some("[stack]"));
            assert_eq!(page.kind, PageKind::Private);
        }

        #[test]
        fn ignores_lines_that_are_not_mappings() {
            assert!(parse_maps_line("not a mapping").is_none());
        }
    }
}
