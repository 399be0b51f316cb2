//! Fixed-layout types shared with foreign callers. Field order and sizes
//! are the contract; both sides only ever exchange these flat records plus
//! null-terminated strings, never allocator-specific objects.

use std::ffi::{c_char, CString};

use memreach_lib::memory::pages::MemoryPage;

/// Flat view of a variable-length array: element pointer, element count,
/// capacity, and total byte size. `size / count` recovers the element width
/// when `count > 0`; an empty buffer has size 0 and may carry a null
/// pointer.
///
/// The producer owns the allocation. A consumer copies what it needs during
/// one decode pass and then hands the buffer back through the matching
/// `release_*` entry point.
#[repr(C)]
pub struct ByteBuffer {
    ptr: *mut u8,
    count: usize,
    capacity: usize,
    size: usize,
}

impl ByteBuffer {
    pub fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            count: 0,
            capacity: 0,
            size: 0,
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::from_sized_vec(bytes)
    }

    pub fn from_sized_vec<T: Sized>(vec: Vec<T>) -> Self {
        let mut vec = std::mem::ManuallyDrop::new(vec);
        Self {
            ptr: vec.as_mut_ptr() as *mut u8,
            count: vec.len(),
            capacity: vec.capacity(),
            size: std::mem::size_of::<T>() * vec.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn byte_size(&self) -> usize {
        self.size
    }

    pub fn element_size(&self) -> usize {
        if self.count == 0 {
            0
        } else {
            self.size / self.count
        }
    }

    /// # Safety
    ///
    /// `ptr` and `count` must describe a live allocation of bytes.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(self.ptr, self.count)
        }
    }

    /// # Safety
    ///
    /// `ptr` and `count` must describe a live allocation of `T`.
    pub unsafe fn as_sized_slice<T: Sized>(&self) -> &[T] {
        if self.ptr.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(self.ptr as *const T, self.count)
        }
    }

    /// # Safety
    ///
    /// The buffer must hold UTF-8 text (it is not required to be
    /// null-terminated).
    pub unsafe fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(self.as_slice())
    }

    /// Reclaims the allocation this buffer was produced from.
    ///
    /// # Safety
    ///
    /// The buffer must have been built by [`ByteBuffer::from_sized_vec`]
    /// with the same `T`, and must not be used afterwards.
    pub unsafe fn into_sized_vec<T: Sized>(self) -> Vec<T> {
        if self.ptr.is_null() {
            Vec::new()
        } else {
            Vec::from_raw_parts(self.ptr as *mut T, self.count, self.capacity)
        }
    }

    pub fn into_raw(self) -> *mut ByteBuffer {
        Box::into_raw(Box::new(self))
    }

    /// # Safety
    ///
    /// `raw` must come from [`ByteBuffer::into_raw`] and not have been
    /// released already.
    pub unsafe fn from_raw(raw: *mut ByteBuffer) -> Box<ByteBuffer> {
        Box::from_raw(raw)
    }
}

/// Tagged call outcome: a value slot and an error-message slot, exactly one
/// of them meaningful. A non-null error pointer always means failure and
/// the value slot must then be ignored.
#[repr(C)]
pub struct CallResult {
    pub value: usize,
    pub error: *mut c_char,
}

impl CallResult {
    pub fn ok(value: usize) -> Self {
        Self {
            value,
            error: std::ptr::null_mut(),
        }
    }

    pub fn err(message: impl std::fmt::Display) -> Self {
        let text = CString::new(message.to_string()).unwrap_or_default();
        Self {
            value: 0,
            error: text.into_raw(),
        }
    }

    pub fn is_err(&self) -> bool {
        !self.error.is_null()
    }
}

/// Flat page metadata record. String fields are null-terminated and owned
/// by the engine until the page buffer is released; `usage` may be null.
#[repr(C)]
pub struct PageRecord {
    pub base: usize,
    pub size: usize,
    pub flags: u32,
    pub kind: *mut c_char,
    pub protection: *mut c_char,
    pub usage: *mut c_char,
    pub allocation_base: usize,
}

fn raw_label(text: &str) -> *mut c_char {
    CString::new(text).unwrap_or_default().into_raw()
}

impl From<&MemoryPage> for PageRecord {
    fn from(page: &MemoryPage) -> Self {
        Self {
            base: page.base,
            size: page.size,
            flags: page.protection.bits(),
            kind: raw_label(page.kind.label()),
            protection: raw_label(&page.protection.label()),
            usage: match &page.usage {
                Some(usage) => raw_label(usage),
                None => std::ptr::null_mut(),
            },
            allocation_base: page.allocation_base,
        }
    }
}

impl PageRecord {
    /// # Safety
    ///
    /// Must be called exactly once, on a record produced by
    /// `From<&MemoryPage>`.
    pub(crate) unsafe fn release_labels(&mut self) {
        for ptr in [self.kind, self.protection, self.usage] {
            if !ptr.is_null() {
                drop(CString::from_raw(ptr));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;

    use memreach_lib::memory::pages::{PageKind, Protection};

    use super::*;

    #[test]
    fn byte_buffer_tracks_element_size() {
        let buffer = ByteBuffer::from_sized_vec(vec![1usize, 2, 3]);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.byte_size(), 3 * std::mem::size_of::<usize>());
        assert_eq!(buffer.element_size(), std::mem::size_of::<usize>());
        assert_eq!(unsafe { buffer.as_sized_slice::<usize>() }, &[1, 2, 3]);
        unsafe { buffer.into_sized_vec::<usize>() };
    }

    #[test]
    fn empty_byte_buffer_has_no_size() {
        let buffer = ByteBuffer::empty();
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_size(), 0);
        assert_eq!(buffer.element_size(), 0);
        assert!(unsafe { buffer.as_slice() }.is_empty());
    }

    #[test]
    fn byte_buffer_roundtrips_bytes() {
        let buffer = ByteBuffer::from_vec(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(unsafe { buffer.as_slice() }, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(
            unsafe { buffer.into_sized_vec::<u8>() },
            vec![0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn byte_buffer_decodes_text() {
        let buffer = ByteBuffer::from_vec(b"F8 01 74".to_vec());
        assert_eq!(unsafe { buffer.as_str() }.unwrap(), "F8 01 74");
        unsafe { buffer.into_sized_vec::<u8>() };
    }

    #[test]
    fn call_result_ok_has_no_error() {
        let result = CallResult::ok(42);
        assert!(!result.is_err());
        assert_eq!(result.value, 42);
    }

    #[test]
    fn call_result_err_carries_the_message() {
        let result = CallResult::err("target went away");
        assert!(result.is_err());
        let message = unsafe { CStr::from_ptr(result.error) };
        assert_eq!(message.to_str().unwrap(), "target went away");
        unsafe { drop(CString::from_raw(result.error)) };
    }

    #[test]
    fn page_record_carries_labels() {
        let page = MemoryPage {
            base: 0x1000,
            size: 0x2000,
            protection: Protection::READ | Protection::WRITE,
            kind: PageKind::Private,
            usage: None,
            allocation_base: 0x1000,
        };

        let mut record = PageRecord::from(&page);
        assert_eq!(record.base, 0x1000);
        assert_eq!(record.size, 0x2000);
        assert_eq!(record.flags, (Protection::READ | Protection::WRITE).bits());
        assert!(record.usage.is_null());
        assert_eq!(
            unsafe { CStr::from_ptr(record.kind) }.to_str().unwrap(),
            "private"
        );
        assert_eq!(
            unsafe { CStr::from_ptr(record.protection) }.to_str().unwrap(),
            "rw-"
        );
        unsafe { record.release_labels() };
    }
}
