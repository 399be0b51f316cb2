//! C ABI surface over the memreach engine. Every operation that can fail
//! returns a [`CallResult`] instead of unwinding, and every collection
//! crosses the boundary as a [`ByteBuffer`].

use std::ffi::c_char;

use log::{info, LevelFilter};
use once_cell::sync::Lazy;

use memreach_lib::memory::pages;
use memreach_lib::memory::pattern::{Pattern, Radix};
use memreach_lib::memory::scan::{aob_scan, PageFilter};
use memreach_lib::memory::io;
use memreach_lib::process::Engine;

mod protocol;

pub use protocol::{ByteBuffer, CallResult, PageRecord};

static ENGINE: Lazy<Engine> = Lazy::new(Engine::new);

const NOT_ATTACHED: &str = "process is not attached";

/// Opens a handle to the process identified by `pid` and returns its handle
/// token. Attaching to an already-attached pid returns the existing handle.
#[no_mangle]
pub extern "C" fn attach(pid: u32) -> CallResult {
    match ENGINE.attach(pid) {
        Ok(handle) => CallResult::ok(handle.pid() as usize),
        Err(err) => CallResult::err(err),
    }
}

/// Releases the handle for `pid`. Detaching an unknown pid is a no-op.
#[no_mangle]
pub extern "C" fn detach(pid: u32) {
    ENGINE.detach(pid);
}

/// Scans the target for the pattern held in `pattern` (text, radix 16 or
/// 10) across pages admitted by the four protection constraints. On success
/// the value slot holds a `ByteBuffer` of matching `usize` addresses; pass
/// it to [`release_address_buffer`] after copying.
///
/// # Safety
///
/// `pattern` must describe a live text allocation.
#[no_mangle]
pub unsafe extern "C" fn aob_query(
    handle: u32,
    pattern: ByteBuffer,
    radix: u32,
    mapped: bool,
    readable: bool,
    writable: bool,
    executable: bool,
) -> CallResult {
    let target = match ENGINE.resolve(handle) {
        Some(target) => target,
        None => return CallResult::err(NOT_ATTACHED),
    };

    let radix = match radix {
        16 => Radix::Hex,
        10 => Radix::Dec,
        _ => return CallResult::err(format!("unsupported pattern radix {radix}")),
    };
    let text = match pattern.as_str() {
        Ok(text) => text,
        Err(_) => return CallResult::err("pattern text is not valid utf-8"),
    };
    let pattern = match Pattern::parse(text, radix) {
        Ok(pattern) => pattern,
        Err(err) => return CallResult::err(err),
    };

    let filter = PageFilter {
        mapped,
        readable,
        writable,
        executable,
    };
    match aob_scan(&target, &pattern, filter) {
        Ok(addresses) => CallResult::ok(ByteBuffer::from_sized_vec(addresses).into_raw() as usize),
        Err(err) => CallResult::err(err),
    }
}

/// Enumerates the target's pages. On success the value slot holds a
/// `ByteBuffer` of [`PageRecord`]; pass it to [`release_page_buffer`] after
/// copying.
#[no_mangle]
pub extern "C" fn collect_pages(handle: u32) -> CallResult {
    let target = match ENGINE.resolve(handle) {
        Some(target) => target,
        None => return CallResult::err(NOT_ATTACHED),
    };

    match pages::collect_pages(&target) {
        Ok(pages) => {
            let records: Vec<PageRecord> = pages.iter().map(PageRecord::from).collect();
            CallResult::ok(ByteBuffer::from_sized_vec(records).into_raw() as usize)
        }
        Err(err) => CallResult::err(err),
    }
}

/// Writes `buffer` into the target at `address`. Succeeds only if every
/// byte was written; the value slot then holds the byte count.
///
/// # Safety
///
/// `buffer` must describe a live allocation.
#[no_mangle]
pub unsafe extern "C" fn write_memory(handle: u32, address: usize, buffer: ByteBuffer) -> CallResult {
    let target = match ENGINE.resolve(handle) {
        Some(target) => target,
        None => return CallResult::err(NOT_ATTACHED),
    };

    match io::write_memory(&target, address, buffer.as_slice()) {
        Ok(written) => CallResult::ok(written),
        Err(err) => CallResult::err(err),
    }
}

/// Raw-count variant of [`write_memory`]: returns the bytes written, 0 on
/// any failure.
///
/// # Safety
///
/// `buffer` must describe a live allocation.
#[no_mangle]
pub unsafe extern "C" fn write_bytes(handle: u32, address: usize, buffer: ByteBuffer) -> usize {
    match ENGINE.resolve(handle) {
        Some(target) => io::write_memory(&target, address, buffer.as_slice()).unwrap_or(0),
        None => 0,
    }
}

/// Reads up to `size` bytes at `address`. On success the value slot holds a
/// `ByteBuffer` whose count is the bytes actually read (anything short of
/// `size` signals a partial read); pass it to [`release_buffer`] after
/// copying.
#[no_mangle]
pub extern "C" fn read_bytes(handle: u32, address: usize, size: usize) -> CallResult {
    match ENGINE.resolve(handle) {
        Some(target) => {
            let bytes = io::read_bytes(&target, address, size);
            CallResult::ok(ByteBuffer::from_vec(bytes).into_raw() as usize)
        }
        None => CallResult::err(NOT_ATTACHED),
    }
}

/// Copies up to `size` bytes at `address` into `destination` and returns
/// the count actually transferred; the caller must discard the output when
/// the count falls short of `size`.
///
/// # Safety
///
/// `destination` must point to at least `size` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn read_memory(
    handle: u32,
    address: usize,
    destination: *mut u8,
    size: usize,
) -> usize {
    if destination.is_null() {
        return 0;
    }

    match ENGINE.resolve(handle) {
        Some(target) => {
            let buffer = std::slice::from_raw_parts_mut(destination, size);
            io::read_into(&target, address, buffer)
        }
        None => 0,
    }
}

fn level_filter(level: usize) -> LevelFilter {
    match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Sets the process-wide logging level (0 = off … 5 = trace).
#[no_mangle]
pub extern "C" fn set_log_level(level: usize) {
    log::set_max_level(level_filter(level));
}

/// Routes log output to `memreach.log` next to the host process and applies
/// `level`. Debug aid only.
#[no_mangle]
pub extern "C" fn log_to_file(level: usize) {
    let _ = simple_logging::log_to_file("memreach.log", LevelFilter::Trace);
    set_log_level(level);
    info!("log level set to {:?}", level_filter(level));
}

/// Releases a byte buffer returned by [`read_bytes`].
///
/// # Safety
///
/// `buffer` must come from this module and not have been released already.
#[no_mangle]
pub unsafe extern "C" fn release_buffer(buffer: *mut ByteBuffer) {
    if buffer.is_null() {
        return;
    }
    let buffer = *ByteBuffer::from_raw(buffer);
    drop(buffer.into_sized_vec::<u8>());
}

/// Releases an address buffer returned by [`aob_query`].
///
/// # Safety
///
/// `buffer` must come from this module and not have been released already.
#[no_mangle]
pub unsafe extern "C" fn release_address_buffer(buffer: *mut ByteBuffer) {
    if buffer.is_null() {
        return;
    }
    let buffer = *ByteBuffer::from_raw(buffer);
    drop(buffer.into_sized_vec::<usize>());
}

/// Releases a page buffer returned by [`collect_pages`], including the
/// label strings inside each record.
///
/// # Safety
///
/// `buffer` must come from this module and not have been released already.
#[no_mangle]
pub unsafe extern "C" fn release_page_buffer(buffer: *mut ByteBuffer) {
    if buffer.is_null() {
        return;
    }
    let buffer = *ByteBuffer::from_raw(buffer);
    let mut records = buffer.into_sized_vec::<PageRecord>();
    for record in &mut records {
        record.release_labels();
    }
}

/// Releases an error message taken from a [`CallResult`].
///
/// # Safety
///
/// `error` must come from a `CallResult` produced by this module and not
/// have been released already.
#[no_mangle]
pub unsafe extern "C" fn release_error(error: *mut c_char) {
    if !error.is_null() {
        drop(std::ffi::CString::from_raw(error));
    }
}
