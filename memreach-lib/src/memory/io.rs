use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::process::ProcessHandle;

#[derive(Error, Debug)]
pub enum ReadMemoryError {
    #[error("partial read at {address:#x}: {actual} of {expected} bytes")]
    Partial {
        address: usize,
        expected: usize,
        actual: usize,
    },
    #[error("failed to decode memory: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum WriteMemoryError {
    #[error("process handle is detached")]
    Detached,
    #[error("partial write at {address:#x}: {actual} of {expected} bytes")]
    Partial {
        address: usize,
        expected: usize,
        actual: usize,
    },
    #[error("failed to write memory: {0}")]
    Os(String),
}

#[cfg(target_os = "linux")]
mod platform {
    use std::io::{Read, Seek, SeekFrom, Write};

    use libc::{c_void, iovec, pid_t, process_vm_readv, process_vm_writev};

    use crate::process::ProcessHandle;

    pub fn read_os_memory(handle: &ProcessHandle, address: usize, buffer: &mut [u8]) -> usize {
        let local_iov = iovec {
            iov_base: buffer.as_mut_ptr() as *mut c_void,
            iov_len: buffer.len(),
        };
        let remote_iov = iovec {
            iov_base: address as *mut c_void,
            iov_len: buffer.len(),
        };

        let result = unsafe {
            process_vm_readv(handle.pid() as pid_t, &local_iov, 1, &remote_iov, 1, 0)
        };
        if result >= 0 {
            return result as usize;
        }

        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ENOSYS) | Some(libc::EPERM) => {
                read_proc_mem(handle.pid(), address, buffer).unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn read_proc_mem(pid: u32, address: usize, buffer: &mut [u8]) -> std::io::Result<usize> {
        let mut mem = std::fs::File::open(format!("/proc/{pid}/mem"))?;
        mem.seek(SeekFrom::Start(address as u64))?;

        let mut total = 0;
        while total < buffer.len() {
            match mem.read(&mut buffer[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        Ok(total)
    }

    pub fn write_os_memory(
        handle: &ProcessHandle,
        address: usize,
        data: &[u8],
    ) -> Result<usize, String> {
        let local_iov = iovec {
            iov_base: data.as_ptr() as *mut c_void,
            iov_len: data.len(),
        };
        let remote_iov = iovec {
            iov_base: address as *mut c_void,
            iov_len: data.len(),
        };

        let result = unsafe {
            process_vm_writev(handle.pid() as pid_t, &local_iov, 1, &remote_iov, 1, 0)
        };
        if result >= 0 {
            return Ok(result as usize);
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOSYS) | Some(libc::EPERM) => {
                write_proc_mem(handle.pid(), address, data).map_err(|e| e.to_string())
            }
            _ => Err(err.to_string()),
        }
    }

    fn write_proc_mem(pid: u32, address: usize, data: &[u8]) -> std::io::Result<usize> {
        let mut mem = std::fs::OpenOptions::new()
            .write(true)
            .open(format!("/proc/{pid}/mem"))?;
        mem.seek(SeekFrom::Start(address as u64))?;
        mem.write_all(data)?;
        Ok(data.len())
    }
}

#[cfg(windows)]
mod platform {
    use winapi::shared::minwindef::{LPCVOID, LPVOID};
    use winapi::um::memoryapi::{ReadProcessMemory, WriteProcessMemory};

    use crate::process::ProcessHandle;

    pub fn read_os_memory(handle: &ProcessHandle, address: usize, buffer: &mut [u8]) -> usize {
        let mut bytes_read = 0;
        unsafe {
            ReadProcessMemory(
                handle.raw_handle(),
                address as LPCVOID,
                buffer.as_mut_ptr() as LPVOID,
                buffer.len(),
                &mut bytes_read,
            );
        }
        bytes_read
    }

    pub fn write_os_memory(
        handle: &ProcessHandle,
        address: usize,
        data: &[u8],
    ) -> Result<usize, String> {
        let mut bytes_written = 0;
        let result = unsafe {
            WriteProcessMemory(
                handle.raw_handle(),
                address as LPVOID,
                data.as_ptr() as LPCVOID,
                data.len(),
                &mut bytes_written,
            )
        };
        if result == 0 {
            return Err(std::io::Error::last_os_error().to_string());
        }
        Ok(bytes_written)
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use mach::kern_return::{kern_return_t, KERN_SUCCESS};
    use mach::message::mach_msg_type_number_t;
    use mach::port::mach_port_t;
    use mach::vm::mach_vm_write;
    use mach::vm_types::{mach_vm_address_t, mach_vm_size_t};

    use crate::process::ProcessHandle;

    #[allow(non_camel_case_types)]
    type vm_map_t = mach_port_t;
    #[allow(non_camel_case_types)]
    type vm_address_t = mach_vm_address_t;
    #[allow(non_camel_case_types)]
    type vm_size_t = mach_vm_size_t;

    extern "C" {
        fn vm_read_overwrite(
            target_task: vm_map_t,
            address: vm_address_t,
            size: vm_size_t,
            data: vm_address_t,
            out_size: *mut vm_size_t,
        ) -> kern_return_t;
    }

    pub fn read_os_memory(handle: &ProcessHandle, address: usize, buffer: &mut [u8]) -> usize {
        let mut read_len: vm_size_t = 0;
        let result = unsafe {
            vm_read_overwrite(
                handle.task_port(),
                address as vm_address_t,
                buffer.len() as vm_size_t,
                buffer.as_mut_ptr() as vm_address_t,
                &mut read_len,
            )
        };
        if result != KERN_SUCCESS {
            return 0;
        }
        read_len as usize
    }

    pub fn write_os_memory(
        handle: &ProcessHandle,
        address: usize,
        data: &[u8],
    ) -> Result<usize, String> {
        let result = unsafe {
            mach_vm_write(
                handle.task_port(),
                address as mach_vm_address_t,
                data.as_ptr() as usize,
                data.len() as mach_msg_type_number_t,
            )
        };
        if result != KERN_SUCCESS {
            return Err(format!("mach_vm_write failed with {result}"));
        }
        Ok(data.len())
    }
}

/// Copies up to `buffer.len()` bytes from the target into `buffer` and
/// returns the count actually transferred. Anything short of the requested
/// length is a partial read; the caller must discard the output rather than
/// rely on the remaining bytes.
pub fn read_into(handle: &ProcessHandle, address: usize, buffer: &mut [u8]) -> usize {
    if !handle.is_alive() || buffer.is_empty() {
        return 0;
    }
    platform::read_os_memory(handle, address, buffer)
}

/// Allocating variant of [`read_into`]; the returned vector is truncated to
/// the bytes actually read.
pub fn read_bytes(handle: &ProcessHandle, address: usize, size: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; size];
    let len = read_into(handle, address, &mut buffer);
    buffer.truncate(len);
    buffer
}

/// Writes `data` into the target at `address`. All-or-nothing: a short
/// transfer surfaces as [`WriteMemoryError::Partial`] and leaves the target
/// range in an unspecified state.
pub fn write_memory(
    handle: &ProcessHandle,
    address: usize,
    data: &[u8],
) -> Result<usize, WriteMemoryError> {
    if !handle.is_alive() {
        return Err(WriteMemoryError::Detached);
    }
    if data.is_empty() {
        return Ok(0);
    }

    let written =
        platform::write_os_memory(handle, address, data).map_err(WriteMemoryError::Os)?;
    if written != data.len() {
        return Err(WriteMemoryError::Partial {
            address,
            expected: data.len(),
            actual: written,
        });
    }
    Ok(written)
}

macro_rules! impl_read_primitive {
    ($type:ty) => {
        paste::paste! {
            #[doc = concat!("Reads a little-endian `", stringify!($type), "` from the target.")]
            pub fn [<read_ $type>](
                handle: &ProcessHandle,
                address: usize,
            ) -> Result<$type, ReadMemoryError> {
                let expected = std::mem::size_of::<$type>();
                let memory = read_bytes(handle, address, expected);
                if memory.len() != expected {
                    return Err(ReadMemoryError::Partial {
                        address,
                        expected,
                        actual: memory.len(),
                    });
                }

                memory
                    .as_slice()
                    .[<read_ $type>]::<LittleEndian>()
                    .map_err(|_| {
                        ReadMemoryError::Decode(
                            concat!("failed to decode ", stringify!($type)).to_string(),
                        )
                    })
            }
        }
    };
}

impl_read_primitive!(u32);
impl_read_primitive!(i32);
impl_read_primitive!(u64);
impl_read_primitive!(f32);

/// Reads a pointer-wide little-endian value from the target.
pub fn read_ptr(handle: &ProcessHandle, address: usize) -> Result<usize, ReadMemoryError> {
    let expected = std::mem::size_of::<usize>();
    let memory = read_bytes(handle, address, expected);
    if memory.len() != expected {
        return Err(ReadMemoryError::Partial {
            address,
            expected,
            actual: memory.len(),
        });
    }

    let mut raw = [0u8; std::mem::size_of::<usize>()];
    raw.copy_from_slice(&memory);
    Ok(usize::from_le_bytes(raw))
}
