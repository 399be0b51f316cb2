use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{info, warn};
use parking_lot::Mutex;
use sysinfo::{Pid, PidExt, System, SystemExt};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("process {0} not found")]
    ProcessNotFound(u32),
    #[error("access to process {0} denied: {1}")]
    AccessDenied(u32, String),
    #[error("failed to open process {0}: {1}")]
    OpenFailed(u32, String),
}

#[cfg(windows)]
mod platform {
    use winapi::um::{
        handleapi::CloseHandle,
        processthreadsapi::OpenProcess,
        winnt::{
            HANDLE, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ,
            PROCESS_VM_WRITE,
        },
    };

    use super::AttachError;

    pub struct OsHandle(pub(crate) HANDLE);

    unsafe impl Send for OsHandle {}
    unsafe impl Sync for OsHandle {}

    impl Drop for OsHandle {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    pub fn open(pid: u32) -> Result<OsHandle, AttachError> {
        let handle = unsafe {
            OpenProcess(
                PROCESS_QUERY_INFORMATION
                    | PROCESS_VM_READ
                    | PROCESS_VM_WRITE
                    | PROCESS_VM_OPERATION,
                0,
                pid,
            )
        };
        if handle.is_null() {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(code) if code == winapi::shared::winerror::ERROR_ACCESS_DENIED as i32 => {
                    AttachError::AccessDenied(pid, err.to_string())
                }
                _ => AttachError::OpenFailed(pid, err.to_string()),
            });
        }

        Ok(OsHandle(handle))
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::AttachError;

    // Reads and writes go through per-call syscalls on Linux, so there is
    // no kernel object to hold open between operations.
    pub struct OsHandle;

    pub fn open(pid: u32) -> Result<OsHandle, AttachError> {
        match std::fs::metadata(format!("/proc/{pid}/maps")) {
            Ok(_) => Ok(OsHandle),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(AttachError::AccessDenied(pid, e.to_string()))
            }
            Err(e) => Err(AttachError::OpenFailed(pid, e.to_string())),
        }
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use libc::{c_int, pid_t};
    use mach::kern_return::KERN_SUCCESS;
    use mach::port::{mach_port_name_t, MACH_PORT_NULL};

    use super::AttachError;

    pub struct OsHandle {
        pub(crate) task: mach_port_name_t,
    }

    pub fn open(pid: u32) -> Result<OsHandle, AttachError> {
        if pid as pid_t == unsafe { libc::getpid() } {
            return Ok(OsHandle {
                task: unsafe { mach::traps::mach_task_self() },
            });
        }

        let mut task: mach_port_name_t = MACH_PORT_NULL;
        let result = unsafe {
            mach::traps::task_for_pid(mach::traps::mach_task_self(), pid as c_int, &mut task)
        };
        if result != KERN_SUCCESS {
            return Err(AttachError::AccessDenied(
                pid,
                std::io::Error::last_os_error().to_string(),
            ));
        }

        Ok(OsHandle { task })
    }
}

/// An open connection to a target process's memory.
///
/// Handles are issued by [`Engine::attach`] and stay immutable until
/// [`Engine::detach`] clears the alive flag; every memory operation checks
/// the flag and fails cleanly against a detached handle.
pub struct ProcessHandle {
    pid: u32,
    alive: AtomicBool,
    #[allow(dead_code)]
    os: platform::OsHandle,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.alive.store(false, Ordering::Release);
    }

    #[cfg(windows)]
    pub(crate) fn raw_handle(&self) -> winapi::um::winnt::HANDLE {
        self.os.0
    }

    #[cfg(target_os = "macos")]
    pub(crate) fn task_port(&self) -> mach::port::mach_port_name_t {
        self.os.task
    }
}

/// Registry of attached targets, keyed by process id.
///
/// At most one live handle exists per pid inside one engine instance;
/// attach is idempotent and detach of an unknown pid is a no-op.
#[derive(Default)]
pub struct Engine {
    targets: Mutex<HashMap<u32, Arc<ProcessHandle>>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, pid: u32) -> Result<Arc<ProcessHandle>, AttachError> {
        let mut targets = self.targets.lock();

        if let Some(existing) = targets.get(&pid) {
            return Ok(Arc::clone(existing));
        }

        let mut sys = System::new();
        if !sys.refresh_process(Pid::from_u32(pid)) {
            warn!("failed to attach process {pid}: not running");
            return Err(AttachError::ProcessNotFound(pid));
        }

        let os = platform::open(pid)?;
        let handle = Arc::new(ProcessHandle {
            pid,
            alive: AtomicBool::new(true),
            os,
        });
        targets.insert(pid, Arc::clone(&handle));

        info!("attached process {pid}");
        Ok(handle)
    }

    pub fn detach(&self, pid: u32) {
        let mut targets = self.targets.lock();

        match targets.remove(&pid) {
            Some(handle) => {
                handle.invalidate();
                info!("detached process {pid}");
            }
            None => warn!("detach of process {pid} ignored: not attached"),
        }
    }

    pub fn resolve(&self, pid: u32) -> Option<Arc<ProcessHandle>> {
        self.targets.lock().get(&pid).cloned()
    }
}
