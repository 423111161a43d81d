//! Per-run memory cgroup.
//!
//! The kernel carries the resident set a forked child inherited from the harness across
//! `exec` into `ru_maxrss`, so that figure overstates small programs. A cgroup joined right
//! before `exec` is only charged for what the program itself touches.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;

use cgroups_rs::cgroup_builder::CgroupBuilder;
use cgroups_rs::memory::MemController;
use cgroups_rs::{Cgroup, Controller};
use uuid::Uuid;

use crate::native::procfs;

const MEMORY_CONTROLLER: &str = "memory";
const PROCS_FILE: &str = "cgroup.procs";
const CGROUP_PREFIX: &str = "cpp-harness-";

/// A memory cgroup that lives as long as one run. Removed on drop.
pub struct MemoryCgroup {
    name: String,
    cgroup: Cgroup,
    procs: CString,
}

impl MemoryCgroup {
    /// Creates an empty cgroup below the harness's own memory cgroup, so limits imposed on
    /// the harness still apply to the program.
    ///
    /// Returns `None` when there is no memory controller or it cannot be written to.
    pub fn create() -> Option<Self> {
        let hierarchy = cgroups_rs::hierarchies::auto();
        let has_memory = hierarchy
            .subsystems()
            .iter()
            .any(|subsystem| subsystem.controller_name() == MEMORY_CONTROLLER);
        if !has_memory {
            tracing::debug!("cgroup memory controller is not available");
            return None;
        }

        let leaf = format!("{}{}", CGROUP_PREFIX, Uuid::new_v4());
        let name = match procfs::own_cgroup(MEMORY_CONTROLLER) {
            Ok(Some(parent)) if !parent.trim_matches('/').is_empty() => {
                format!("{}/{}", parent.trim_matches('/'), leaf)
            }
            _ => leaf,
        };

        let cgroup = match CgroupBuilder::new(name.as_str())
            .set_specified_controllers(vec![MEMORY_CONTROLLER.to_string()])
            .build(hierarchy)
        {
            Ok(cgroup) => cgroup,
            Err(e) => {
                tracing::debug!("Failed to create cgroup {}: {}", name, e);
                return None;
            }
        };

        let procs = {
            let memory: Option<&MemController> = cgroup.controller_of();
            memory
                .filter(|memory| memory.exists())
                .and_then(|memory| {
                    CString::new(memory.path().join(PROCS_FILE).as_os_str().as_bytes()).ok()
                })
        };
        let Some(procs) = procs else {
            tracing::debug!("cgroup {} has no usable memory controller", name);
            if let Err(e) = cgroup.delete() {
                tracing::warn!("Failed to delete cgroup {}: {}", name, e);
            }
            return None;
        };

        tracing::debug!("Created cgroup {}", name);
        Some(Self {
            name,
            cgroup,
            procs,
        })
    }

    /// `cgroup.procs` of the memory controller, for [`join`] in a child before `exec`.
    pub fn procs_path(&self) -> &CStr {
        &self.procs
    }

    /// Highest memory charged to the cgroup since it was created. `None` when the kernel
    /// reports nothing, which happens when nothing ever joined.
    pub fn peak_bytes(&self) -> Option<u64> {
        let memory: &MemController = self.cgroup.controller_of()?;
        let peak = memory
            .memory_stat()
            .max_usage_in_bytes
            .max(memory.memswap().max_usage_in_bytes);
        (peak > 0).then_some(peak)
    }
}

impl Drop for MemoryCgroup {
    fn drop(&mut self) {
        match self.cgroup.delete() {
            Ok(()) => tracing::debug!("Deleted cgroup {}", self.name),
            Err(e) => tracing::warn!("Failed to delete cgroup {}: {}", self.name, e),
        }
    }
}

/// Moves the calling process into the cgroup owning `procs`.
///
/// Runs between `fork` and `exec`: it only issues `open`, `write` and `close`.
pub fn join(procs: &CStr) -> io::Result<()> {
    // SAFETY: `procs` is a valid NUL-terminated path; the descriptor is closed below.
    let fd = unsafe { libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // "0" stands for the writing process.
    let written = unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) };
    let result = if written < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    };
    unsafe { libc::close(fd) };
    result
}
