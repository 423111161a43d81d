//! Process-group memory accounting through `/proc`.

use std::fs;
use std::io;
use std::path::Path;

const PROC_ROOT: &str = "/proc";

/// Memory held by the live members of one process group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupMemory {
    /// Sum of `VmRSS` over all members.
    pub rss_bytes: u64,
    /// Largest `VmHWM` among the members.
    pub hwm_bytes: u64,
    pub processes: usize,
}

impl GroupMemory {
    pub fn peak_bytes(&self) -> u64 {
        self.rss_bytes.max(self.hwm_bytes)
    }
}

/// Lists the live pids whose process group is `pgid`. Zombies are skipped.
pub fn group_members(pgid: i32) -> io::Result<Vec<i32>> {
    let mut members = Vec::new();
    for entry in fs::read_dir(PROC_ROOT)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        // Processes vanish between listing and reading; skip them.
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        match parse_stat(&stat) {
            Some((state, pgrp)) if pgrp == pgid && !matches!(state, 'Z' | 'X') => {
                members.push(pid)
            }
            _ => {}
        }
    }
    Ok(members)
}

pub fn group_memory(pgid: i32) -> io::Result<GroupMemory> {
    let mut memory = GroupMemory::default();
    for pid in group_members(pgid)? {
        let path = Path::new(PROC_ROOT).join(pid.to_string()).join("status");
        let Ok(status) = fs::read_to_string(path) else {
            continue;
        };
        memory.processes += 1;
        memory.rss_bytes += parse_status_kib(&status, "VmRSS:").unwrap_or(0) * 1024;
        memory.hwm_bytes = memory
            .hwm_bytes
            .max(parse_status_kib(&status, "VmHWM:").unwrap_or(0) * 1024);
    }
    Ok(memory)
}

/// `VmHWM` of the calling process.
///
/// A forked child starts with at most this much resident memory, and the kernel carries that
/// figure across `exec` into the child's `ru_maxrss`.
pub fn self_peak_bytes() -> io::Result<u64> {
    let status = fs::read_to_string(Path::new(PROC_ROOT).join("self").join("status"))?;
    Ok(parse_status_kib(&status, "VmHWM:").unwrap_or(0) * 1024)
}

/// Path of the calling process inside the cgroup hierarchy that carries `controller`.
///
/// A cgroup v1 line names its controllers; the unified v2 line (`0::`) is used when no v1
/// hierarchy has the controller.
pub fn own_cgroup(controller: &str) -> io::Result<Option<String>> {
    let contents = fs::read_to_string(Path::new(PROC_ROOT).join("self").join("cgroup"))?;
    Ok(parse_cgroup(&contents, controller))
}

fn parse_cgroup(contents: &str, controller: &str) -> Option<String> {
    let mut unified = None;
    for line in contents.lines() {
        let mut fields = line.splitn(3, ':');
        let (Some(_), Some(controllers), Some(path)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if controllers.split(',').any(|name| name == controller) {
            return Some(path.to_string());
        }
        if controllers.is_empty() {
            unified = Some(path.to_string());
        }
    }
    unified
}

/// Extracts the `state` and `pgrp` fields from the contents of `/proc/<pid>/stat`.
///
/// The command name sits in parentheses and may itself contain spaces or parentheses, so
/// fields are counted from the last `)`.
fn parse_stat(stat: &str) -> Option<(char, i32)> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    // ppid, pgrp
    let pgrp = fields.nth(1)?.parse().ok()?;
    Some((state, pgrp))
}

fn parse_status_kib(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat() {
        let stat = "4242 (a.out) R 4200 4242 4200 0 -1 4194560 100 0 0 0";
        assert_eq!(parse_stat(stat), Some(('R', 4242)));
    }

    #[test]
    fn test_parse_stat_with_tricky_name() {
        let stat = "77 (ev) il) Z 1 77 1 0 -1";
        assert_eq!(parse_stat(stat), Some(('Z', 77)));
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert_eq!(parse_stat("no parentheses here"), None);
        assert_eq!(parse_stat("1 (x) S"), None);
    }

    #[test]
    fn test_parse_status_kib() {
        let status = "Name:\tsolution.out\nVmHWM:\t   10240 kB\nVmRSS:\t    8192 kB\n";
        assert_eq!(parse_status_kib(status, "VmRSS:"), Some(8192));
        assert_eq!(parse_status_kib(status, "VmHWM:"), Some(10240));
        assert_eq!(parse_status_kib(status, "VmSwap:"), None);
    }

    #[test]
    fn test_parse_cgroup() {
        let v1 = "9:name=systemd:/\n4:memory:/jobs/a1\n1:cpu,cpuacct:/\n0::/\n";
        assert_eq!(parse_cgroup(v1, "memory"), Some("/jobs/a1".to_string()));
        assert_eq!(parse_cgroup(v1, "cpuacct"), Some("/".to_string()));

        let v2 = "0::/user.slice/session-1.scope\n";
        assert_eq!(
            parse_cgroup(v2, "memory"),
            Some("/user.slice/session-1.scope".to_string())
        );
        assert_eq!(parse_cgroup("garbage", "memory"), None);
    }

    #[test]
    fn test_own_group_is_visible() {
        let pgid = nix::unistd::getpgrp().as_raw();
        let pid = std::process::id() as i32;

        let members = group_members(pgid).unwrap();
        assert!(members.contains(&pid));

        let memory = group_memory(pgid).unwrap();
        assert!(memory.processes >= 1);
        assert!(memory.rss_bytes > 0);
        assert!(memory.peak_bytes() >= memory.rss_bytes);
    }

    #[test]
    fn test_self_peak_is_nonzero() {
        assert!(self_peak_bytes().unwrap() > 0);
    }
}
