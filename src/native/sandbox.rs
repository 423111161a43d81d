//! Runs one program in its own process group under resource limits.
//!
//! The group leader is observed with `waitid(WNOWAIT)` and reaped with `wait4` only after the
//! whole group has been killed, so the group id cannot be recycled while it is still a kill
//! target. CPU time comes from the `wait4` rusage of that one child. Peak memory comes from a
//! per-run memory cgroup when one can be created, and from `/proc` samples and `ru_maxrss`
//! otherwise.

use std::ffi::{CString, OsString};
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use nix::sched::{CloneFlags, unshare};
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::{oneshot, watch};

use crate::config::NetworkPolicy;
use crate::constants::SANDBOX_PATH;
use crate::core::cancel::CancelToken;
use crate::core::clock::Clock;
use crate::core::domain::ExitStatus;
use crate::core::errors::{HarnessError, Phase};
use crate::core::verdict::KillReason;
use crate::native::cgroup::{self, MemoryCgroup};
use crate::native::procfs;

const READ_CHUNK: usize = 8 * 1024;

/// `setrlimit` values applied in the child before `exec`. `None` leaves the inherited limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_seconds: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub stack_bytes: Option<u64>,
    pub open_files: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    pub stdin: Vec<u8>,
    pub wall_limit: Duration,
    /// Group memory above which the group is killed. `None` only records the peak.
    pub memory_limit: Option<u64>,
    /// Per-stream capture cap.
    pub output_limit: u64,
    pub rlimits: ResourceLimits,
    pub network: NetworkPolicy,
}

/// Bytes captured from one output stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    /// Appends as much of `chunk` as fits under `limit`; the rest is dropped.
    pub fn push(&mut self, chunk: &[u8], limit: u64) {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Decodes the capture as UTF-8, never returning more bytes than were captured.
    ///
    /// A character split by the cap is dropped. Invalid sequences become U+FFFD, and the
    /// result is cut back at a character boundary if the replacements made it longer.
    pub fn into_string(mut self) -> String {
        let cap = self.bytes.len();
        if self.truncated {
            let partial = partial_char_len(&self.bytes);
            self.bytes.truncate(cap - partial);
        }
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if text.len() > cap {
            let mut end = cap;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        text
    }
}

/// Length of an incomplete UTF-8 sequence at the end of `bytes`, or 0.
fn partial_char_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

#[derive(Debug)]
pub struct ProcessReport {
    pub pgid: i32,
    pub exit_status: ExitStatus,
    pub started_at: Instant,
    pub exited_at: Instant,
    pub deadline: Instant,
    pub kill: Option<KillReason>,
    pub peak_memory_bytes: u64,
    pub cpu_time: Duration,
    pub stdout: Captured,
    pub stderr: Captured,
}

impl ProcessReport {
    pub fn elapsed(&self) -> Duration {
        self.exited_at.saturating_duration_since(self.started_at)
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start process: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),
    #[error("cancelled")]
    Cancelled,
}

impl SandboxError {
    pub fn into_harness_error(self, phase: Phase) -> HarnessError {
        match self {
            SandboxError::Spawn(source) => HarnessError::Spawn { phase, source },
            SandboxError::Wait(source) => HarnessError::Wait { phase, source },
            SandboxError::Cancelled => HarnessError::Cancelled { phase },
        }
    }
}

#[derive(Clone, Debug)]
pub struct Sandbox {
    clock: Arc<dyn Clock>,
    sample_interval: Duration,
    drain_grace: Duration,
}

impl Sandbox {
    pub fn new(clock: Arc<dyn Clock>, sample_interval: Duration, drain_grace: Duration) -> Self {
        Self {
            clock,
            sample_interval,
            drain_grace,
        }
    }

    /// Starts `spec.program` and waits until it exits, breaks a limit or `cancel` fires.
    ///
    /// Whatever happens, every process left in the group is sent `SIGKILL` before this
    /// returns, including when the returned future is dropped early.
    #[tracing::instrument(skip(self, spec, cancel), fields(program = %spec.program.display()))]
    pub async fn execute(
        &self,
        spec: &ProcessSpec,
        cancel: &CancelToken,
    ) -> Result<ProcessReport, SandboxError> {
        let cgroup = tokio::task::spawn_blocking(MemoryCgroup::create)
            .await
            .ok()
            .flatten();
        let mut child = spawn_group(spec, cgroup.as_ref().map(|cg| cg.procs_path().to_owned()))
            .map_err(SandboxError::Spawn)?;
        let pid = child.id() as i32;
        let mut guard = GroupGuard::new(pid);
        let started_at = self.clock.now();
        let deadline = started_at + spec.wall_limit;
        tracing::debug!("Spawned process group {}", pid);

        // The harness itself is the upper bound on what the child held before exec.
        let inherited_rss = procfs::self_peak_bytes().unwrap_or(u64::MAX);

        let (exit_rx, release_tx, reaper) = spawn_reaper(pid, self.clock.clone());

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        drop(child);

        let feeder = match stdin {
            Some(stdin) if !spec.stdin.is_empty() => Some(tokio::spawn(feed_stdin(
                pipe_sender(stdin).map_err(SandboxError::Spawn)?,
                spec.stdin.clone(),
            ))),
            _ => None,
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let stdout_task = match stdout {
            Some(stdout) => Some(tokio::spawn(capture(
                pipe_receiver(stdout).map_err(SandboxError::Spawn)?,
                spec.output_limit,
                stop_rx.clone(),
            ))),
            None => None,
        };
        let stderr_task = match stderr {
            Some(stderr) => Some(tokio::spawn(capture(
                pipe_receiver(stderr).map_err(SandboxError::Spawn)?,
                spec.output_limit,
                stop_rx,
            ))),
            None => None,
        };

        let mut memory = MemoryWatch::new(pid, self.sample_interval);
        let mut exit_rx = exit_rx;
        let mut exited_at = None;

        let kill = tokio::select! {
            biased;
            exited = &mut exit_rx => {
                exited_at = Some(exited.ok());
                None
            }
            _ = cancel.cancelled() => Some(KillReason::Cancelled),
            _ = memory.breach(spec.memory_limit) => Some(KillReason::Memory),
            _ = self.clock.sleep_until(deadline) => Some(KillReason::WallClock),
        };

        // Descendants die with the leader even when it exited on its own.
        guard.kill();
        if let Some(reason) = kill {
            tracing::debug!("Killed process group {}: {:?}", pid, reason);
        }

        let exited_at = match exited_at {
            Some(observed) => observed,
            None => exit_rx.await.ok(),
        }
        .unwrap_or_else(|| self.clock.now());

        let _ = release_tx.send(());
        let reaped = reaper
            .await
            .map_err(|e| SandboxError::Wait(io::Error::other(e)))?
            .map_err(SandboxError::Wait)?;
        guard.disarm();

        let cgroup_peak = cgroup.as_ref().and_then(MemoryCgroup::peak_bytes);
        if let Some(cgroup) = cgroup {
            let _ = tokio::task::spawn_blocking(move || drop(cgroup));
        }

        if let Some(feeder) = feeder {
            feeder.abort();
        }

        if kill == Some(KillReason::Cancelled) {
            return Err(SandboxError::Cancelled);
        }

        let (stdout, stderr) = self
            .drain(stdout_task, stderr_task, stop_tx)
            .await
            .map_err(SandboxError::Wait)?;

        let retroactive_peak = match cgroup_peak {
            Some(peak) => peak,
            // Below the inherited figure, ru_maxrss cannot be attributed to the program.
            None if reaped.max_rss_bytes > inherited_rss => reaped.max_rss_bytes,
            None => 0,
        };

        Ok(ProcessReport {
            pgid: pid,
            exit_status: reaped.status,
            started_at,
            exited_at,
            deadline,
            kill,
            peak_memory_bytes: memory.peak().max(retroactive_peak),
            cpu_time: reaped.cpu_time,
            stdout,
            stderr,
        })
    }

    /// Collects both streams. A pipe still held open by an escaped descendant is abandoned
    /// after the drain grace period.
    async fn drain(
        &self,
        stdout: Option<tokio::task::JoinHandle<Captured>>,
        stderr: Option<tokio::task::JoinHandle<Captured>>,
        stop: watch::Sender<bool>,
    ) -> io::Result<(Captured, Captured)> {
        let collect = async move {
            let stdout = match stdout {
                Some(task) => task.await.map_err(io::Error::other)?,
                None => Captured::default(),
            };
            let stderr = match stderr {
                Some(task) => task.await.map_err(io::Error::other)?,
                None => Captured::default(),
            };
            Ok::<_, io::Error>((stdout, stderr))
        };
        tokio::pin!(collect);

        match tokio::time::timeout(self.drain_grace, &mut collect).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Output pipes still open after the process group was killed");
                stop.send_replace(true);
                collect.await
            }
        }
    }
}

fn spawn_group(spec: &ProcessSpec, cgroup: Option<CString>) -> io::Result<std::process::Child> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let rlimits = spec.rlimits;
    let network = spec.network;
    // SAFETY: the hook only issues open/write/getrlimit/setrlimit/unshare syscalls and
    // allocates nothing.
    unsafe {
        command.pre_exec(move || prepare_child(cgroup.as_deref(), rlimits, network));
    }

    command.spawn()
}

/// Sends `SIGKILL` to the group on [`GroupGuard::kill`] and on drop, until disarmed.
#[derive(Debug)]
struct GroupGuard {
    pgid: i32,
    armed: bool,
}

impl GroupGuard {
    fn new(pgid: i32) -> Self {
        Self { pgid, armed: true }
    }

    fn kill(&self) {
        if !self.armed {
            return;
        }
        match killpg(Pid::from_raw(self.pgid), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => tracing::error!("Failed to kill process group {}: {}", self.pgid, e),
        }
    }

    /// Called once the leader is reaped: from then on the id may belong to someone else.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug)]
struct Reaped {
    status: ExitStatus,
    cpu_time: Duration,
    max_rss_bytes: u64,
}

type ReaperHandle = tokio::task::JoinHandle<io::Result<Reaped>>;

/// Waits for the leader on a blocking thread. The exit instant is reported as soon as the
/// leader dies; reaping waits for the release signal (or for the sender to be dropped).
fn spawn_reaper(
    pid: i32,
    clock: Arc<dyn Clock>,
) -> (oneshot::Receiver<Instant>, mpsc::Sender<()>, ReaperHandle) {
    let (exit_tx, exit_rx) = oneshot::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let handle = tokio::task::spawn_blocking(move || {
        let observed = wait_exit_nowait(pid);
        if observed.is_ok() {
            let _ = exit_tx.send(clock.now());
        }
        let _ = release_rx.recv();
        observed.and_then(|()| reap(pid))
    });

    (exit_rx, release_tx, handle)
}

fn wait_exit_nowait(pid: i32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data and is only written by the kernel.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn reap(pid: i32) -> io::Result<Reaped> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data and is only written by the kernel.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let status = if libc::WIFSIGNALED(status) {
        ExitStatus::Signal(libc::WTERMSIG(status))
    } else {
        ExitStatus::Code(libc::WEXITSTATUS(status))
    };

    Ok(Reaped {
        status,
        cpu_time: timeval_duration(usage.ru_utime) + timeval_duration(usage.ru_stime),
        max_rss_bytes: (usage.ru_maxrss.max(0) as u64) * 1024,
    })
}

fn timeval_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Polls group memory through `/proc` and keeps the highest reading.
#[derive(Debug)]
struct MemoryWatch {
    pgid: i32,
    interval: Duration,
    peak: u64,
}

impl MemoryWatch {
    fn new(pgid: i32, interval: Duration) -> Self {
        Self {
            pgid,
            interval,
            peak: 0,
        }
    }

    fn peak(&self) -> u64 {
        self.peak
    }

    /// Completes once the group's peak exceeds `limit`. Never completes without a limit.
    async fn breach(&mut self, limit: Option<u64>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pgid = self.pgid;
            match tokio::task::spawn_blocking(move || procfs::group_memory(pgid)).await {
                Ok(Ok(sample)) => self.peak = self.peak.max(sample.peak_bytes()),
                Ok(Err(e)) => tracing::debug!("Memory sample for group {} failed: {}", pgid, e),
                Err(e) => tracing::debug!("Memory sampler task failed: {}", e),
            }
            if limit.is_some_and(|limit| self.peak > limit) {
                return;
            }
        }
    }
}

fn prepare_child(
    cgroup: Option<&std::ffi::CStr>,
    limits: ResourceLimits,
    network: NetworkPolicy,
) -> io::Result<()> {
    if let Some(procs) = cgroup {
        cgroup::join(procs)?;
    }
    if let Some(seconds) = limits.cpu_seconds {
        // SIGXCPU at the soft limit, SIGKILL one second later.
        set_limit(Resource::RLIMIT_CPU, seconds, seconds.saturating_add(1))?;
    }
    if let Some(bytes) = limits.file_size_bytes {
        set_limit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
    }
    if let Some(bytes) = limits.stack_bytes {
        set_limit(Resource::RLIMIT_STACK, bytes, bytes)?;
    }
    if let Some(files) = limits.open_files {
        set_limit(Resource::RLIMIT_NOFILE, files, files)?;
    }
    set_limit(Resource::RLIMIT_CORE, 0, 0)?;
    isolate_network(network)
}

/// Lowers a limit, never raising it above the inherited hard limit.
fn set_limit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;
    let hard = (hard as libc::rlim_t).min(current_hard);
    let soft = (soft as libc::rlim_t).min(hard);
    setrlimit(resource, soft, hard)?;
    Ok(())
}

fn isolate_network(policy: NetworkPolicy) -> io::Result<()> {
    if policy == NetworkPolicy::Shared {
        return Ok(());
    }
    // Unprivileged callers need a user namespace to own the new network namespace.
    let result = unshare(CloneFlags::CLONE_NEWNET)
        .or_else(|_| unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET));
    match (result, policy) {
        (Ok(()), _) | (Err(_), NetworkPolicy::BestEffort) => Ok(()),
        (Err(e), _) => Err(e.into()),
    }
}

fn pipe_receiver(fd: impl Into<OwnedFd>) -> io::Result<pipe::Receiver> {
    pipe::Receiver::from_file(File::from(fd.into()))
}

fn pipe_sender(fd: impl Into<OwnedFd>) -> io::Result<pipe::Sender> {
    pipe::Sender::from_file(File::from(fd.into()))
}

async fn feed_stdin(mut stdin: pipe::Sender, input: Vec<u8>) {
    match stdin.write_all(&input).await {
        Ok(()) => {}
        // The program is free to stop reading early.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
        Err(e) => tracing::debug!("Failed to write stdin: {}", e),
    }
}

/// Reads until EOF or until `stop` is raised. Bytes past `limit` are read and discarded so
/// the writer never blocks on a full pipe.
async fn capture<R>(mut reader: R, limit: u64, mut stop: watch::Receiver<bool>) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => captured.push(&buf[..n], limit),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("Output pipe read failed: {}", e);
                    break;
                }
            },
            _ = stop.wait_for(|stop| *stop) => break,
        }
    }
    captured
}
