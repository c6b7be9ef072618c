//! Spawning a child: building its environment, handing it exactly the
//! FDs it should have at exactly the slots it expects them, and
//! tracking it afterwards.

use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Instant;

use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::{close, dup2, Pid};
use relaunch_protocol::{
    CHANNEL_FD_VAR, GENERATION_VAR, LISTENER_COUNT_VAR, LISTENER_FD_START, ROLE_SLAVE, ROLE_VAR,
};

use crate::channel::{self, MasterChannel};
use crate::error::{Error, Result};

/// Where a child is in its lifecycle, as observed by the master. Does
/// not track listener/channel ownership -- that's implicit in the
/// `ChildRecord` that wraps this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Spawned,
    Ready,
    Terminating,
}

/// Everything the master keeps about one live (or recently-live) child.
pub struct ChildRecord {
    pub generation: u64,
    pub pid: Pid,
    pub channel: MasterChannel,
    pub state: ChildState,
    pub started_at: Instant,
}

/// Spawns generation `generation` of `binary_path`, wiring up its
/// control channel and listener FDs, and starts a background thread
/// that invokes `on_exit` once the child has been reaped.
///
/// `on_message`/`on_close` are the master's handlers for frames arriving
/// on this child's control channel (see `channel::MasterChannel::spawn`).
pub fn spawn(
    binary_path: &Path,
    generation: u64,
    listener_fds: &[RawFd],
    mut on_exit: impl FnMut(u64, io::Result<ExitStatus>) + Send + 'static,
    on_message: impl FnMut(relaunch_protocol::Message) + Send + 'static,
    on_close: impl FnMut() + Send + 'static,
) -> Result<ChildRecord> {
    let (master_end, child_fd) = channel::new_pair()?;

    let channel_slot = LISTENER_FD_START + listener_fds.len() as i32;

    let mut relocations: Vec<(RawFd, i32)> = listener_fds
        .iter()
        .enumerate()
        .map(|(i, fd)| (*fd, LISTENER_FD_START + i as i32))
        .collect();
    relocations.push((child_fd, channel_slot));

    let mut command = Command::new(binary_path);
    command
        .env(ROLE_VAR, ROLE_SLAVE)
        .env(GENERATION_VAR, generation.to_string())
        .env(LISTENER_COUNT_VAR, listener_fds.len().to_string())
        .env(CHANNEL_FD_VAR, channel_slot.to_string())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // SAFETY: `relocate_fds` only calls signal-safe, allocation-free
    // syscalls (fcntl/dup2), as required between fork and exec.
    unsafe {
        command.pre_exec(move || relocate_fds(&relocations));
    }

    let mut child = command.spawn().map_err(Error::SpawnChild)?;
    let pid = Pid::from_raw(child.id() as i32);

    // The child now holds its own copy of this endpoint at `channel_slot`
    // (placed there by `relocate_fds` pre-exec); this parent-side copy of
    // the raw fd must be closed or the master never observes EOF on the
    // channel after the child exits, leaking one fd and one reader thread
    // per generation.
    let _ = close(child_fd);

    let reader_channel = MasterChannel::spawn(master_end, on_message, on_close)?;

    thread::Builder::new()
        .name(format!("relaunch-child-wait-{}", generation))
        .spawn(move || {
            let status = child.wait();
            on_exit(generation, status);
        })
        .map_err(Error::Io)?;

    Ok(ChildRecord {
        generation,
        pid,
        channel: reader_channel,
        state: ChildState::Spawned,
        started_at: Instant::now(),
    })
}

/// Moves each `(source_fd, target_slot)` pair into place in the child's
/// FD table, post-fork/pre-exec. Safe against source/target slot
/// collisions: every source is first duplicated to a scratch FD number
/// above the whole target range, then `dup2`'d into its final slot, and
/// only then are the scratch FDs closed.
fn relocate_fds(relocations: &[(RawFd, i32)]) -> io::Result<()> {
    if relocations.is_empty() {
        return Ok(());
    }

    let above_targets = relocations.iter().map(|(_, target)| *target).max().unwrap() + 1;

    let mut scratch = Vec::with_capacity(relocations.len());
    for (source, _) in relocations {
        let temp = fcntl(*source, FcntlArg::F_DUPFD(above_targets))
            .map_err(nix_to_io)?;
        scratch.push(temp);
    }

    for ((_, target), temp) in relocations.iter().zip(scratch.iter()) {
        dup2(*temp, *target).map_err(nix_to_io)?;
    }

    for temp in scratch {
        let _ = nix::unistd::close(temp);
    }

    Ok(())
}

fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Sends `sig` to `pid`. Used both for forwarding externally-received
/// signals to the active child and for the terminate-timeout escalation
/// to `SIGKILL`.
pub fn send_signal(pid: Pid, sig: nix::sys::signal::Signal) -> Result<()> {
    nix::sys::signal::kill(pid, sig).map_err(Error::Signal)
}
