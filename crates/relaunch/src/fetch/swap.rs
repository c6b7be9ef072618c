use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use relaunch_protocol::{PROBE_TOKEN, ROLE_PROBE, ROLE_VAR};

use super::{FetchOutcome, Fetcher};
use crate::binary_id::hash_file;
use crate::config::PreUpgradeCheck;
use crate::error::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What a fetch-and-swap attempt produced.
pub enum SwapOutcome {
    /// Nothing to do this poll.
    NoChange,
    /// The candidate failed validation and was discarded; the on-disk
    /// binary is untouched.
    Rejected,
    /// The on-disk binary was replaced. `hash` is the SHA-256 of the new
    /// contents.
    Swapped { hash: String },
}

/// Runs one fetch-and-swap cycle: poll, validate, maybe replace
/// `binary_path` on disk. Never panics and never leaves a temporary file
/// behind; I/O errors are reported, not propagated as fatal, per §7
/// ("Swap I/O errors: non-fatal; logged; next poll may retry").
pub fn fetch_and_swap(
    binary_path: &Path,
    fetcher: &mut dyn Fetcher,
    pre_upgrade_check: Option<&PreUpgradeCheck>,
) -> Result<SwapOutcome> {
    let mut stream = match fetcher.poll()? {
        FetchOutcome::NoChange => return Ok(SwapOutcome::NoChange),
        FetchOutcome::Candidate(stream) => stream,
    };

    let dir = binary_path
        .parent()
        .ok_or_else(|| Error::Fetch("binary path has no parent directory".into()))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".relaunch-candidate-")
        .tempfile_in(dir)?;

    io_copy(&mut stream, temp.as_file_mut())?;
    temp.as_file().sync_all()?;

    let current_mode = std::fs::metadata(binary_path)?.permissions();
    temp.as_file().set_permissions(current_mode)?;

    let temp_path = temp.path().to_path_buf();

    if let Err(err) = probe_candidate(&temp_path) {
        log::warn!("candidate {} rejected: {}", temp_path.display(), err);
        return Ok(SwapOutcome::Rejected);
    }

    if let Some(check) = pre_upgrade_check {
        if !check(&temp_path) {
            log::warn!(
                "candidate {} rejected: pre_upgrade_check returned false",
                temp_path.display()
            );
            return Ok(SwapOutcome::Rejected);
        }
    }

    let hash = hash_file(&temp_path)?;

    atomic_replace(&temp_path, binary_path)?;
    // `temp` has already been consumed by the rename/copy above; drop it
    // without letting its destructor try to unlink a path that may no
    // longer be a temp file.
    temp.keep().ok();

    Ok(SwapOutcome::Swapped { hash })
}

fn io_copy(src: &mut dyn Read, dst: &mut std::fs::File) -> Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
    }
    Ok(())
}

/// Invokes `path` in probe mode and requires it to print `PROBE_TOKEN`
/// and exit 0 within `PROBE_TIMEOUT`.
fn probe_candidate(path: &Path) -> Result<()> {
    let mut child = Command::new(path)
        .env(ROLE_VAR, ROLE_PROBE)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(Error::ExecProbe)?;

    let deadline = Instant::now() + PROBE_TIMEOUT;
    let status = loop {
        if let Some(status) = child.try_wait().map_err(Error::ExecProbe)? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::ProbeTimedOut);
        }
        std::thread::sleep(PROBE_POLL_INTERVAL);
    };

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_string(&mut stdout).ok();
    }

    if !status.success() {
        return Err(Error::ProbeFailed(format!(
            "exited with status {:?}",
            status.code()
        )));
    }
    if stdout.trim() != PROBE_TOKEN {
        return Err(Error::ProbeFailed(format!(
            "unexpected probe output: {:?}",
            stdout
        )));
    }
    Ok(())
}

/// Replaces `dest` with the contents of `src`. `rename` is atomic and is
/// always attempted first; it only fails across filesystem boundaries,
/// in which case we fall back to copy-to-target-fs, then rename, then
/// unlink the original temp file -- all in-process, rather than
/// shelling out to `mv`.
fn atomic_replace(src: &Path, dest: &Path) -> Result<()> {
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => {
            let fallback_temp = dest.with_extension("relaunch-swap-tmp");
            std::fs::copy(src, &fallback_temp).map_err(Error::Swap)?;
            std::fs::rename(&fallback_temp, dest).map_err(Error::Swap)?;
            std::fs::remove_file(src).ok();
            Ok(())
        }
        Err(err) => Err(Error::Swap(err)),
    }
}

fn is_cross_device(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}
