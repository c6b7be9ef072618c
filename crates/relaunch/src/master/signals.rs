//! Self-pipe signal handling: the actual signal handler only writes one
//! byte to a pipe (the only thing guaranteed async-signal-safe); a
//! dedicated thread blocks reading that pipe and turns bytes back into
//! `Signal` values for the tick loop.

use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::Sender;
use std::thread;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe, read};

use crate::error::{Error, Result};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(sig: c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let byte = [sig as u8];
    // SAFETY: `write` on a pipe is async-signal-safe; we ignore the
    // result because there is nothing useful to do with it from a
    // signal handler.
    unsafe {
        libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
    }
}

/// Installs handlers for every catchable signal and spawns the reader
/// thread that forwards decoded signals to `tx`. Returns nothing the
/// caller needs to hold onto: the handlers and the reader thread live
/// for the remainder of the process.
pub fn install(tx: Sender<Signal>) -> Result<()> {
    let (read_fd, write_fd) = pipe().map_err(Error::Signal)?;
    set_cloexec(read_fd)?;
    set_cloexec(write_fd)?;
    WRITE_FD.store(write_fd, Ordering::Relaxed);

    let handler = SigHandler::Handler(handle_signal);
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());

    for sig in Signal::iterator() {
        // SIGKILL and SIGSTOP can't be caught; sigaction simply errors
        // for them, which we ignore rather than treat as fatal.
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        unsafe {
            let _ = signal::sigaction(sig, &action);
        }
    }

    thread::Builder::new()
        .name("relaunch-signal-reader".into())
        .spawn(move || loop {
            let mut buf = [0u8; 1];
            match read(read_fd, &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if let Ok(sig) = Signal::try_from(buf[0] as i32) {
                        if tx.send(sig).is_err() {
                            break;
                        }
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        })
        .map_err(Error::Io)?;

    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(Error::Signal)?;
    Ok(())
}
