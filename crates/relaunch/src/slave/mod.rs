//! The runtime that executes inside each child: reconstruct what the
//! master handed down over the environment and inherited FDs, announce
//! readiness, run the user program, and report how it ended.

use std::panic;
use std::sync::{Arc, Mutex};

use relaunch_protocol::{Message, CHANNEL_FD_VAR, GENERATION_VAR, LISTENER_COUNT_VAR};

use crate::binary_id::hash_file;
use crate::channel::ChildChannel;
use crate::config::{Config, ExitCode};
use crate::error::{Error, Result};
use crate::listener;
use crate::state::{self, RestartHandle, State};

/// Runs the slave runtime to completion and returns the exit code the
/// host `main` should pass to `std::process::exit`. Does not return
/// until the user program returns (or panics).
pub fn run(config: &Config) -> Result<ExitCode> {
    let generation = read_env_u64(GENERATION_VAR)?;
    let listener_count = read_env_u64(LISTENER_COUNT_VAR)? as usize;
    let channel_fd = read_env_u64(CHANNEL_FD_VAR)? as i32;

    log::info!("[gen {}] slave starting up", generation);

    let listeners = listener::reconstruct(listener_count)?;

    let channel = ChildChannel::from_inherited_fd(channel_fd)?;
    let channel = Arc::new(Mutex::new(channel));

    let cancel = state::new_cancellation_token();
    {
        let cancel = cancel.clone();
        channel
            .lock()
            .unwrap()
            .spawn_reader(
                move |msg| match msg {
                    Message::Terminate => {
                        log::info!("[gen {}] received terminate, cancelling", generation);
                        state::cancel(&cancel);
                    }
                    other => {
                        log::warn!("[gen {}] unexpected message from master: {:?}", generation, other);
                    }
                },
                move || {
                    log::warn!("[gen {}] control channel closed by master", generation);
                },
            )?;
    }

    let current_exe = std::env::current_exe().map_err(Error::Io)?;
    let binary_id = hash_file(&current_exe).map_err(Error::Io)?;

    let restart = RestartHandle::new(channel.clone());
    let program_state = State::new(generation, binary_id, listeners, restart, cancel);

    channel.lock().unwrap().send(Message::Ready)?;
    log::info!("[gen {}] ready", generation);

    let program = config.program.clone();
    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| program(program_state)));

    match result {
        Ok(exit_code) => {
            channel.lock().unwrap().send(Message::Terminated)?;
            log::info!("[gen {}] program returned {}, exiting", generation, exit_code);
            Ok(exit_code)
        }
        Err(_) => {
            // Deliberately do not send `Terminated`: the master must see
            // this as an unplanned exit (a bare channel close), not a
            // clean shutdown, so it applies the crash-propagation rule
            // rather than the graceful-handover one.
            log::error!("[gen {}] user program panicked", generation);
            Err(Error::UserProgramPanicked)
        }
    }
}

fn read_env_u64(var: &str) -> Result<u64> {
    let raw = std::env::var(var).map_err(|_| {
        Error::Bootstrap(format!("missing required environment variable {}", var))
    })?;
    raw.parse().map_err(|_| {
        Error::Bootstrap(format!(
            "environment variable {} is not a valid integer: {:?}",
            var, raw
        ))
    })
}
