//! The single entry point a host `fn main()` calls. Performs the
//! unset/slave/probe mode dispatch described in the external contract
//! and never returns until its role's work is done.

use relaunch_protocol::{PROBE_TOKEN, ROLE_PROBE, ROLE_SLAVE, ROLE_VAR};

use crate::config::Config;
use crate::error::Result;
use crate::{master, slave};

/// Runs this process according to its role, as decided by the
/// `RELAUNCH_ROLE` environment variable: unset runs the master
/// supervisor, `slave` runs the user program inside the slave runtime,
/// and `probe` is a self-check a candidate binary answers during
/// validation and never needs a real `Config` for.
///
/// Returns the status code the caller's `main` should pass to
/// `std::process::exit`.
pub fn run(config: Config) -> Result<i32> {
    match std::env::var(ROLE_VAR) {
        Err(std::env::VarError::NotPresent) => master::run(config),
        Ok(ref role) if role == ROLE_SLAVE => slave::run(&config),
        Ok(ref role) if role == ROLE_PROBE => run_probe(),
        Ok(other) => Err(crate::error::Error::Bootstrap(format!(
            "unrecognized {} value {:?}",
            ROLE_VAR, other
        ))),
        Err(std::env::VarError::NotUnicode(_)) => Err(crate::error::Error::Bootstrap(format!(
            "{} is set but not valid unicode",
            ROLE_VAR
        ))),
    }
}

/// Probe mode never gets here via a user-supplied `Config` -- the
/// master invokes the candidate binary directly and only needs a
/// deterministic "yes, I am a relaunch-aware binary" answer, so this
/// prints the agreed token and exits 0 immediately rather than routing
/// through `main`'s ordinary config-building path.
fn run_probe() -> ! {
    println!("{}", PROBE_TOKEN);
    std::process::exit(0)
}
