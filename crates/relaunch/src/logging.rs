//! A thin layer over `log` + `env_logger` that tags lifecycle messages
//! with a "preamble" identifying which generation they're about, and
//! colorizes anything alarming.

use ansi_term::Colour;

/// Installs `env_logger` at `default_level` unless the host application
/// has already installed a logger. `log::set_logger` only fails once a
/// logger is already set, which is exactly the signal we want: embedding
/// applications keep control of their own logging setup.
pub fn init_if_unset(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .try_init();
}

/// A lifecycle message about a specific generation, e.g. `"[gen 3]
/// spawned, pid 4821"`. Tagging every lifecycle line this way makes
/// generation transitions easy to pick out of a busy log stream.
pub fn preamble(generation: u64, msg: &str) -> String {
    format!("[gen {}] {}", generation, msg)
}

/// Same as `preamble`, but colorized red, for the handful of events
/// (timeout escalation, spawn failure, unexpected exit) worth catching a
/// reader's eye.
pub fn preamble_alarm(generation: u64, msg: &str) -> String {
    format!("{}", Colour::Red.paint(preamble(generation, msg)))
}
