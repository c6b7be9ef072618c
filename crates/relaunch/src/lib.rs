//! A self-upgrading, gracefully restarting binary supervisor for
//! long-lived Unix network services.
//!
//! A host application builds a [`Config`] naming its entry point,
//! listening addresses, and (optionally) a binary fetcher, then calls
//! [`bootstrap::run`] from `fn main`. The same binary then plays one of
//! three roles depending on how it was invoked: the long-lived master
//! that owns the listening sockets and supervises children, the slave
//! runtime that runs inside each child, or a one-shot probe a candidate
//! binary answers during upgrade validation. See the crate's design
//! notes for the full architecture.

pub mod binary_id;
pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod error;
pub mod fetch;
pub mod listener;
pub mod logging;
mod master;
mod slave;
pub mod state;

pub use config::{Address, Config, ConfigBuilder, ExitCode, PreUpgradeCheck, Program, Transport};
pub use error::{Error, Result};
pub use fetch::{FetchOutcome, Fetcher, FileFetcher};
pub use state::State;
