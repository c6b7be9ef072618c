//! The fetch-and-swap pipeline: polling an external source for new
//! binaries, validating a candidate, and atomically replacing the
//! on-disk binary.

mod file_fetcher;
mod swap;

pub use file_fetcher::FileFetcher;
pub use swap::{fetch_and_swap, SwapOutcome};

use std::io::Read;

use crate::error::Result;

/// What a poll of the fetcher yielded.
pub enum FetchOutcome {
    /// Nothing new since the last poll.
    NoChange,
    /// A candidate binary, as a readable byte stream.
    Candidate(Box<dyn Read + Send>),
}

/// The capability set the master's fetch thread needs: "give me a new
/// binary, or tell me there isn't one." Concrete transports (HTTP
/// conditional GET, object-store polling, ...) are out of scope for this
/// crate and implement this trait in the host application; `FileFetcher`
/// is the one reference implementation shipped here, useful for tests
/// and for simple "drop a file in a directory" deployments.
pub trait Fetcher: Send {
    fn poll(&mut self) -> Result<FetchOutcome>;

    /// How long to sleep between polls. Called once per iteration so an
    /// implementation can vary its own backoff.
    fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(30)
    }
}
