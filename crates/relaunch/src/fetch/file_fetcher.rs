use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use super::{FetchOutcome, Fetcher};
use crate::error::Result;

/// Polls a single path on disk for a newer modification time than the
/// last candidate it yielded. Meant for tests ("write a new file, watch
/// the master pick it up") and for simple deployments that drop new
/// binaries into a watched directory rather than speaking a real
/// transport protocol.
pub struct FileFetcher {
    path: PathBuf,
    poll_interval: Duration,
    last_seen: Option<SystemTime>,
}

impl FileFetcher {
    pub fn new(path: PathBuf) -> Self {
        FileFetcher {
            path,
            poll_interval: Duration::from_millis(200),
            last_seen: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Fetcher for FileFetcher {
    fn poll(&mut self) -> Result<FetchOutcome> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FetchOutcome::NoChange)
            }
            Err(e) => return Err(e.into()),
        };
        let modified = metadata.modified()?;
        if Some(modified) == self.last_seen {
            return Ok(FetchOutcome::NoChange);
        }
        self.last_seen = Some(modified);

        let file = File::open(&self.path)?;
        Ok(FetchOutcome::Candidate(Box::new(file) as Box<dyn Read + Send>))
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
