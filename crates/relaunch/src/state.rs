use std::net::TcpListener;
use std::sync::{Arc, Condvar, Mutex};

use relaunch_protocol::Message;

use crate::channel::ChildChannel;

/// Fires once the master has asked this child to begin graceful
/// shutdown. Cheap to clone; every clone observes the same underlying
/// signal.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    fn new() -> Self {
        CancellationToken {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock().unwrap();
        *fired = true;
        cvar.notify_all();
    }

    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Blocks the calling thread until the token fires.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock().unwrap();
        while !*fired {
            fired = cvar.wait(fired).unwrap();
        }
    }
}

/// Lets the user program ask the master for a graceful restart of its
/// own accord, mirroring the externally-delivered restart signal.
#[derive(Clone)]
pub struct RestartHandle {
    channel: Arc<Mutex<ChildChannel>>,
}

impl RestartHandle {
    pub(crate) fn new(channel: Arc<Mutex<ChildChannel>>) -> Self {
        RestartHandle { channel }
    }

    pub fn request_restart(&self) {
        if let Err(err) = self.channel.lock().unwrap().send(Message::RestartRequest) {
            log::warn!("unable to send restart_request to master: {}", err);
        }
    }
}

/// What the user program sees. Built once inside the slave runtime and
/// handed to `Config::program`.
pub struct State {
    generation: u64,
    binary_id: String,
    listeners: Vec<TcpListener>,
    restart: RestartHandle,
    cancel: CancellationToken,
}

impl State {
    pub(crate) fn new(
        generation: u64,
        binary_id: String,
        listeners: Vec<TcpListener>,
        restart: RestartHandle,
        cancel: CancellationToken,
    ) -> Self {
        State {
            generation,
            binary_id,
            listeners,
            restart,
            cancel,
        }
    }

    /// This child's generation number, as decimal text (e.g. `"3"`).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// SHA-256 of the binary currently executing, hex-encoded.
    pub fn binary_id(&self) -> &str {
        &self.binary_id
    }

    /// The reconstructed listeners, in the same order as `Config::addresses`.
    pub fn listeners(&self) -> &[TcpListener] {
        &self.listeners
    }

    /// Takes ownership of the listeners, e.g. to hand them to a server
    /// framework that wants to own them outright.
    pub fn take_listeners(&mut self) -> Vec<TcpListener> {
        std::mem::take(&mut self.listeners)
    }

    /// `true` once the master has asked this child to shut down.
    pub fn should_terminate(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Blocks until the master asks this child to shut down.
    pub fn wait_for_terminate(&self) {
        self.cancel.wait()
    }

    /// Ask the master to begin a graceful restart.
    pub fn request_restart(&self) {
        self.restart.request_restart()
    }
}

pub(crate) fn new_cancellation_token() -> CancellationToken {
    CancellationToken::new()
}

pub(crate) fn cancel(token: &CancellationToken) {
    token.cancel()
}
