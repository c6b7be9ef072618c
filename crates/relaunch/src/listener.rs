//! Binding and reconstructing the listener set.
//!
//! The master binds every configured address exactly once, at startup,
//! and never rebinds. Listener FDs are then duplicated (never moved)
//! into each child's inherited FD table at the slots described in §6 of
//! the design doc; the slave side reconstructs `TcpListener`s from those
//! same slots.

use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};

use relaunch_protocol::LISTENER_FD_START;

use crate::config::{Address, Transport};
use crate::error::{Error, Result};

/// The master's authoritative set of bound sockets, one per configured
/// address, in address order.
pub struct ListenerSet {
    listeners: Vec<TcpListener>,
}

impl ListenerSet {
    /// Binds every address. Fails fast on the first bind error, per §7:
    /// bind errors are fatal at master startup.
    pub fn bind(addresses: &[Address]) -> Result<Self> {
        let mut listeners = Vec::with_capacity(addresses.len());
        for address in addresses {
            let Transport::Tcp = address.transport;
            let listener =
                TcpListener::bind(address.addr).map_err(|e| Error::Bind(address.addr, e))?;
            listeners.push(listener);
        }
        Ok(ListenerSet { listeners })
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Raw FDs in address order, for duplicating into a child.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.listeners.iter().map(|l| l.as_raw_fd()).collect()
    }
}

/// Rebuilds the listener set inside a child from the inherited FDs
/// starting at `LISTENER_FD_START`, given the count the master told us
/// about over the environment.
pub fn reconstruct(count: usize) -> Result<Vec<TcpListener>> {
    use std::os::unix::io::FromRawFd;

    let mut listeners = Vec::with_capacity(count);
    for i in 0..count {
        let fd = LISTENER_FD_START + i as i32;
        // SAFETY: the master placed a live, bound, listening TCP socket at
        // this slot before `exec`; we own it exclusively from here on.
        let listener = unsafe { TcpListener::from_raw_fd(fd) };
        listeners.push(listener);
    }
    Ok(listeners)
}
