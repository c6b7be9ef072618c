//! The private control channel: a `socketpair(2)`-backed duplex stream
//! carrying framed `relaunch_protocol::Message` values between a master
//! and the one child it currently owns.
//!
//! The master's half is a plain `UnixStream`; reading happens on a
//! dedicated thread so the tick loop never blocks on it (see
//! `master::event` for how the decoded messages flow back in).

use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::thread;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use relaunch_protocol::Message;

use crate::error::{Error, Result};

/// Create a connected pair of endpoints for a new child: the master keeps
/// `master_end`, and `child_fd` is duplicated into the child's FD table
/// at the well-known slot before `exec`.
pub fn new_pair() -> Result<(UnixStream, RawFd)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(|e| Error::Io(std::io::Error::from(e)))?;
    let master_end = unsafe { UnixStream::from_raw_fd(a.into_raw_fd()) };
    Ok((master_end, b.into_raw_fd()))
}

/// The master's handle to one child's control channel.
pub struct MasterChannel {
    writer: UnixStream,
}

impl MasterChannel {
    /// Takes ownership of the master-side stream, spawning a reader
    /// thread that decodes frames and forwards them to `on_message`
    /// until the channel closes (at which point `on_close` runs once).
    pub fn spawn(
        stream: UnixStream,
        mut on_message: impl FnMut(Message) + Send + 'static,
        mut on_close: impl FnMut() + Send + 'static,
    ) -> Result<Self> {
        let writer = stream.try_clone()?;
        let mut reader = stream;
        thread::Builder::new()
            .name("relaunch-channel-reader".into())
            .spawn(move || loop {
                match relaunch_protocol::read_message(&mut reader) {
                    Ok(Some(msg)) => on_message(msg),
                    Ok(None) => {
                        on_close();
                        break;
                    }
                    Err(err) => {
                        log::warn!("dropping malformed control channel frame: {}", err);
                    }
                }
            })
            .map_err(Error::Io)?;
        Ok(MasterChannel { writer })
    }

    pub fn send(&mut self, msg: Message) -> Result<()> {
        relaunch_protocol::write_message(&mut self.writer, msg)?;
        Ok(())
    }
}

/// The child's handle to its control channel, built from the inherited
/// FD named by `RELAUNCH_CHANNEL_FD`.
pub struct ChildChannel {
    writer: UnixStream,
    reader: UnixStream,
}

impl ChildChannel {
    pub fn from_inherited_fd(fd: RawFd) -> Result<Self> {
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        let writer = stream.try_clone()?;
        Ok(ChildChannel {
            writer,
            reader: stream,
        })
    }

    pub fn send(&mut self, msg: Message) -> Result<()> {
        relaunch_protocol::write_message(&mut self.writer, msg)?;
        Ok(())
    }

    /// Spawn a thread that blocks reading frames, invoking `on_message`
    /// for each and `on_close` once the master end goes away.
    pub fn spawn_reader(
        &self,
        mut on_message: impl FnMut(Message) + Send + 'static,
        mut on_close: impl FnMut() + Send + 'static,
    ) -> Result<()> {
        let mut reader = self.reader.try_clone()?;
        thread::Builder::new()
            .name("relaunch-slave-channel-reader".into())
            .spawn(move || loop {
                match relaunch_protocol::read_message(&mut reader) {
                    Ok(Some(msg)) => on_message(msg),
                    Ok(None) => {
                        on_close();
                        break;
                    }
                    Err(err) => {
                        log::warn!("dropping malformed control channel frame: {}", err);
                    }
                }
            })
            .map_err(Error::Io)?;
        Ok(())
    }
}
