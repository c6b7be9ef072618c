//! The framed control-channel protocol spoken between a relaunch master and
//! the single child it currently supervises, plus the handful of
//! environment variable names that make up the external contract between
//! the two (see the bootstrap section of the design doc).
//!
//! The wire format is intentionally dumb: a 4-byte big-endian length
//! followed by a payload whose first byte is a message kind and whose
//! remaining bytes are reserved for future use (empty today). Receivers
//! ignore unknown kinds so the format can grow without breaking an old
//! master talking to a newer child or vice versa.

mod error;
mod message;

pub use error::{Error, Result};
pub use message::Message;

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Unset: master mode. `"slave"`: slave mode. `"probe"`: probe mode.
pub const ROLE_VAR: &str = "RELAUNCH_ROLE";
pub const ROLE_SLAVE: &str = "slave";
pub const ROLE_PROBE: &str = "probe";

/// Printed to stdout, followed by a zero exit, when invoked in probe mode.
pub const PROBE_TOKEN: &str = "RELAUNCH-PROBE-OK";

/// Decimal generation id handed to the child.
pub const GENERATION_VAR: &str = "RELAUNCH_GENERATION";
/// Decimal count of inherited listener FDs, starting at `LISTENER_FD_START`.
pub const LISTENER_COUNT_VAR: &str = "RELAUNCH_LISTENER_COUNT";
/// Decimal FD number of the control-channel endpoint inside the child.
pub const CHANNEL_FD_VAR: &str = "RELAUNCH_CHANNEL_FD";

/// First inheritable slot a listener FD is duplicated into. Slots 0-2 are
/// stdin/stdout/stderr, so listeners start immediately after those.
pub const LISTENER_FD_START: i32 = 3;

/// Maximum payload a single frame may carry. The format has no use for
/// anything larger today; this just bounds a hostile or corrupt peer.
const MAX_PAYLOAD_LEN: u32 = 4096;

/// Write one framed message to `w`.
pub fn write_message<W: Write>(w: &mut W, msg: Message) -> Result<()> {
    let kind = msg.kind();
    w.write_u32::<BigEndian>(1)?;
    w.write_u8(kind)?;
    w.flush()?;
    Ok(())
}

/// Read one framed message from `r`.
///
/// Returns `Ok(None)` on a clean EOF (the peer closed its end of the
/// channel); callers treat that the same as an explicit `Terminated` if
/// none was already received, per the channel's close semantics.
pub fn read_message<R: Read>(r: &mut R) -> Result<Option<Message>> {
    let len = match r.read_u32::<BigEndian>() {
        Ok(len) => len,
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len == 0 {
        return Ok(Some(Message::Unknown(0)));
    }
    if len > MAX_PAYLOAD_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(Some(Message::from_kind(payload[0])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(msg: Message) -> Message {
        let mut buf = Vec::new();
        write_message(&mut buf, msg).unwrap();
        let mut cursor = Cursor::new(buf);
        read_message(&mut cursor).unwrap().unwrap()
    }

    #[test]
    fn ready_roundtrips() {
        assert_eq!(roundtrip(Message::Ready), Message::Ready);
    }

    #[test]
    fn terminate_roundtrips() {
        assert_eq!(roundtrip(Message::Terminate), Message::Terminate);
    }

    #[test]
    fn restart_request_roundtrips() {
        assert_eq!(roundtrip(Message::RestartRequest), Message::RestartRequest);
    }

    #[test]
    fn terminated_roundtrips() {
        assert_eq!(roundtrip(Message::Terminated), Message::Terminated);
    }

    #[test]
    fn unknown_kind_is_preserved_not_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.push(0xFE);
        let mut cursor = Cursor::new(buf);
        match read_message(&mut cursor).unwrap() {
            Some(Message::Unknown(0xFE)) => {}
            other => panic!("expected Unknown(0xFE), got {:?}", other),
        }
    }

    #[test]
    fn eof_before_any_frame_is_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_message(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_message(&mut cursor),
            Err(Error::FrameTooLarge(_))
        ));
    }
}
