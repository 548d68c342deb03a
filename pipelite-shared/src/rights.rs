//! File-descriptor hand-off over a Unix-domain socket.
//!
//! The spawner helper sends the child's pipe ends to the host in a single
//! message: one SCM_RIGHTS control message carrying exactly two fds in fixed
//! order (stdin-write, stdout-read), with a data payload of two native-endian
//! u32 positional markers. Any other message shape is a fatal handshake
//! error.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

use crate::constants::handshake::{FD_COUNT, PAYLOAD_LEN};
use crate::errors::{PipeliteError, PipeliteResult};

/// The two pipe ends handed from the spawner to the host, in wire order.
#[derive(Debug)]
pub struct StdioFds {
    /// Write end of the child's stdin pipe.
    pub stdin_write: OwnedFd,
    /// Read end of the child's stdout pipe.
    pub stdout_read: OwnedFd,
}

/// Encode the positional-marker payload for a rights message.
///
/// The markers are the fd numbers as seen by the sender; the receiving side
/// gets its own fd numbers from the control message, so the markers serve
/// only to pin the message shape and order.
pub fn encode_markers(stdin_write: RawFd, stdout_read: RawFd) -> [u8; PAYLOAD_LEN] {
    let mut payload = [0u8; PAYLOAD_LEN];
    payload[..4].copy_from_slice(&(stdin_write as u32).to_ne_bytes());
    payload[4..].copy_from_slice(&(stdout_read as u32).to_ne_bytes());
    payload
}

/// Decode the positional-marker payload of a rights message.
pub fn parse_markers(payload: &[u8]) -> PipeliteResult<(u32, u32)> {
    if payload.len() != PAYLOAD_LEN {
        return Err(PipeliteError::Handshake(format!(
            "rights payload has {} bytes, expected {}",
            payload.len(),
            PAYLOAD_LEN
        )));
    }

    let first = u32::from_ne_bytes(payload[..4].try_into().expect("length checked"));
    let second = u32::from_ne_bytes(payload[4..].try_into().expect("length checked"));
    Ok((first, second))
}

/// Send both pipe ends over the socket in a single rights message.
pub fn send_stdio_fds<S: AsRawFd>(
    sock: &S,
    stdin_write: RawFd,
    stdout_read: RawFd,
) -> PipeliteResult<()> {
    let payload = encode_markers(stdin_write, stdout_read);
    let iov = [IoSlice::new(&payload)];
    let fds = [stdin_write, stdout_read];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    sendmsg::<UnixAddr>(sock.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(|e| PipeliteError::Handshake(format!("failed to send stdio fds: {}", e)))?;

    Ok(())
}

/// Receive both pipe ends from the socket.
///
/// Performs one `recvmsg` and validates the full message shape: exactly one
/// SCM_RIGHTS control message with exactly two fds, and a payload of exactly
/// two u32 markers. Received fds are opened close-on-exec so they cannot leak
/// into unrelated children spawned by the host.
pub fn recv_stdio_fds<S: AsRawFd>(sock: &S) -> PipeliteResult<StdioFds> {
    let mut buf = [0u8; PAYLOAD_LEN];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; FD_COUNT]);

    // Syscall failures (including EAGAIN on a non-blocking socket) surface
    // as raw errnos; only shape violations are handshake errors.
    let msg = recvmsg::<UnixAddr>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    // Gather everything before judging the shape, so fds received alongside
    // a malformed message still get closed below.
    let mut fds: Vec<RawFd> = Vec::with_capacity(FD_COUNT);
    let mut unexpected: Option<String> = None;
    let cmsgs = msg
        .cmsgs()
        .map_err(|e| PipeliteError::Handshake(format!("failed to parse control messages: {}", e)))?;
    for cmsg in cmsgs {
        match cmsg {
            ControlMessageOwned::ScmRights(received) => fds.extend(received),
            other => unexpected = Some(format!("{:?}", other)),
        }
    }
    let received_bytes = msg.bytes;

    if fds.len() != FD_COUNT {
        let received = fds.len();
        for fd in fds {
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        return Err(PipeliteError::Handshake(format!(
            "rights message carried {} fds, expected {}",
            received, FD_COUNT
        )));
    }

    // Own the fds first; every error path from here closes them on drop.
    let stdin_write = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let stdout_read = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    if let Some(other) = unexpected {
        return Err(PipeliteError::Handshake(format!(
            "unexpected control message: {}",
            other
        )));
    }
    parse_markers(&buf[..received_bytes])?;

    Ok(StdioFds {
        stdin_write,
        stdout_read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn markers_round_trip() {
        let payload = encode_markers(5, 7);
        assert_eq!(parse_markers(&payload).unwrap(), (5, 7));
    }

    #[test]
    fn short_payload_is_rejected() {
        assert!(parse_markers(&[0u8; 3]).is_err());
        assert!(parse_markers(&[0u8; 12]).is_err());
    }

    #[test]
    fn fds_survive_the_hand_off() {
        let (sender, receiver) = UnixStream::pair().unwrap();

        // Two real pipes, exactly as the spawner creates them.
        let (stdin_read, stdin_write) = nix::unistd::pipe().unwrap();
        let (stdout_read, stdout_write) = nix::unistd::pipe().unwrap();

        send_stdio_fds(&sender, stdin_write.as_raw_fd(), stdout_read.as_raw_fd()).unwrap();
        let stdio = recv_stdio_fds(&receiver).unwrap();

        // The sender's own copies must be gone before EOF can be observed.
        drop(stdin_write);
        drop(stdout_read);

        // Writing through the received stdin-write end must come out of the
        // pipe's original read end, and vice versa for stdout.
        let mut wr = std::fs::File::from(stdio.stdin_write);
        wr.write_all(b"ping").unwrap();
        drop(wr);
        let mut buf = Vec::new();
        std::fs::File::from(stdin_read).read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ping");

        let mut wr = std::fs::File::from(stdout_write);
        wr.write_all(b"pong").unwrap();
        drop(wr);
        let mut buf = Vec::new();
        std::fs::File::from(stdio.stdout_read)
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf, b"pong");
    }

    #[test]
    fn plain_data_without_rights_is_rejected() {
        let (mut sender, receiver) = UnixStream::pair().unwrap();
        sender.write_all(&[0u8; 8]).unwrap();

        let err = recv_stdio_fds(&receiver).unwrap_err();
        assert!(matches!(err, PipeliteError::Handshake(_)));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_marker_pair_round_trips(a in 0u32..=u32::MAX, b in 0u32..=u32::MAX) {
                let payload = encode_markers(a as RawFd, b as RawFd);
                prop_assert_eq!(parse_markers(&payload).unwrap(), (a, b));
            }
        }
    }
}
