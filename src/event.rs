/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! The kernel process-event feed and the event loop.
//!
//! The Linux process connector delivers per-process lifecycle notifications
//! as netlink datagrams on the `CN_IDX_PROC` multicast group.  This module
//! opens that feed, turns the raw datagrams into typed [`Event`]s (only
//! `FORK` and `EXIT` are of interest; everything else is discarded), and
//! multiplexes the feed with the supervisor's wakeup channel in an epoll
//! loop.
//!
//! `libc` carries no definitions for `cn_msg` or `proc_event`, and the wire
//! format is a pair of packed, aligned structures anyway, so both the
//! subscription message and the decoder work on explicit byte offsets
//! rather than struct layout.

use crate::nyx::Nyx;
use crate::signals;
use crate::sys;
use crate::wakeup::WakeupFd;
use anyhow::{Context, Result};
use libc::pid_t;
use std::io::ErrorKind;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd};
use tracing::{event, Level};

/// Process-connector multicast group (`CN_IDX_PROC`/`CN_VAL_PROC` from
/// `linux/connector.h`).
const CN_IDX_PROC: u32 = 1;
const CN_VAL_PROC: u32 = 1;

/// `proc_cn_mcast_op` values from `linux/cn_proc.h`.
const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_CN_MCAST_IGNORE: u32 = 2;

/// `proc_event.what` opcodes from `linux/cn_proc.h`.  Only FORK and EXIT
/// are consumed; NONE/EXEC/UID/GID and the rest are discarded.
const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

/// Byte layout of a connector datagram: a netlink header, then a packed
/// `cn_msg`, then the `proc_event` payload (opcode, cpu, timestamp, data).
const NLMSG_HDRLEN: usize = 16;
const CN_MSG_LEN: usize = 20;
const PROC_EVENT_WHAT: usize = NLMSG_HDRLEN + CN_MSG_LEN;
const PROC_EVENT_DATA: usize = PROC_EVENT_WHAT + 16;

/// `NLMSG_DONE` from `linux/netlink.h`.
const NLMSG_DONE: u16 = 3;

/// Size of the epoll readiness set.  Two registered fds today; sized with
/// headroom.
const MAX_CONN: usize = 16;

/// One reusable receive buffer is plenty: connector datagrams are tiny.
const RECV_BUF_LEN: usize = 256;

/// A kernel process event the supervisor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Fork {
        parent_pid: pid_t,
        parent_tgid: pid_t,
        child_pid: pid_t,
        child_tgid: pid_t,
    },
    Exit {
        pid: pid_t,
        tgid: pid_t,
        exit_code: u32,
        exit_signal: u32,
    },
}

impl Event {
    /// The PID the dispatcher should look up: the parent for a fork, the
    /// exiting process for an exit.
    pub fn dispatch_pid(&self) -> pid_t {
        match *self {
            Event::Fork { parent_pid, .. } => parent_pid,
            Event::Exit { pid, .. } => pid,
        }
    }
}

/// Opens the netlink connector socket, bound to our PID and the process-
/// event multicast group.
pub fn connect() -> Result<OwnedFd> {
    sys::netlink_socket(CN_IDX_PROC).context("opening netlink connector socket")
}

pub fn subscribe(socket: &OwnedFd) -> Result<()> {
    set_mcast_listen(socket, true).context("subscribing to process events")
}

pub fn unsubscribe(socket: &OwnedFd) -> Result<()> {
    set_mcast_listen(socket, false).context("unsubscribing from process events")
}

fn set_mcast_listen(socket: &OwnedFd, enable: bool) -> Result<(), std::io::Error> {
    let op = if enable {
        PROC_CN_MCAST_LISTEN
    } else {
        PROC_CN_MCAST_IGNORE
    };
    sys::send(socket.as_raw_fd(), &mcast_message(op))
}

/// Builds the multicast listen/ignore message: a netlink header of type
/// `NLMSG_DONE` followed contiguously by a `cn_msg` addressed to the
/// process connector and the one-word opcode.  40 bytes, which satisfies
/// the `NLMSG_ALIGNTO` (4 byte) alignment requirement by construction.
fn mcast_message(op: u32) -> Vec<u8> {
    let len = NLMSG_HDRLEN + CN_MSG_LEN + mem::size_of::<u32>();
    let mut msg = Vec::with_capacity(len);

    // struct nlmsghdr
    msg.extend_from_slice(&(len as u32).to_ne_bytes());
    msg.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
    msg.extend_from_slice(&0u16.to_ne_bytes()); // nlmsg_flags
    msg.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_seq
    msg.extend_from_slice(&(std::process::id()).to_ne_bytes()); // nlmsg_pid

    // struct cn_msg
    msg.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    msg.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // ack
    msg.extend_from_slice(&(mem::size_of::<u32>() as u16).to_ne_bytes()); // len
    msg.extend_from_slice(&0u16.to_ne_bytes()); // flags

    // enum proc_cn_mcast_op
    msg.extend_from_slice(&op.to_ne_bytes());

    msg
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_i32(buf: &[u8], offset: usize) -> Option<i32> {
    read_u32(buf, offset).map(|value| value as i32)
}

/// Interprets one received datagram.  Pure and total: truncated, malformed
/// or uninteresting messages yield `None`, never an error.
pub fn decode(buf: &[u8]) -> Option<Event> {
    match read_u32(buf, PROC_EVENT_WHAT)? {
        PROC_EVENT_FORK => Some(Event::Fork {
            parent_pid: read_i32(buf, PROC_EVENT_DATA)?,
            parent_tgid: read_i32(buf, PROC_EVENT_DATA + 4)?,
            child_pid: read_i32(buf, PROC_EVENT_DATA + 8)?,
            child_tgid: read_i32(buf, PROC_EVENT_DATA + 12)?,
        }),
        PROC_EVENT_EXIT => Some(Event::Exit {
            pid: read_i32(buf, PROC_EVENT_DATA)?,
            tgid: read_i32(buf, PROC_EVENT_DATA + 4)?,
            exit_code: read_u32(buf, PROC_EVENT_DATA + 8)?,
            exit_signal: read_u32(buf, PROC_EVENT_DATA + 12)?,
        }),
        _ => None,
    }
}

/// Runs the readiness loop over the connector socket and the wakeup
/// channel until shutdown is requested or the socket fails.
///
/// A ready wakeup fd is drained and flips the exit flag.  A ready socket
/// yields one datagram: zero bytes means the socket was shut down,
/// `EINTR`/`EAGAIN` are retried on the next readiness, any other error
/// ends the loop.  Decoded events with a positive dispatch PID are handed
/// to `handler`.
pub fn event_loop<F>(socket: &OwnedFd, wakeup: &WakeupFd, nyx: &Nyx, mut handler: F) -> Result<()>
where
    F: FnMut(pid_t, &Event, &Nyx),
{
    let epoll = sys::epoll_create().context("creating epoll set")?;
    sys::set_nonblocking(socket.as_raw_fd()).context("unblocking connector socket")?;
    sys::epoll_add(epoll.as_raw_fd(), socket.as_raw_fd()).context("registering connector socket")?;
    sys::set_nonblocking(wakeup.as_raw_fd()).context("unblocking wakeup channel")?;
    sys::epoll_add(epoll.as_raw_fd(), wakeup.as_raw_fd()).context("registering wakeup channel")?;

    let mut buf = vec![0u8; RECV_BUF_LEN];
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_CONN];

    event!(Level::DEBUG, "Starting event manager loop");

    'outer: while !signals::need_exit() {
        let ready = sys::epoll_wait(epoll.as_raw_fd(), &mut events).context("epoll_wait")?;

        for entry in &events[..ready] {
            if entry.u64 == wakeup.as_raw_fd() as u64 {
                event!(Level::DEBUG, "Received event on the wakeup channel");
                if let Err(err) = wakeup.drain() {
                    event!(Level::ERROR, "draining wakeup channel failed ({err})");
                }
                signals::set_need_exit();
                continue;
            }

            match sys::recv(socket.as_raw_fd(), &mut buf) {
                // socket shutdown
                Ok(0) => break 'outer,
                Ok(received) => {
                    if let Some(ev) = decode(&buf[..received]) {
                        let pid = ev.dispatch_pid();
                        if pid > 0 {
                            handler(pid, &ev, nyx);
                        }
                    }
                }
                Err(err)
                    if err.kind() == ErrorKind::Interrupted
                        || err.kind() == ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(err) => {
                    event!(Level::ERROR, "receiving process event failed ({err})");
                    return Err(err).context("receiving process event");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(what: u32, data: [u32; 4]) -> Vec<u8> {
        let mut buf = vec![0u8; PROC_EVENT_DATA + 16];
        buf[PROC_EVENT_WHAT..PROC_EVENT_WHAT + 4].copy_from_slice(&what.to_ne_bytes());
        for (i, word) in data.iter().enumerate() {
            let at = PROC_EVENT_DATA + i * 4;
            buf[at..at + 4].copy_from_slice(&word.to_ne_bytes());
        }
        buf
    }

    #[test]
    fn decodes_fork_events() {
        let buf = datagram(PROC_EVENT_FORK, [100, 100, 101, 101]);
        let ev = decode(&buf).unwrap();
        assert_eq!(
            ev,
            Event::Fork {
                parent_pid: 100,
                parent_tgid: 100,
                child_pid: 101,
                child_tgid: 101,
            }
        );
        assert_eq!(ev.dispatch_pid(), 100);
    }

    #[test]
    fn decodes_exit_events() {
        let buf = datagram(PROC_EVENT_EXIT, [42, 42, 9, 15]);
        let ev = decode(&buf).unwrap();
        assert_eq!(
            ev,
            Event::Exit {
                pid: 42,
                tgid: 42,
                exit_code: 9,
                exit_signal: 15,
            }
        );
        assert_eq!(ev.dispatch_pid(), 42);
    }

    #[test]
    fn discards_uninteresting_opcodes() {
        // NONE, EXEC, UID, GID
        for what in [0u32, 0x2, 0x4, 0x40] {
            assert_eq!(decode(&datagram(what, [1, 1, 1, 1])), None);
        }
    }

    #[test]
    fn truncated_messages_never_decode() {
        let full = datagram(PROC_EVENT_FORK, [100, 100, 101, 101]);
        for len in 0..full.len() {
            assert_eq!(decode(&full[..len]), None, "prefix of {len} bytes");
        }
    }

    #[test]
    fn arbitrary_bytes_do_not_panic() {
        let junk: Vec<u8> = (0..=255).collect();
        let _ = decode(&junk);
        let _ = decode(&[]);
        let _ = decode(&[0xff; 39]);
    }

    #[test]
    fn mcast_message_layout() {
        let msg = mcast_message(PROC_CN_MCAST_LISTEN);
        assert_eq!(msg.len(), 40);
        // aligned for NLMSG_ALIGNTO
        assert_eq!(msg.len() % 4, 0);
        // nlmsghdr: len, type
        assert_eq!(read_u32(&msg, 0), Some(40));
        assert_eq!(u16::from_ne_bytes([msg[4], msg[5]]), NLMSG_DONE);
        assert_eq!(read_u32(&msg, 12), Some(std::process::id()));
        // cn_msg id and payload length
        assert_eq!(read_u32(&msg, 16), Some(CN_IDX_PROC));
        assert_eq!(read_u32(&msg, 20), Some(CN_VAL_PROC));
        assert_eq!(u16::from_ne_bytes([msg[32], msg[33]]), 4);
        // opcode
        assert_eq!(read_u32(&msg, 36), Some(PROC_CN_MCAST_LISTEN));
        assert_eq!(
            read_u32(&mcast_message(PROC_CN_MCAST_IGNORE), 36),
            Some(PROC_CN_MCAST_IGNORE)
        );
    }
}
