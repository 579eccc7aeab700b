// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-socket protocol state machine.
//!
//! One `Connection` serves all three server modes; the drivers differ only
//! in how readiness reaches [`Connection::on_readable`] /
//! [`Connection::on_writable`] and how storage access is serialised. The
//! read side buffers into a fixed 4096-byte window with `[begin, end)`
//! cursors, frames commands through the incremental [`Parser`], accumulates
//! the announced argument bytes, executes, and queues the reply. The write
//! side drains the reply queue with a single vectored write per readiness
//! event, keeping a byte offset into the first partially sent reply.
//!
//! The sockets are registered edge-triggered, so both handlers loop on the
//! socket until `WouldBlock`.

use std::{
    collections::VecDeque,
    io::{self, IoSlice, Read, Write},
    net::SocketAddr,
};

use bytes::Bytes;
use mio::{Interest, net::TcpStream};
use tracing::{debug, trace};

use crate::{command::Command, protocol::Parser, storage::Storage};

pub const READ_BUF_SIZE: usize = 4096;

/// How many queued replies one vectored write may carry.
const WRITE_BATCH: usize = 64;

/// Readiness outcome delivered to a connection coroutine. Only the
/// coroutine server mode uses the pending-event queue; the other modes call
/// the handlers directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    DoRead,
    DoWrite,
    Close,
    OnClose,
    OnError,
}

pub struct Connection {
    socket: TcpStream,
    peer: SocketAddr,

    read_buf: Box<[u8; READ_BUF_SIZE]>,
    read_begin: usize,
    read_end: usize,

    parser: Parser,
    command: Option<Command>,
    arg_remains: usize,
    argument: Vec<u8>,

    responses: VecDeque<Bytes>,
    /// Bytes of the front response already written to the socket.
    write_off: usize,

    want_read: bool,
    want_write: bool,
    /// Readiness flags currently known to the poll registration.
    registered: (bool, bool),

    alive: bool,
    /// Peer sent `quit`: stop reading, die once the reply queue drains.
    quitting: bool,

    /// Pending events for the owning coroutine (coroutine mode only).
    events: VecDeque<Event>,
}

impl Connection {
    pub fn new(socket: TcpStream, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
            read_begin: 0,
            read_end: 0,
            parser: Parser::new(),
            command: None,
            arg_remains: 0,
            argument: Vec::new(),
            responses: VecDeque::new(),
            write_off: 0,
            want_read: false,
            want_write: false,
            registered: (false, false),
            alive: false,
            quitting: false,
            events: VecDeque::new(),
        }
    }

    pub fn start(&mut self) {
        self.alive = true;
        self.quitting = false;
        self.read_begin = 0;
        self.read_end = 0;
        self.want_read = true;
        self.want_write = false;
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Peer closed its write side; finish up and let the acceptor reap us.
    pub fn close(&mut self) {
        self.alive = false;
    }

    /// Terminal transition: no further readiness is wanted and the
    /// connection is eligible for destruction.
    pub fn on_close(&mut self) {
        self.alive = false;
        self.want_read = false;
        self.want_write = false;
    }

    /// Terminal transition after a socket-level error.
    pub fn on_error(&mut self) {
        self.alive = false;
        self.want_read = false;
        self.want_write = false;
    }

    pub fn interest(&self) -> Interest {
        match (self.want_read, self.want_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    pub fn interest_changed(&self) -> bool {
        (self.want_read, self.want_write) != self.registered
    }

    pub fn mark_registered(&mut self) {
        self.registered = (self.want_read, self.want_write);
    }

    pub fn push_event(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn take_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Reads until `WouldBlock`, feeding every received chunk through the
    /// parse → argument → execute pipeline. A zero read or a hard error
    /// marks the connection dead.
    pub fn on_readable(&mut self, store: &mut dyn Storage) {
        while self.alive && !self.quitting {
            match self.socket.read(&mut self.read_buf[self.read_end..]) {
                Ok(0) => {
                    debug!("peer {} closed the connection", self.peer);
                    self.alive = false;
                    return;
                },
                Ok(n) => {
                    trace!("read {n} bytes from {}", self.peer);
                    self.read_end += n;
                    self.drain_buffer(store);
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read from {} failed: {e}", self.peer);
                    self.alive = false;
                    return;
                },
            }
        }
    }

    fn drain_buffer(&mut self, store: &mut dyn Storage) {
        while self.read_begin < self.read_end {
            // No command in flight: keep feeding the parser.
            if self.command.is_none() {
                let chunk = &self.read_buf[self.read_begin..self.read_end];
                match self.parser.parse(chunk) {
                    Ok((consumed, complete)) => {
                        self.read_begin += consumed;
                        if complete {
                            match self.parser.build() {
                                Ok((command, arg_len)) => {
                                    // The binary block is followed by `\r\n`,
                                    // consumed but not part of the value.
                                    self.arg_remains =
                                        if arg_len > 0 { arg_len + 2 } else { 0 };
                                    self.command = Some(command);
                                },
                                Err(e) => {
                                    debug!("rejecting command from {}: {e}", self.peer);
                                    self.protocol_error();
                                    continue;
                                },
                            }
                        }
                        if consumed == 0 {
                            break;
                        }
                    },
                    Err(e) => {
                        debug!("protocol violation from {}: {e}", self.peer);
                        // Drop the rest of the offending line; anything
                        // buffered after it stays queued for parsing.
                        let skipped = self.read_buf[self.read_begin..self.read_end]
                            .iter()
                            .position(|&b| b == b'\n')
                            .map_or(self.read_end - self.read_begin, |pos| pos + 1);
                        self.read_begin += skipped;
                        self.protocol_error();
                        continue;
                    },
                }
            }

            // Command known, argument still arriving.
            if self.command.is_some() && self.arg_remains > 0 {
                let take = self.arg_remains.min(self.read_end - self.read_begin);
                self.argument.extend_from_slice(
                    &self.read_buf[self.read_begin..self.read_begin + take],
                );
                self.arg_remains -= take;
                self.read_begin += take;
            }

            // Command and argument complete: execute and queue the reply.
            if self.arg_remains == 0
                && let Some(command) = self.command.take()
            {
                if !self.argument.is_empty() {
                    self.argument.truncate(self.argument.len() - 2);
                }
                if command.is_quit() {
                    debug!("peer {} requested quit", self.peer);
                    // Stop reading, but let queued replies drain first; the
                    // connection dies once the write side empties the queue.
                    self.quitting = true;
                    self.want_read = false;
                    self.argument.clear();
                    self.parser.reset();
                    if self.responses.is_empty() {
                        self.alive = false;
                    }
                    break;
                }
                let mut reply = command.execute(store, &self.argument);
                if command.noreply() {
                    trace!("suppressing reply for noreply command");
                } else {
                    reply.extend_from_slice(b"\r\n");
                    self.responses.push_back(Bytes::from(reply));
                    self.want_write = true;
                }
                self.argument.clear();
                self.parser.reset();
            }
        }

        if self.read_begin == self.read_end {
            self.read_begin = 0;
            self.read_end = 0;
        } else if self.read_end == READ_BUF_SIZE {
            self.read_buf.copy_within(self.read_begin..self.read_end, 0);
            self.read_end -= self.read_begin;
            self.read_begin = 0;
        }
    }

    /// Recoverable protocol failure: answer `ERROR` and clear the in-flight
    /// command state. The read cursors are left alone, so input buffered
    /// past the malformed line is parsed normally afterwards; the caller
    /// skips whatever part of the bad line the parser did not consume.
    fn protocol_error(&mut self) {
        self.responses.push_back(Bytes::from_static(b"ERROR\r\n"));
        self.want_write = true;
        self.parser.reset();
        self.command = None;
        self.argument.clear();
        self.arg_remains = 0;
    }

    /// Writes queued replies until the queue drains or the socket would
    /// block. Replies are gathered into one vectored write per attempt.
    pub fn on_writable(&mut self) {
        while !self.responses.is_empty() {
            let written = {
                let mut iov: Vec<IoSlice<'_>> =
                    Vec::with_capacity(self.responses.len().min(WRITE_BATCH));
                for (i, response) in self.responses.iter().take(WRITE_BATCH).enumerate()
                {
                    let start = if i == 0 { self.write_off } else { 0 };
                    iov.push(IoSlice::new(&response[start..]));
                }
                self.socket.write_vectored(&iov)
            };
            match written {
                Ok(0) => {
                    debug!("write to {} returned zero", self.peer);
                    self.alive = false;
                    return;
                },
                Ok(mut n) => {
                    trace!("wrote {n} bytes to {}", self.peer);
                    while n > 0 {
                        let Some(front) = self.responses.front() else {
                            break;
                        };
                        let remaining = front.len() - self.write_off;
                        if n >= remaining {
                            self.responses.pop_front();
                            self.write_off = 0;
                            n -= remaining;
                        } else {
                            self.write_off += n;
                            n = 0;
                        }
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("write to {} failed: {e}", self.peer);
                    self.alive = false;
                    return;
                },
            }
        }
        self.want_write = false;
        if self.quitting {
            debug!("reply queue drained, closing {} after quit", self.peer);
            self.alive = false;
        }
    }
}
