// Copyright 2025 The stoker authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-connection driver.
//!
//! Owns the socket, both buffers, the request parser and the response
//! builder. Exactly one worker drives a connection at a time; the reactor
//! guarantees that through its one-shot dispatch, so none of this needs
//! interior locking of its own.

use std::fmt;
use std::io::{self, ErrorKind, IoSlice, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, info};

use crate::buffer::Buffer;
use crate::db::UserStore;
use crate::http::request::{ParseState, ParseStatus, Request};
use crate::http::response::Response;
use crate::poller::Poller;

/// Live connections across the whole process.
static USER_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Number of currently open connections.
pub fn user_count() -> usize {
    USER_COUNT.load(Ordering::Relaxed)
}

/// One accepted client connection and everything needed to serve it.
pub struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Response,
    /// Bytes of the mapped body already written (scatter segment 1).
    body_written: usize,
    closed: bool,
    src_dir: Arc<String>,
    store: Arc<dyn UserStore>,
}

impl Connection {
    /// Wraps a freshly accepted stream. Counts towards [`user_count`] until
    /// closed.
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        src_dir: Arc<String>,
        store: Arc<dyn UserStore>,
    ) -> Self {
        let users = USER_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        info!("client {addr} in, users: {users}");
        Self {
            stream,
            addr,
            read_buf: Buffer::default(),
            write_buf: Buffer::default(),
            request: Request::new(),
            response: Response::new(),
            body_written: 0,
            closed: false,
            src_dir,
            store,
        }
    }

    /// Peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Registers the stream with the dispatcher.
    pub fn register(&mut self, poller: &Poller, token: Token, interest: Interest) -> io::Result<()> {
        poller.add(&mut self.stream, token, interest)
    }

    /// Re-arms the stream for its next event.
    pub fn reregister(
        &mut self,
        poller: &Poller,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        poller.modify(&mut self.stream, token, interest)
    }

    /// Removes the stream from the dispatcher. Must precede the actual
    /// socket close so a recycled descriptor cannot surface stale events.
    pub fn deregister(&mut self, poller: &Poller) -> io::Result<()> {
        poller.remove(&mut self.stream)
    }

    /// Drains the socket into the read buffer until it would block.
    /// Returns the bytes read; an end-of-stream with nothing read surfaces
    /// as an error so the caller closes.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_from(&mut self.stream) {
                Ok(0) => {
                    if total == 0 {
                        return Err(ErrorKind::UnexpectedEof.into());
                    }
                    return Ok(total);
                }
                Ok(n) => total += n,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// Writes the response with a scatter write over the header span and
    /// the mapped file, looping until everything is out or the socket
    /// would block (reported as an error for the caller to re-arm on).
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            if self.to_write_bytes() == 0 {
                return Ok(total);
            }
            let header_len = self.write_buf.readable_bytes();
            let body_offset = self.body_written;
            let written = {
                let header = self.write_buf.peek();
                let body = self
                    .response
                    .file()
                    .map(|mapped| &mapped[body_offset.min(mapped.len())..])
                    .unwrap_or(&[]);
                self.stream
                    .write_vectored(&[IoSlice::new(header), IoSlice::new(body)])
            };
            match written {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    total += n;
                    let from_header = n.min(header_len);
                    self.write_buf.retrieve(from_header);
                    self.body_written += n - from_header;
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Bytes still queued across both scatter segments.
    pub fn to_write_bytes(&self) -> usize {
        let body = self
            .response
            .file()
            .map(|mapped| mapped.len().saturating_sub(self.body_written))
            .unwrap_or(0);
        self.write_buf.readable_bytes() + body
    }

    /// Parses whatever the read buffer holds and, once a request is
    /// complete (or proven bad), assembles the response. Returns true when
    /// there is a response to write; false asks the reactor to re-arm for
    /// reading.
    pub fn process(&mut self) -> bool {
        if self.request.state() == ParseState::Finish {
            self.request.reset();
        }
        if self.read_buf.readable_bytes() == 0 {
            return false;
        }
        match self.request.parse(&mut self.read_buf, self.store.as_ref()) {
            ParseStatus::Complete => {
                debug!("request path {}", self.request.path());
                self.response.init(
                    &self.src_dir,
                    self.request.path(),
                    self.request.is_keep_alive(),
                    200,
                );
            }
            ParseStatus::Incomplete => return false,
            _ => {
                self.response
                    .init(&self.src_dir, self.request.path(), false, 400);
            }
        }
        self.response.make(&mut self.write_buf);
        self.body_written = 0;
        debug!(
            "response ready, {} bytes queued for {}",
            self.to_write_bytes(),
            self.addr
        );
        true
    }

    /// Whether the current exchange keeps the connection open.
    pub fn is_keep_alive(&self) -> bool {
        self.request.is_keep_alive()
    }

    /// Closes the connection: unmaps any file body, stops counting it and
    /// shuts the socket down. Idempotent; only the first call decrements
    /// the user count.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.response.unmap_file();
        let users = USER_COUNT.fetch_sub(1, Ordering::Relaxed) - 1;
        let _ = self.stream.shutdown(Shutdown::Both);
        info!("client {} quit, users: {}", self.addr, users);
    }

    /// True once [`Connection::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("closed", &self.closed)
            .field("readable", &self.read_buf.readable_bytes())
            .field("to_write", &self.to_write_bytes())
            .finish()
    }
}
