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

//! The reactor.
//!
//! One thread owns the dispatcher, the connection table and the idle
//! timer. It accepts sockets, hands readiness events to the worker pool
//! one task per connection at a time, and closes whatever hangs up or
//! goes idle. Workers never touch the dispatcher: they return a verdict
//! over the handback channel and wake the reactor, which re-arms the
//! connection with `modify` or tears it down.

use std::fmt;
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token, Waker};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::UserStore;
use crate::http::connection::{self, Connection};
use crate::pool::WorkerPool;
use crate::poller::{Poller, ReadyEvent};
use crate::timer::IdleTimer;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);
const EVENT_CAPACITY: usize = 1024;
const LISTEN_BACKLOG: i32 = 8;

/// What a worker decided should happen to its connection next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    RearmRead,
    RearmWrite,
    Close,
}

#[derive(Debug)]
struct Handback {
    token: Token,
    verdict: Verdict,
}

/// The work a dispatched task performs.
#[derive(Debug, Clone, Copy)]
enum Op {
    Read,
    Write,
}

/// Table entry: the shared connection plus the reactor-side dispatch
/// state that realises one-shot delivery.
struct ConnEntry {
    conn: Arc<Mutex<Connection>>,
    /// A worker task currently owns this connection; further events are
    /// suppressed until it hands the connection back.
    in_flight: bool,
    /// Close as soon as the in-flight worker hands the connection back.
    close_pending: bool,
}

/// Single-reactor HTTP server over a bounded worker pool.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    poller: Poller,
    timer: IdleTimer,
    pool: WorkerPool,
    conns: Slab<ConnEntry>,
    waker: Arc<Waker>,
    handback_tx: Sender<Handback>,
    handback_rx: Receiver<Handback>,
    idle_timeout: Option<Duration>,
    max_connections: usize,
    src_dir: Arc<String>,
    store: Arc<dyn UserStore>,
    closed: bool,
}

impl Server {
    /// Binds the listen socket and assembles the reactor. A bind or
    /// registration failure surfaces here and the loop is never entered.
    pub fn bind(config: &Config, store: Arc<dyn UserStore>) -> anyhow::Result<Self> {
        let local_addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_linger(Some(Duration::from_secs(1)))?;
        socket.bind(&local_addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(socket.into());
        let local_addr = listener.local_addr()?;

        let poller = Poller::new(EVENT_CAPACITY)?;
        poller.add(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(poller.waker(WAKE_TOKEN)?);
        let (handback_tx, handback_rx) = unbounded();

        let src_dir = Arc::new(config.src_dir.to_string_lossy().into_owned());
        info!(
            "listening on {local_addr}, {} workers, src dir {src_dir}, idle timeout {:?}",
            config.workers,
            config.idle_timeout(),
        );

        Ok(Self {
            listener,
            local_addr,
            poller,
            timer: IdleTimer::new(),
            pool: WorkerPool::new(config.workers),
            conns: Slab::new(),
            waker,
            handback_tx,
            handback_rx,
            idle_timeout: config.idle_timeout(),
            max_connections: config.max_connections,
            src_dir,
            store,
            closed: false,
        })
    }

    /// The bound listen address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the reactor loop until a fatal dispatcher error.
    pub fn run(&mut self) {
        info!("server started on {}", self.local_addr);
        while !self.closed {
            let timeout = if self.idle_timeout.is_some() {
                self.expire_idle();
                self.timer.poll_timeout(Instant::now())
            } else {
                None
            };
            let count = match self.poller.wait(timeout) {
                Ok(count) => count,
                Err(err) => {
                    error!("dispatcher wait failed: {err}");
                    self.closed = true;
                    break;
                }
            };
            for i in 0..count {
                let event = self.poller.event(i);
                match event.token {
                    LISTEN_TOKEN => self.accept_ready(),
                    WAKE_TOKEN => self.drain_handbacks(),
                    _ => self.dispatch(event),
                }
            }
        }
        info!("server loop exited");
    }

    /// Closes idle connections whose deadline passed. A connection with a
    /// worker in flight is flagged instead and closed on handback.
    fn expire_idle(&mut self) {
        for key in self.timer.tick(Instant::now()) {
            let deferred = match self.conns.get_mut(key) {
                None => continue,
                Some(entry) if entry.in_flight => {
                    entry.close_pending = true;
                    true
                }
                Some(_) => false,
            };
            if !deferred {
                debug!("idle timeout on token {key}");
                self.close_conn(Token(key));
            }
        }
    }

    /// Accepts until the listener would block.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if connection::user_count() >= self.max_connections {
                        warn!("connection table full, rejecting {addr}");
                        self.reject(stream);
                        return;
                    }
                    self.add_client(stream, addr);
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("accept failed: {err}");
                    return;
                }
            }
        }
    }

    /// Best-effort overload reply; dropping the stream closes it.
    fn reject(&self, mut stream: TcpStream) {
        let _ = stream.write(b"Server busy");
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        let entry = self.conns.vacant_entry();
        let token = Token(entry.key());
        let mut conn = Connection::new(stream, addr, Arc::clone(&self.src_dir), Arc::clone(&self.store));
        if let Err(err) = conn.register(&self.poller, token, Interest::READABLE) {
            error!("cannot register client {addr}: {err}");
            conn.close();
            return;
        }
        entry.insert(ConnEntry {
            conn: Arc::new(Mutex::new(conn)),
            in_flight: false,
            close_pending: false,
        });
        if let Some(timeout) = self.idle_timeout {
            self.timer.add(token.0, timeout);
        }
        debug!("client {addr} registered as token {}", token.0);
    }

    /// Routes one readiness event: hang-ups close, readable/writable
    /// events extend the deadline and dispatch a task. While a task is in
    /// flight the event is suppressed; a still-ready socket resurfaces
    /// when the re-arm modify runs.
    fn dispatch(&mut self, event: ReadyEvent) {
        let token = event.token;
        enum Action {
            Close,
            Spawn(Op, Arc<Mutex<Connection>>),
            Ignore,
        }
        let action = {
            let Some(entry) = self.conns.get_mut(token.0) else {
                return;
            };
            if event.error || event.hangup {
                if entry.in_flight {
                    entry.close_pending = true;
                    Action::Ignore
                } else {
                    Action::Close
                }
            } else if entry.in_flight {
                Action::Ignore
            } else if event.readable {
                entry.in_flight = true;
                Action::Spawn(Op::Read, Arc::clone(&entry.conn))
            } else if event.writable {
                entry.in_flight = true;
                Action::Spawn(Op::Write, Arc::clone(&entry.conn))
            } else {
                error!("unexpected event on token {}", token.0);
                Action::Ignore
            }
        };
        match action {
            Action::Close => self.close_conn(token),
            Action::Spawn(op, conn) => {
                self.extend_deadline(token);
                self.spawn(token, conn, op);
            }
            Action::Ignore => {}
        }
    }

    /// Queues the actual socket work on the pool. The task ends by
    /// sending its verdict back and waking the reactor.
    fn spawn(&self, token: Token, conn: Arc<Mutex<Connection>>, op: Op) {
        let handback = self.handback_tx.clone();
        let waker = Arc::clone(&self.waker);
        self.pool.add_task(move || {
            let verdict = match conn.lock() {
                Ok(mut conn) => match op {
                    Op::Read => on_read(&mut conn),
                    Op::Write => on_write(&mut conn),
                },
                Err(_) => Verdict::Close,
            };
            let _ = handback.send(Handback { token, verdict });
            let _ = waker.wake();
        });
    }

    /// Applies worker verdicts: close, or re-arm through `modify` and
    /// refresh the idle deadline.
    fn drain_handbacks(&mut self) {
        while let Ok(handback) = self.handback_rx.try_recv() {
            let token = handback.token;
            let close = {
                let Some(entry) = self.conns.get_mut(token.0) else {
                    continue;
                };
                entry.in_flight = false;
                entry.close_pending || handback.verdict == Verdict::Close
            };
            if close {
                self.close_conn(token);
                continue;
            }
            let interest = match handback.verdict {
                Verdict::RearmWrite => Interest::WRITABLE,
                _ => Interest::READABLE,
            };
            self.rearm(token, interest);
        }
    }

    fn rearm(&mut self, token: Token, interest: Interest) {
        let Some(entry) = self.conns.get(token.0) else {
            return;
        };
        let conn = Arc::clone(&entry.conn);
        let rearmed = match conn.lock() {
            Ok(mut conn) => conn.reregister(&self.poller, token, interest).is_ok(),
            Err(_) => false,
        };
        if rearmed {
            self.extend_deadline(token);
        } else {
            error!("re-arm failed for token {}", token.0);
            self.close_conn(token);
        }
    }

    fn extend_deadline(&mut self, token: Token) {
        if let Some(timeout) = self.idle_timeout {
            if self.timer.contains(token.0) {
                self.timer.adjust(token.0, timeout);
            } else {
                self.timer.add(token.0, timeout);
            }
        }
    }

    /// Removes the connection from the table and the dispatcher, then
    /// closes it. The socket itself is released once the last in-flight
    /// reference drops.
    fn close_conn(&mut self, token: Token) {
        if !self.conns.contains(token.0) {
            return;
        }
        let entry = self.conns.remove(token.0);
        let mut conn = entry
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _ = conn.deregister(&self.poller);
        conn.close();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.conns.len())
            .field("idle_timeout", &self.idle_timeout)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Read-side task: drain the socket, then parse. A response ready to go
/// re-arms for write, an unfinished request re-arms for read, and any
/// read error beyond would-block closes.
fn on_read(conn: &mut Connection) -> Verdict {
    if let Err(err) = conn.read() {
        if err.kind() != ErrorKind::WouldBlock {
            return Verdict::Close;
        }
    }
    if conn.process() {
        Verdict::RearmWrite
    } else {
        Verdict::RearmRead
    }
}

/// Write-side task: flush both scatter segments. A drained response
/// either parses the next pipelined request (keep-alive) or closes; a
/// partial write re-arms for write.
fn on_write(conn: &mut Connection) -> Verdict {
    match conn.write() {
        Err(err) => {
            if err.kind() == ErrorKind::WouldBlock {
                Verdict::RearmWrite
            } else {
                Verdict::Close
            }
        }
        Ok(_) => {
            if conn.to_write_bytes() == 0 {
                if conn.is_keep_alive() {
                    if conn.process() {
                        Verdict::RearmWrite
                    } else {
                        Verdict::RearmRead
                    }
                } else {
                    Verdict::Close
                }
            } else {
                Verdict::Close
            }
        }
    }
}
