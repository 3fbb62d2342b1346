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

//! Thin wrapper over the OS readiness facility.
//!
//! The reactor is the only caller: it registers sources, waits with a
//! timeout derived from the idle timer, and walks the ready set by index.

use std::io;
use std::time::Duration;

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Token, Waker};

/// A snapshot of one readiness event, detached from the `mio` event
/// buffer so the reactor can mutate itself while handling it.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    /// Registration token of the source that became ready.
    pub token: Token,
    /// Readable, including incoming connections on a listener.
    pub readable: bool,
    /// Writable.
    pub writable: bool,
    /// Peer hang-up or half-close.
    pub hangup: bool,
    /// Error condition on the descriptor.
    pub error: bool,
}

impl From<&Event> for ReadyEvent {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// Readiness dispatcher: registration plus an indexed view of the last
/// wait's ready events.
#[derive(Debug)]
pub struct Poller {
    poll: Poll,
    events: Events,
    ready: Vec<ReadyEvent>,
}

impl Poller {
    /// Creates a poller able to surface up to `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            ready: Vec::with_capacity(capacity),
        })
    }

    /// Creates a waker that makes [`Poller::wait`] return with an event on
    /// `token`. Used by workers to hand connections back to the reactor.
    pub fn waker(&self, token: Token) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), token)
    }

    /// Registers a new source.
    pub fn add<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Changes the interest set of an already-registered source. Re-arming
    /// a connection always goes through here, never through `add`.
    pub fn modify<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Removes a source. Must happen before the descriptor is closed so a
    /// recycled descriptor cannot surface stale events.
    pub fn remove<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks until readiness or `timeout`, returning the number of ready
    /// events. `None` blocks indefinitely. An interrupted wait reports
    /// zero events rather than an error.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.ready.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }
        self.ready.extend(self.events.iter().map(ReadyEvent::from));
        Ok(self.ready.len())
    }

    /// The `i`-th event of the last [`Poller::wait`].
    pub fn event(&self, i: usize) -> ReadyEvent {
        self.ready[i]
    }
}
