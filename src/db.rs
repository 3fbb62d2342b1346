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

//! User verification and the gated connection pool behind it.
//!
//! The pool is a fixed-size queue of connections; acquisition blocks until
//! one is free and the guard returns it on every exit path. The default
//! store keeps the user table in memory behind the same discipline, and
//! anything that can answer [`UserStore::verify`] can replace it.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

/// Login/registration collaborator consulted by the request parser.
pub trait UserStore: Send + Sync {
    /// For a login, true iff the user exists and the password matches. For
    /// a registration, true iff the user did not exist and was inserted.
    /// Empty name or password always fails.
    fn verify(&self, name: &str, password: &str, is_login: bool) -> bool;
}

/// Fixed-size blocking pool of connections.
#[derive(Debug)]
pub struct ConnPool<C> {
    conns: Mutex<VecDeque<C>>,
    available: Condvar,
}

impl<C> ConnPool<C> {
    /// Builds a pool over the given connections.
    pub fn new(conns: Vec<C>) -> Self {
        Self {
            conns: Mutex::new(conns.into()),
            available: Condvar::new(),
        }
    }

    /// Takes a connection, blocking until one is free. The guard returns
    /// it when dropped.
    pub fn acquire(&self) -> PooledConn<'_, C> {
        let mut conns = self.conns.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(conn) = conns.pop_front() {
                return PooledConn {
                    pool: self,
                    conn: Some(conn),
                };
            }
            conns = self
                .available
                .wait(conns)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of connections currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn release(&self, conn: C) {
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(conn);
        self.available.notify_one();
    }
}

/// Scoped pool acquisition; dropping it releases the connection.
#[derive(Debug)]
pub struct PooledConn<'a, C> {
    pool: &'a ConnPool<C>,
    conn: Option<C>,
}

impl<C> Deref for PooledConn<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("pooled connection already returned")
    }
}

impl<C> DerefMut for PooledConn<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("pooled connection already returned")
    }
}

impl<C> Drop for PooledConn<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// Database settings carried from the command line into the store.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Account name.
    pub user: String,
    /// Account password.
    pub password: String,
    /// Schema holding the user table.
    pub name: String,
    /// Number of pooled connections.
    pub pool_size: usize,
}

/// Handle to the shared user table; one lives in the pool per slot.
#[derive(Debug, Clone)]
struct UserConn {
    table: Arc<RwLock<HashMap<String, String>>>,
}

impl UserConn {
    fn login(&self, name: &str, password: &str) -> bool {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        match table.get(name) {
            Some(stored) if stored == password => {
                info!("login success for {name}");
                true
            }
            Some(_) => {
                info!("password error for {name}");
                false
            }
            None => {
                info!("user {name} does not exist");
                false
            }
        }
    }

    fn register(&self, name: &str, password: &str) -> bool {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.contains_key(name) {
            info!("user {name} already exists");
            return false;
        }
        table.insert(name.to_owned(), password.to_owned());
        info!("registered user {name}");
        true
    }
}

/// In-memory user table served through the connection pool.
#[derive(Debug)]
pub struct UserDb {
    pool: ConnPool<UserConn>,
}

impl UserDb {
    /// Opens the store with `pool_size` pooled connections.
    ///
    /// # Panics
    ///
    /// Panics if the configured pool size is zero.
    pub fn open(config: &DbConfig) -> Self {
        assert!(config.pool_size > 0, "connection pool requires at least one slot");
        info!(
            "user store ready: {}@{}:{}/{}, pool of {}",
            config.user, config.host, config.port, config.name, config.pool_size
        );
        let table = Arc::new(RwLock::new(HashMap::new()));
        let conns = (0..config.pool_size)
            .map(|_| UserConn {
                table: Arc::clone(&table),
            })
            .collect();
        Self {
            pool: ConnPool::new(conns),
        }
    }

    /// Number of idle pooled connections.
    pub fn idle_conns(&self) -> usize {
        self.pool.idle()
    }
}

impl UserStore for UserDb {
    fn verify(&self, name: &str, password: &str, is_login: bool) -> bool {
        if name.is_empty() || password.is_empty() {
            return false;
        }
        debug!("verify name={name} login={is_login}");
        let conn = self.pool.acquire();
        if is_login {
            conn.login(name, password)
        } else {
            conn.register(name, password)
        }
    }
}
