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

//! Command-line configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::db::DbConfig;

/// A rejected launch argument.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The listen port must be unprivileged.
    #[error("port {0} is outside 1024..=65535")]
    Port(u16),
    /// The worker pool cannot be empty.
    #[error("worker count must be greater than zero")]
    NoWorkers,
    /// The connection pool cannot be empty.
    #[error("connection pool size must be greater than zero")]
    NoPooledConns,
}

/// Launch arguments.
#[derive(Debug, Parser)]
#[command(name = "stoker", version, about = "Edge-triggered HTTP/1.1 reactor server")]
pub struct Config {
    /// Listen port.
    #[arg(long, default_value_t = 1316)]
    pub port: u16,

    /// Idle connection timeout in milliseconds; 0 disables the timer.
    #[arg(long = "timeout", default_value_t = 60_000)]
    pub idle_timeout_ms: u64,

    /// Worker threads draining the task queue.
    #[arg(long, default_value_t = 12)]
    pub workers: usize,

    /// Pooled database connections.
    #[arg(long, default_value_t = 12)]
    pub conn_pool_size: usize,

    /// Database host.
    #[arg(long, default_value = "localhost")]
    pub db_host: String,

    /// Database port.
    #[arg(long, default_value_t = 3306)]
    pub db_port: u16,

    /// Database account name.
    #[arg(long, default_value = "stoker")]
    pub db_user: String,

    /// Database account password.
    #[arg(long, default_value = "")]
    pub db_password: String,

    /// Database schema name.
    #[arg(long, default_value = "stoker")]
    pub db_name: String,

    /// Directory the static site is served from.
    #[arg(long, default_value = "./resources")]
    pub src_dir: PathBuf,

    /// Whether to log at all.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub log_enabled: bool,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, default_value = "debug")]
    pub log_level: String,

    /// Directory the log files are written to.
    #[arg(long, default_value = "./log")]
    pub log_dir: PathBuf,

    /// Log writer queue size; 0 logs synchronously.
    #[arg(long, default_value_t = 1024)]
    pub log_queue_size: usize,

    /// Hard cap on concurrent connections.
    #[arg(long, default_value_t = 65_536)]
    pub max_connections: usize,
}

impl Config {
    /// Rejects argument combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port < 1024 {
            return Err(ConfigError::Port(self.port));
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.conn_pool_size == 0 {
            return Err(ConfigError::NoPooledConns);
        }
        Ok(())
    }

    /// Idle timeout as a duration; `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// The database block, shaped for the store.
    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            host: self.db_host.clone(),
            port: self.db_port,
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            name: self.db_name.clone(),
            pool_size: self.conn_pool_size,
        }
    }
}
