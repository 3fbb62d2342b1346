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

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use stoker::config::Config;
use stoker::db::UserDb;
use stoker::logging;
use stoker::server::Server;

fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.validate().context("invalid launch arguments")?;
    let _log_guard = logging::init(
        config.log_enabled,
        &config.log_level,
        config.log_dir.clone(),
        config.log_queue_size,
    )
    .context("logging setup failed")?;

    let store = Arc::new(UserDb::open(&config.db_config()));
    let mut server = Server::bind(&config, store).context("server startup failed")?;
    server.run();
    Ok(())
}
