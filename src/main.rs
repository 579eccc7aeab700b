// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use memcached_server_rs::{
    cfg::{
        cli::{parse_args, resolve_config_path},
        config::Config,
        logger::init_logger,
    },
    net::Server,
};
use tracing::info;

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let mut cfg = match &args.config {
        Some(path) => resolve_config_path(path)
            .and_then(Config::load_from_file)
            .context("failed to resolve or load config")?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        cfg.server.listen.set_port(port);
    }
    if let Some(capacity) = args.capacity {
        cfg.storage.max_size = capacity;
    }
    if let Some(mode) = args.mode {
        cfg.server.mode = mode;
    }
    cfg.validate_and_normalize()?;

    let _logger_guard = init_logger(&cfg.logger)?;
    info!(
        "cache capacity {} bytes, {} mode",
        cfg.storage.max_size, cfg.server.mode
    );

    let server = Server::bind(&cfg)?;
    info!("listening on {}", server.local_addr());
    server.run()
}
