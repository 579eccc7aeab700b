// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::cfg::enums::ServerMode;

const USAGE: &str = "usage: memcached-server-rs [--port N] [--capacity BYTES] \
                     [--mode st_nonblocking|mt_nonblocking|st_coroutine] \
                     [--config PATH]";

/// Command-line overrides. Anything left `None` falls back to the config
/// file (or the built-in defaults when no file is given).
#[derive(Debug, Default)]
pub struct CliArgs {
    pub port: Option<u16>,
    pub capacity: Option<usize>,
    pub mode: Option<ServerMode>,
    pub config: Option<String>,
}

pub fn parse_args<I>(args: I) -> Result<CliArgs>
where I: IntoIterator<Item = String> {
    let mut out = CliArgs::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-p" | "--port" => {
                out.port = Some(
                    next_value(&mut it, "--port")?
                        .parse()
                        .context("invalid --port value")?,
                );
            },
            "-c" | "--capacity" => {
                out.capacity = Some(
                    next_value(&mut it, "--capacity")?
                        .parse()
                        .context("invalid --capacity value")?,
                );
            },
            "-m" | "--mode" => {
                out.mode = Some(next_value(&mut it, "--mode")?.parse()?);
            },
            "--config" => {
                out.config = Some(next_value(&mut it, "--config")?);
            },
            "-h" | "--help" => bail!("{USAGE}"),
            other => bail!("unexpected argument {other:?}\n{USAGE}"),
        }
    }
    Ok(out)
}

fn next_value<I>(it: &mut I, flag: &str) -> Result<String>
where I: Iterator<Item = String> {
    match it.next() {
        Some(v) => Ok(v),
        None => bail!("{flag} requires a value\n{USAGE}"),
    }
}

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}
