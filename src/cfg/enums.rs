// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, str::FromStr};

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Deployment mode of the network front end.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// One thread runs the readiness loop and handles events inline.
    StNonblocking,
    /// The readiness loop dispatches events into the elastic worker pool.
    MtNonblocking,
    /// Each connection runs inside a cooperative coroutine on the acceptor
    /// thread.
    StCoroutine,
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerMode::StNonblocking => "st_nonblocking",
            ServerMode::MtNonblocking => "mt_nonblocking",
            ServerMode::StCoroutine => "st_coroutine",
        };
        f.write_str(name)
    }
}

impl FromStr for ServerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "st_nonblocking" => ServerMode::StNonblocking,
            "mt_nonblocking" => ServerMode::MtNonblocking,
            "st_coroutine" => ServerMode::StCoroutine,
            other => bail!("unknown server mode: {other:?}"),
        })
    }
}
