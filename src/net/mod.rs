// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Event-driven TCP front end.
//!
//! A single readiness loop ([`mio::Poll`]) owns the listen socket, a wakeup
//! token for shutdown, and one token per connection. Three drivers share
//! that loop and the [`connection::Connection`] state machine:
//!
//! * [`st_nonblocking`] handles readiness inline on the acceptor thread;
//! * [`mt_nonblocking`] hands each readiness event to the elastic worker
//!   pool and re-arms registrations as completions come back;
//! * [`st_coroutine`] runs every connection inside a coroutine of the
//!   cooperative engine and delivers readiness as pending events.

pub mod connection;
pub mod mt_nonblocking;
pub mod st_coroutine;
pub mod st_nonblocking;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use mio::{Interest, Poll, Token, Waker, net::TcpListener};
use tracing::info;

use crate::{
    cfg::{config::Config, enums::ServerMode},
    pool::PoolOptions,
};

pub(crate) const LISTENER: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);
/// Connection tokens start above the reserved ones.
pub(crate) const TOKEN_BASE: usize = 2;

/// Bound listen socket plus the readiness machinery shared by all server
/// modes. [`Server::run`] consumes the server and blocks until a
/// [`ServerHandle::stop`] request drains the loop.
pub struct Server {
    mode: ServerMode,
    capacity: usize,
    pool_opts: PoolOptions,
    listener: TcpListener,
    poll: Poll,
    waker: Arc<Waker>,
    stop_requested: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl Server {
    pub fn bind(cfg: &Config) -> Result<Self> {
        ignore_sigpipe();

        let mut listener = TcpListener::bind(cfg.server.listen)
            .with_context(|| format!("failed to bind {}", cfg.server.listen))?;
        let poll = Poll::new().context("failed to create poll instance")?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER).context("failed to create wakeup token")?,
        );
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("failed to register listen socket")?;
        let addr = listener
            .local_addr()
            .context("failed to read bound address")?;

        Ok(Self {
            mode: cfg.server.mode,
            capacity: cfg.storage.max_size,
            pool_opts: cfg.pool.options(),
            listener,
            poll,
            waker,
            stop_requested: Arc::new(AtomicBool::new(false)),
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            waker: Arc::clone(&self.waker),
            stop_requested: Arc::clone(&self.stop_requested),
        }
    }

    /// Drives the acceptor loop of the configured mode until stopped.
    pub fn run(self) -> Result<()> {
        info!("start {} network service on {}", self.mode, self.addr);
        match self.mode {
            ServerMode::StNonblocking => st_nonblocking::run(self),
            ServerMode::MtNonblocking => mt_nonblocking::run(self),
            ServerMode::StCoroutine => st_coroutine::run(self),
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Cross-thread stop switch for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    waker: Arc<Waker>,
    stop_requested: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Asks the acceptor to leave its loop after the current batch of
    /// events and release every connection.
    pub fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.waker.wake().context("failed to wake the acceptor")
    }
}

/// Writes to dead sockets must surface as `EPIPE`, not kill the process.
fn ignore_sigpipe() {
    // SAFETY: SIG_IGN carries no handler code; the call only flips the
    // process-wide disposition.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
