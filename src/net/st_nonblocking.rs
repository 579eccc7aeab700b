// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Single-threaded non-blocking server: readiness events are handled inline
//! on the acceptor thread, so the storage needs no synchronisation at all.

use std::io;

use anyhow::Result;
use mio::{Events, Interest, Token};
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::{
    net::{LISTENER, Server, TOKEN_BASE, WAKER, connection::Connection},
    storage::LruStorage,
};

pub(crate) fn run(mut server: Server) -> Result<()> {
    let mut storage = LruStorage::new(server.capacity);
    let mut conns: Slab<Connection> = Slab::new();
    let mut events = Events::with_capacity(128);
    let mut running = true;

    while running {
        if let Err(e) = server.poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }

        let mut touched: Vec<usize> = Vec::new();
        for event in events.iter() {
            match event.token() {
                WAKER => {
                    if server.stop_requested() {
                        debug!("stop requested, draining acceptor");
                        running = false;
                    }
                },
                LISTENER => accept_connections(&mut server, &mut conns),
                token => {
                    let key = token.0 - TOKEN_BASE;
                    let Some(conn) = conns.get_mut(key) else {
                        continue;
                    };
                    if event.is_error() {
                        warn!("socket error on connection from {}", conn.peer());
                        conn.on_error();
                    } else if event.is_read_closed() {
                        conn.close();
                    } else {
                        if event.is_readable() && conn.is_alive() {
                            conn.on_readable(&mut storage);
                        }
                        if event.is_writable() && conn.is_alive() {
                            conn.on_writable();
                        }
                    }
                    touched.push(key);
                },
            }
        }

        for &key in &touched {
            rearm_or_reap(&mut server, &mut conns, key);
        }
    }

    info!("st_nonblocking network service stopped");
    Ok(())
}

fn accept_connections(server: &mut Server, conns: &mut Slab<Connection>) {
    loop {
        match server.listener.accept() {
            Ok((socket, peer)) => {
                if let Err(e) = socket.set_nodelay(true) {
                    debug!("failed to disable Nagle on {peer}: {e}");
                }
                let entry = conns.vacant_entry();
                let token = Token(entry.key() + TOKEN_BASE);
                let mut conn = Connection::new(socket, peer);
                conn.start();
                match server
                    .poll
                    .registry()
                    .register(conn.socket_mut(), token, Interest::READABLE)
                {
                    Ok(()) => {
                        conn.mark_registered();
                        info!("accepted connection from {peer}");
                        entry.insert(conn);
                    },
                    Err(e) => {
                        error!("failed to register connection from {peer}: {e}");
                    },
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("accept failed: {e}");
                break;
            },
        }
    }
}

fn rearm_or_reap(server: &mut Server, conns: &mut Slab<Connection>, key: usize) {
    let Some(conn) = conns.get_mut(key) else {
        return;
    };
    if !conn.is_alive() {
        conn.on_close();
        if let Err(e) = server.poll.registry().deregister(conn.socket_mut()) {
            debug!("failed to deregister connection: {e}");
        }
        let conn = conns.remove(key);
        info!("connection from {} closed", conn.peer());
    } else if conn.interest_changed() {
        let token = Token(key + TOKEN_BASE);
        let interest = conn.interest();
        match server
            .poll
            .registry()
            .reregister(conn.socket_mut(), token, interest)
        {
            Ok(()) => conn.mark_registered(),
            Err(e) => {
                error!("failed to update registration for {}: {e}", conn.peer());
                conn.on_error();
                if let Err(e) = server.poll.registry().deregister(conn.socket_mut()) {
                    debug!("failed to deregister connection: {e}");
                }
                conns.remove(key);
            },
        }
    }
}
