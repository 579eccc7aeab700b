// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Multi-threaded non-blocking server.
//!
//! The acceptor thread owns the poll loop and connection registry; every
//! readiness event becomes a task on the elastic worker pool. A
//! per-connection mutex serialises the state machine across workers, and a
//! single storage mutex serialises cache access. When a worker finishes it
//! reports the connection's token over a channel and wakes the acceptor,
//! which re-arms the changed registration or reaps the dead connection.

use std::{io, sync::Arc};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::{Events, Interest, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::{
    net::{LISTENER, Server, TOKEN_BASE, WAKER, connection::Connection},
    pool::ThreadPool,
    storage::LruStorage,
};

pub(crate) fn run(mut server: Server) -> Result<()> {
    let storage = Arc::new(Mutex::new(LruStorage::new(server.capacity)));
    let pool = ThreadPool::new(server.pool_opts.clone());
    pool.start();

    let (done_tx, done_rx): (Sender<usize>, Receiver<usize>) = unbounded();
    let mut conns: Slab<Arc<Mutex<Connection>>> = Slab::new();
    let mut events = Events::with_capacity(128);
    let mut running = true;

    while running {
        if let Err(e) = server.poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            pool.stop(true);
            return Err(e.into());
        }

        let mut finished: Vec<usize> = Vec::new();
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
                    let Some(entry) = conns.get(key) else {
                        continue;
                    };
                    let is_error = event.is_error();
                    let read_closed = event.is_read_closed();
                    let readable = event.is_readable();
                    let writable = event.is_writable();

                    let task_conn = Arc::clone(entry);
                    let task_storage = Arc::clone(&storage);
                    let task_done = done_tx.clone();
                    let task_waker = Arc::clone(&server.waker);
                    let dispatched = pool.execute(move || {
                        handle_event(
                            &task_conn,
                            &task_storage,
                            is_error,
                            read_closed,
                            readable,
                            writable,
                        );
                        let _ = task_done.send(key);
                        wake(&task_waker);
                    });
                    if !dispatched {
                        // Queue full or pool not running: fall back to the
                        // acceptor thread so the event is not lost.
                        warn!("worker pool saturated, handling event inline");
                        if let Some(entry) = conns.get(key) {
                            handle_event(
                                entry, &storage, is_error, read_closed, readable,
                                writable,
                            );
                            finished.push(key);
                        }
                    }
                },
            }
        }

        for key in finished.drain(..).chain(done_rx.try_iter()) {
            rearm_or_reap(&server, &mut conns, key);
        }
    }

    pool.stop(true);
    info!("mt_nonblocking network service stopped");
    Ok(())
}

fn wake(waker: &Waker) {
    if let Err(e) = waker.wake() {
        warn!("failed to wake acceptor: {e}");
    }
}

/// Runs on a pool worker (or inline when the pool rejects the task). The
/// connection mutex serialises the state machine; the storage mutex is held
/// for the read-side command loop only.
fn handle_event(
    conn: &Mutex<Connection>,
    storage: &Mutex<LruStorage>,
    is_error: bool,
    read_closed: bool,
    readable: bool,
    writable: bool,
) {
    let mut conn = conn.lock();
    if is_error {
        warn!("socket error on connection from {}", conn.peer());
        conn.on_error();
        return;
    }
    if read_closed {
        conn.close();
        return;
    }
    if readable && conn.is_alive() {
        let mut storage = storage.lock();
        conn.on_readable(&mut *storage);
    }
    if writable && conn.is_alive() {
        conn.on_writable();
    }
}

fn accept_connections(server: &mut Server, conns: &mut Slab<Arc<Mutex<Connection>>>) {
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
                        entry.insert(Arc::new(Mutex::new(conn)));
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

fn rearm_or_reap(
    server: &Server,
    conns: &mut Slab<Arc<Mutex<Connection>>>,
    key: usize,
) {
    let Some(entry) = conns.get(key) else {
        return;
    };
    let mut conn = entry.lock();
    if !conn.is_alive() {
        conn.on_close();
        if let Err(e) = server.poll.registry().deregister(conn.socket_mut()) {
            debug!("failed to deregister connection: {e}");
        }
        info!("connection from {} closed", conn.peer());
        drop(conn);
        conns.remove(key);
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
                drop(conn);
                conns.remove(key);
            },
        }
    }
}
