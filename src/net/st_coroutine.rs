// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Single-threaded coroutine server.
//!
//! Every connection runs inside a coroutine of the cooperative [`Engine`].
//! The acceptor translates readiness events into pending [`Event`]s on the
//! connection, unblocks the owning coroutine, and drives the engine until
//! all coroutines block again; afterwards it re-arms changed registrations
//! and reaps connections whose coroutine has reached a terminal event.

use std::{cell::RefCell, io, rc::Rc};

use anyhow::Result;
use mio::{Events, Interest, Token};
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::{
    coroutine::{CoroId, Engine},
    net::{
        LISTENER, Server, TOKEN_BASE, WAKER,
        connection::{Connection, Event},
    },
    storage::LruStorage,
};

struct Slot {
    conn: Rc<RefCell<Connection>>,
    coro: CoroId,
}

pub(crate) fn run(mut server: Server) -> Result<()> {
    let storage = Rc::new(RefCell::new(LruStorage::new(server.capacity)));
    let engine = Engine::new();
    let mut conns: Slab<Slot> = Slab::new();
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
                LISTENER => {
                    accept_connections(&mut server, &mut conns, &engine, &storage)
                },
                token => {
                    let key = token.0 - TOKEN_BASE;
                    let Some(slot) = conns.get(key) else {
                        continue;
                    };
                    if event.is_error() {
                        warn!("socket error on connection");
                        slot.conn.borrow_mut().push_event(Event::OnError);
                    } else if event.is_read_closed() {
                        slot.conn.borrow_mut().push_event(Event::Close);
                    } else {
                        if event.is_readable() {
                            slot.conn.borrow_mut().push_event(Event::DoRead);
                        }
                        if event.is_writable() {
                            slot.conn.borrow_mut().push_event(Event::DoWrite);
                        }
                    }
                    engine.unblock(slot.coro);
                    touched.push(key);
                },
            }
        }

        // Let every unblocked coroutine run to its next suspension.
        engine.run_ready();

        for &key in &touched {
            finish_or_rearm(&mut server, &mut conns, &engine, key);
        }
    }

    info!("st_coroutine network service stopped");
    Ok(())
}

/// Body of a connection coroutine: suspend until the acceptor delivers
/// events, then drain them. Terminal events end the coroutine; the acceptor
/// owns deregistration and destruction.
async fn serve_connection(
    conn: Rc<RefCell<Connection>>,
    storage: Rc<RefCell<LruStorage>>,
    engine: Engine,
) {
    loop {
        engine.suspend().await;
        loop {
            let event = conn.borrow_mut().take_event();
            let Some(event) = event else {
                break;
            };
            match event {
                Event::DoRead => {
                    let mut conn = conn.borrow_mut();
                    let mut storage = storage.borrow_mut();
                    conn.on_readable(&mut *storage);
                },
                Event::DoWrite => conn.borrow_mut().on_writable(),
                Event::Close => conn.borrow_mut().close(),
                Event::OnClose => {
                    conn.borrow_mut().on_close();
                    return;
                },
                Event::OnError => {
                    conn.borrow_mut().on_error();
                    return;
                },
            }
        }
    }
}

fn accept_connections(
    server: &mut Server,
    conns: &mut Slab<Slot>,
    engine: &Engine,
    storage: &Rc<RefCell<LruStorage>>,
) {
    loop {
        match server.listener.accept() {
            Ok((socket, peer)) => {
                if let Err(e) = socket.set_nodelay(true) {
                    debug!("failed to disable Nagle on {peer}: {e}");
                }
                let entry = conns.vacant_entry();
                let token = Token(entry.key() + TOKEN_BASE);
                let conn = Rc::new(RefCell::new(Connection::new(socket, peer)));
                conn.borrow_mut().start();
                let registered = server.poll.registry().register(
                    conn.borrow_mut().socket_mut(),
                    token,
                    Interest::READABLE,
                );
                match registered {
                    Ok(()) => {
                        conn.borrow_mut().mark_registered();
                        let coro = engine.spawn(serve_connection(
                            Rc::clone(&conn),
                            Rc::clone(storage),
                            engine.clone(),
                        ));
                        info!("accepted connection from {peer}");
                        entry.insert(Slot { conn, coro });
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

fn finish_or_rearm(
    server: &mut Server,
    conns: &mut Slab<Slot>,
    engine: &Engine,
    key: usize,
) {
    let Some(slot) = conns.get(key) else {
        return;
    };
    let alive = slot.conn.borrow().is_alive();
    if !alive {
        // Deliver the terminal event so the coroutine can unwind, then
        // release the registration and the connection itself.
        if !engine.is_finished(slot.coro) {
            slot.conn.borrow_mut().push_event(Event::OnClose);
            engine.unblock(slot.coro);
            engine.run_ready();
        }
        let slot = conns.remove(key);
        let mut conn = slot.conn.borrow_mut();
        if let Err(e) = server.poll.registry().deregister(conn.socket_mut()) {
            debug!("failed to deregister connection: {e}");
        }
        info!("connection from {} closed", conn.peer());
    } else if slot.conn.borrow().interest_changed() {
        let token = Token(key + TOKEN_BASE);
        let mut conn = slot.conn.borrow_mut();
        let interest = conn.interest();
        match server
            .poll
            .registry()
            .reregister(conn.socket_mut(), token, interest)
        {
            Ok(()) => conn.mark_registered(),
            Err(e) => {
                error!("failed to update registration for {}: {e}", conn.peer());
                drop(conn);
                let slot = conns.remove(key);
                if !engine.is_finished(slot.coro) {
                    slot.conn.borrow_mut().push_event(Event::OnError);
                    engine.unblock(slot.coro);
                    engine.run_ready();
                }
                let mut conn = slot.conn.borrow_mut();
                if let Err(e) = server.poll.registry().deregister(conn.socket_mut()) {
                    debug!("failed to deregister connection: {e}");
                }
            },
        }
    }
}
