// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Single-threaded cooperative coroutine engine.
//!
//! Coroutines are stackless state machines (`Pin<Box<dyn Future>>`) owned by
//! the engine; suspension points are awaits on the engine's own futures, so
//! a coroutine observes exactly the local state it had at suspension when it
//! resumes. Every coroutine is in exactly one of two sets at any time:
//! `alive` (runnable, possibly queued) or `blocked` (waiting for an explicit
//! [`Engine::unblock`]). Finished coroutines leave the engine entirely.
//!
//! The engine is `!Send` and must only be driven from the thread that owns
//! it; the coroutine server mode drives it from the acceptor thread after
//! each batch of readiness events.

use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use slab::Slab;

/// Handle of a spawned coroutine. Stays valid until the coroutine finishes.
pub type CoroId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoroState {
    Alive,
    Blocked,
}

struct Coroutine {
    /// Taken out while the coroutine is being polled.
    future: Option<Pin<Box<dyn Future<Output = ()>>>>,
    state: CoroState,
    /// Guards against duplicate entries in the run queue.
    queued: bool,
}

struct Inner {
    tasks: Slab<Coroutine>,
    run_queue: VecDeque<CoroId>,
    /// Coroutine currently being polled, if any.
    current: Option<CoroId>,
}

/// Cheaply clonable handle to the scheduler state; coroutine bodies hold a
/// clone to reach [`Engine::suspend`] and [`Engine::yield_now`].
#[derive(Clone)]
pub struct Engine {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                tasks: Slab::new(),
                run_queue: VecDeque::new(),
                current: None,
            })),
        }
    }

    /// Creates a coroutine in the `alive` set, scheduled to run at the next
    /// [`Engine::run_ready`].
    pub fn spawn<F>(&self, future: F) -> CoroId
    where F: Future<Output = ()> + 'static {
        let mut inner = self.inner.borrow_mut();
        let id = inner.tasks.insert(Coroutine {
            future: Some(Box::pin(future)),
            state: CoroState::Alive,
            queued: true,
        });
        inner.run_queue.push_back(id);
        id
    }

    /// Moves a coroutine into the `blocked` set. A blocked coroutine is not
    /// polled until [`Engine::unblock`] returns it to `alive`.
    pub fn block(&self, id: CoroId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(task) = inner.tasks.get_mut(id) {
            task.state = CoroState::Blocked;
        }
    }

    /// Returns a coroutine from `blocked` to `alive` and schedules it.
    /// A no-op for coroutines that are already alive or have finished.
    pub fn unblock(&self, id: CoroId) {
        let mut inner = self.inner.borrow_mut();
        let Some(task) = inner.tasks.get_mut(id) else {
            return;
        };
        if task.state == CoroState::Blocked {
            task.state = CoroState::Alive;
            if !task.queued {
                task.queued = true;
                inner.run_queue.push_back(id);
            }
        }
    }

    /// Moves a runnable coroutine to the front of the run queue so it is
    /// polled next. A no-op for the current coroutine and for blocked or
    /// finished ones.
    pub fn sched(&self, id: CoroId) {
        let mut inner = self.inner.borrow_mut();
        if inner.current == Some(id) {
            return;
        }
        let was_queued = match inner.tasks.get_mut(id) {
            Some(task) if task.state == CoroState::Alive => {
                let was_queued = task.queued;
                task.queued = true;
                was_queued
            },
            _ => return,
        };
        if was_queued
            && let Some(pos) = inner.run_queue.iter().position(|&q| q == id)
        {
            inner.run_queue.remove(pos);
        }
        inner.run_queue.push_front(id);
    }

    /// Suspends the calling coroutine into the `blocked` set until someone
    /// unblocks it. Must be awaited from inside a coroutine body.
    pub fn suspend(&self) -> Suspend {
        Suspend {
            engine: self.clone(),
            parked: false,
        }
    }

    /// Requeues the calling coroutine behind the other runnable ones and
    /// yields to the scheduler.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow {
            engine: self.clone(),
            yielded: false,
        }
    }

    /// Polls runnable coroutines until every remaining one is blocked or the
    /// engine is empty. Finished coroutines are removed.
    pub fn run_ready(&self) {
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                let mut picked = None;
                while let Some(id) = inner.run_queue.pop_front() {
                    let Some(task) = inner.tasks.get_mut(id) else {
                        continue;
                    };
                    task.queued = false;
                    if task.state != CoroState::Alive {
                        continue;
                    }
                    let Some(future) = task.future.take() else {
                        continue;
                    };
                    inner.current = Some(id);
                    picked = Some((id, future));
                    break;
                }
                picked
            };
            let Some((id, mut future)) = next else {
                return;
            };

            let mut cx = Context::from_waker(Waker::noop());
            let poll = future.as_mut().poll(&mut cx);

            let mut inner = self.inner.borrow_mut();
            inner.current = None;
            match poll {
                Poll::Ready(()) => {
                    inner.tasks.remove(id);
                },
                Poll::Pending => {
                    if let Some(task) = inner.tasks.get_mut(id) {
                        task.future = Some(future);
                        if task.state == CoroState::Alive && !task.queued {
                            task.queued = true;
                            inner.run_queue.push_back(id);
                        }
                    }
                },
            }
        }
    }

    pub fn is_alive(&self, id: CoroId) -> bool {
        self.inner
            .borrow()
            .tasks
            .get(id)
            .is_some_and(|t| t.state == CoroState::Alive)
    }

    pub fn is_blocked(&self, id: CoroId) -> bool {
        self.inner
            .borrow()
            .tasks
            .get(id)
            .is_some_and(|t| t.state == CoroState::Blocked)
    }

    pub fn is_finished(&self, id: CoroId) -> bool {
        !self.inner.borrow().tasks.contains(id)
    }

    pub fn alive_count(&self) -> usize {
        self.inner
            .borrow()
            .tasks
            .iter()
            .filter(|(_, t)| t.state == CoroState::Alive)
            .count()
    }

    pub fn blocked_count(&self) -> usize {
        self.inner
            .borrow()
            .tasks
            .iter()
            .filter(|(_, t)| t.state == CoroState::Blocked)
            .count()
    }
}

/// Future returned by [`Engine::suspend`].
pub struct Suspend {
    engine: Engine,
    parked: bool,
}

impl Future for Suspend {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.parked {
            return Poll::Ready(());
        }
        this.parked = true;
        let mut inner = this.engine.inner.borrow_mut();
        if let Some(id) = inner.current
            && let Some(task) = inner.tasks.get_mut(id)
        {
            task.state = CoroState::Blocked;
        }
        Poll::Pending
    }
}

/// Future returned by [`Engine::yield_now`].
pub struct YieldNow {
    engine: Engine,
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        this.yielded = true;
        let mut inner = this.engine.inner.borrow_mut();
        if let Some(id) = inner.current
            && let Some(task) = inner.tasks.get_mut(id)
            && !task.queued
        {
            task.queued = true;
            inner.run_queue.push_back(id);
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_spawned_coroutines_run_in_fifo_order() {
        let engine = Engine::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..3 {
            let log = Rc::clone(&log);
            let eng = engine.clone();
            engine.spawn(async move {
                log.borrow_mut().push((tag, 0));
                eng.yield_now().await;
                log.borrow_mut().push((tag, 1));
            });
        }
        engine.run_ready();
        assert_eq!(
            *log.borrow(),
            vec![(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]
        );
        assert_eq!(engine.alive_count(), 0);
    }

    #[test]
    fn test_suspend_preserves_locals_across_resumptions() {
        let engine = Engine::new();
        let observed = Rc::new(Cell::new(0));
        let result = Rc::clone(&observed);
        let eng = engine.clone();
        let id = engine.spawn(async move {
            let mut local = 1;
            eng.suspend().await;
            local += 10;
            eng.suspend().await;
            local += 100;
            result.set(local);
        });

        engine.run_ready();
        assert!(engine.is_blocked(id));
        assert_eq!(observed.get(), 0);

        engine.unblock(id);
        engine.run_ready();
        assert!(engine.is_blocked(id));

        engine.unblock(id);
        engine.run_ready();
        assert!(engine.is_finished(id));
        assert_eq!(observed.get(), 111);
    }

    #[test]
    fn test_coroutine_is_in_exactly_one_set() {
        let engine = Engine::new();
        let eng = engine.clone();
        let id = engine.spawn(async move {
            eng.suspend().await;
        });
        assert!(engine.is_alive(id));
        assert!(!engine.is_blocked(id));

        engine.run_ready();
        assert!(!engine.is_alive(id));
        assert!(engine.is_blocked(id));

        engine.unblock(id);
        assert!(engine.is_alive(id));
        assert!(!engine.is_blocked(id));

        engine.run_ready();
        assert!(engine.is_finished(id));
        assert!(!engine.is_alive(id));
        assert!(!engine.is_blocked(id));
    }

    #[test]
    fn test_unblock_is_idempotent() {
        let engine = Engine::new();
        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);
        let eng = engine.clone();
        let id = engine.spawn(async move {
            counter.set(counter.get() + 1);
            eng.suspend().await;
            counter.set(counter.get() + 1);
            eng.suspend().await;
        });
        engine.run_ready();
        assert_eq!(runs.get(), 1);

        // Two unblocks must produce exactly one resumption.
        engine.unblock(id);
        engine.unblock(id);
        engine.run_ready();
        assert_eq!(runs.get(), 2);
        assert!(engine.is_blocked(id));

        // Unblocking an alive coroutine is a no-op.
        engine.unblock(id);
        engine.unblock(id);
        assert!(engine.is_alive(id));
    }

    #[test]
    fn test_external_block_keeps_coroutine_parked() {
        let engine = Engine::new();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let id = engine.spawn(async move {
            flag.set(true);
        });
        engine.block(id);
        engine.run_ready();
        assert!(!ran.get());
        assert!(engine.is_blocked(id));

        engine.unblock(id);
        engine.run_ready();
        assert!(ran.get());
        assert!(engine.is_finished(id));
    }

    #[test]
    fn test_sched_moves_coroutine_to_front() {
        let engine = Engine::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_a = Rc::clone(&log);
        let log_b = Rc::clone(&log);
        let _a = engine.spawn(async move {
            log_a.borrow_mut().push('a');
        });
        let b = engine.spawn(async move {
            log_b.borrow_mut().push('b');
        });

        engine.sched(b);
        engine.run_ready();
        assert_eq!(*log.borrow(), vec!['b', 'a']);
    }
}
