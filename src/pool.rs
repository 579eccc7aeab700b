// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Elastic worker pool.
//!
//! The pool keeps between `low_watermark` and `high_watermark` OS threads:
//! it starts with `low_watermark`, grows by one when a task is enqueued and
//! no idle worker is guaranteed to pick it up, and shrinks a worker that
//! sat idle for `idle_timeout` while the pool is above the floor. The task
//! queue is FIFO and bounded by `max_queue`; tasks run outside the pool
//! mutex.
//!
//! A task that panics is a programming error: the worker logs it and
//! terminates the process, since the pool cannot reason about a
//! half-executed task of unknown type.

use std::{collections::VecDeque, sync::Arc, thread, time::Duration};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Pool sizing, immutable after construction.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Steady-state floor of worker threads.
    pub low_watermark: usize,
    /// Burst ceiling of worker threads.
    pub high_watermark: usize,
    /// Maximum number of queued tasks before `execute` rejects.
    pub max_queue: usize,
    /// How long a worker above the floor may sit idle before it exits.
    pub idle_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            low_watermark: 2,
            high_watermark: 8,
            max_queue: 64,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Running,
    Stopping,
}

struct Inner {
    state: State,
    tasks: VecDeque<Task>,
    threads_total: usize,
    threads_idle: usize,
}

struct Shared {
    opts: PoolOptions,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    all_stopped: Condvar,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn new(opts: PoolOptions) -> Self {
        debug_assert!(opts.low_watermark <= opts.high_watermark);
        debug_assert!(opts.max_queue >= 1);
        Self {
            shared: Arc::new(Shared {
                opts,
                inner: Mutex::new(Inner {
                    state: State::Stopped,
                    tasks: VecDeque::new(),
                    threads_total: 0,
                    threads_idle: 0,
                }),
                not_empty: Condvar::new(),
                all_stopped: Condvar::new(),
            }),
        }
    }

    /// Brings the pool to `Running` with exactly `low_watermark` workers.
    /// Waits out a concurrent shutdown first; a no-op when already running.
    pub fn start(&self) {
        let mut inner = self.shared.inner.lock();
        while inner.state == State::Stopping {
            self.shared.all_stopped.wait(&mut inner);
        }
        if inner.state == State::Running {
            return;
        }
        inner.state = State::Running;
        inner.threads_total = self.shared.opts.low_watermark;
        inner.threads_idle = self.shared.opts.low_watermark;
        drop(inner);
        for _ in 0..self.shared.opts.low_watermark {
            spawn_worker(&self.shared);
        }
    }

    /// Schedules `task` for execution. Returns `false` when the pool is not
    /// running or the queue is already at `max_queue`; the task is dropped
    /// in that case.
    pub fn execute<F>(&self, task: F) -> bool
    where F: FnOnce() + Send + 'static {
        let mut inner = self.shared.inner.lock();
        if inner.state != State::Running || inner.tasks.len() >= self.shared.opts.max_queue
        {
            return false;
        }
        inner.tasks.push_back(Box::new(task));
        if inner.threads_idle >= inner.tasks.len() {
            // An idle worker is already guaranteed to pick this task up.
            self.shared.not_empty.notify_one();
        } else if inner.threads_total < self.shared.opts.high_watermark {
            inner.threads_total += 1;
            inner.threads_idle += 1;
            drop(inner);
            spawn_worker(&self.shared);
            self.shared.not_empty.notify_one();
        }
        true
    }

    /// Stops accepting tasks and asks every worker to exit once the queue
    /// drains. With `await_done` the call blocks until the last worker has
    /// left.
    pub fn stop(&self, await_done: bool) {
        let mut inner = self.shared.inner.lock();
        if inner.state == State::Running {
            if inner.threads_total > 0 {
                inner.state = State::Stopping;
                self.shared.not_empty.notify_all();
            } else {
                inner.state = State::Stopped;
                self.shared.all_stopped.notify_all();
            }
        }
        if await_done {
            while inner.state != State::Stopped {
                self.shared.all_stopped.wait(&mut inner);
            }
        }
    }

    pub fn threads_total(&self) -> usize {
        self.shared.inner.lock().threads_total
    }

    pub fn threads_idle(&self) -> usize {
        self.shared.inner.lock().threads_idle
    }

    pub fn queue_len(&self) -> usize {
        self.shared.inner.lock().tasks.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn spawn_worker(shared: &Arc<Shared>) {
    let cloned = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name("kv-pool-worker".to_string())
        .spawn(move || worker_loop(cloned));
    if let Err(e) = spawned {
        error!("failed to spawn pool worker: {e}");
        let mut inner = shared.inner.lock();
        inner.threads_total -= 1;
        inner.threads_idle -= 1;
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut inner = shared.inner.lock();
    loop {
        if inner.tasks.is_empty() {
            if inner.state == State::Stopping {
                break;
            }
            let timed_out = shared
                .not_empty
                .wait_for(&mut inner, shared.opts.idle_timeout)
                .timed_out();
            if inner.tasks.is_empty() {
                if inner.state == State::Stopping {
                    break;
                }
                if timed_out && inner.threads_total > shared.opts.low_watermark {
                    debug!("idle worker leaving the pool");
                    break;
                }
                continue;
            }
        }
        let Some(task) = inner.tasks.pop_front() else {
            continue;
        };
        inner.threads_idle -= 1;
        drop(inner);
        run_task(task);
        inner = shared.inner.lock();
        inner.threads_idle += 1;
    }
    // Each worker accounts for exactly one total and one idle slot, released
    // exactly once on every exit path.
    inner.threads_total -= 1;
    inner.threads_idle -= 1;
    if inner.threads_total == 0 && inner.state == State::Stopping {
        inner.state = State::Stopped;
        shared.all_stopped.notify_all();
    }
}

fn run_task(task: Task) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
        error!("pool task panicked, terminating the process");
        std::process::abort();
    }
}
