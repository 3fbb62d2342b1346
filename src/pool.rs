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

//! Bounded worker pool draining a single shared task queue.
//!
//! The reactor enqueues one closure per readiness event; workers run them
//! and never outlive the pool. Closing the pool wakes every worker; a
//! worker that observes the closed flag exits without running anything
//! further, so no task executes after close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads sharing one FIFO task queue.
#[derive(Debug)]
pub struct WorkerPool {
    tasks: Option<Sender<Task>>,
    closed: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero or a worker thread cannot be spawned.
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "worker pool requires at least one thread");
        let (tx, rx) = unbounded::<Task>();
        let closed = Arc::new(AtomicBool::new(false));
        let workers = (0..count)
            .map(|i| {
                let rx = rx.clone();
                let closed = Arc::clone(&closed);
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || {
                        // recv errors once the pool drops its sender.
                        while let Ok(task) = rx.recv() {
                            if closed.load(Ordering::Acquire) {
                                break;
                            }
                            task();
                        }
                        debug!("worker {i} exiting");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            tasks: Some(tx),
            closed,
            workers,
        }
    }

    /// Queues `task` and wakes one idle worker. Silently drops the task if
    /// the pool is already closed.
    pub fn add_task<F: FnOnce() + Send + 'static>(&self, task: F) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(tasks) = &self.tasks {
            let _ = tasks.send(Box::new(task));
        }
    }

    /// Marks the pool closed, wakes every worker and joins them. Queued
    /// tasks that have not started are discarded.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.tasks = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}
