// Copyright 2025-2026 CEMAXECUTER LLC

//! Worker pool running inspector tasks.
//!
//! Each worker thread owns a [`Consumer`] and a local ring of tasks. A task
//! callback returning true is rescheduled behind its peers; returning false
//! drops it. New tasks arrive over a channel so the analyzer thread never
//! touches worker state directly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};

use crate::consumer::{Consumer, SampleBlock};
use crate::mq::Mq;

/// Everything a task callback may touch during one pass.
pub struct WorkerContext<'a> {
    pub mq_out: &'a Arc<Mq>,
    pub consumer: &'a mut Consumer,
}

/// A schedulable unit. `process` returns whether the task wants to run
/// again.
pub trait WorkerTask: Send {
    fn process(&mut self, ctx: &mut WorkerContext<'_>) -> bool;
}

struct Worker {
    tx: Sender<Box<dyn WorkerTask>>,
    thread: JoinHandle<()>,
}

/// Fixed set of worker threads, one per sample-stream subscription.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn one worker per receiver in `sample_rxs`.
    pub fn new(mq_out: &Arc<Mq>, sample_rxs: Vec<Receiver<SampleBlock>>) -> Result<Self, String> {
        let mut workers = Vec::with_capacity(sample_rxs.len());

        for (index, sample_rx) in sample_rxs.into_iter().enumerate() {
            let (tx, task_rx) = channel::unbounded::<Box<dyn WorkerTask>>();
            let mq_out = Arc::clone(mq_out);

            let thread = std::thread::Builder::new()
                .name(format!("rk-worker-{}", index))
                .spawn(move || worker_main(task_rx, sample_rx, mq_out))
                .map_err(|e| format!("failed to spawn worker {}: {}", index, e))?;

            workers.push(Worker { tx, thread });
        }

        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Queue a task on worker `index`.
    pub fn push(&self, index: usize, task: Box<dyn WorkerTask>) -> Result<(), String> {
        let worker = self
            .workers
            .get(index)
            .ok_or_else(|| format!("no such worker: {}", index))?;
        worker
            .tx
            .send(task)
            .map_err(|_| format!("worker {} is gone", index))
    }

    /// Close the task inlets and wait for every worker to drain and exit.
    pub fn halt(self) {
        for worker in self.workers {
            drop(worker.tx);
            if worker.thread.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}

fn worker_main(
    task_rx: Receiver<Box<dyn WorkerTask>>,
    sample_rx: Receiver<SampleBlock>,
    mq_out: Arc<Mq>,
) {
    let mut consumer = Consumer::new(sample_rx);
    let mut tasks: VecDeque<Box<dyn WorkerTask>> = VecDeque::new();

    loop {
        // Pick up newly assigned tasks without blocking the ring
        while let Ok(task) = task_rx.try_recv() {
            tasks.push_back(task);
        }

        match tasks.pop_front() {
            Some(mut task) => {
                let mut ctx = WorkerContext {
                    mq_out: &mq_out,
                    consumer: &mut consumer,
                };
                if task.process(&mut ctx) {
                    tasks.push_back(task);
                }
            }
            None => match task_rx.recv() {
                Ok(task) => tasks.push_back(task),
                // Inlet closed and nothing left to run
                Err(_) => break,
            },
        }
    }
}
