// Copyright 2025-2026 CEMAXECUTER LLC

//! Non-exclusive consumption of the shared sample stream.
//!
//! Each worker thread owns one [`Consumer`]. The upstream source broadcasts
//! reference-counted sample blocks to every consumer; tasks bound to a
//! consumer each keep their own cursor ([`TaskState`]) into the current
//! block, and the consumer only pulls the next block once every bound task
//! has finished the current one. That keeps all inspectors of a worker on
//! the same stream position without copying sample data per task.

use num_complex::Complex32;
use std::sync::Arc;

use crossbeam::channel::Receiver;

/// One broadcast unit of the sample stream.
pub type SampleBlock = Arc<Vec<Complex32>>;

/// A task's cursor into the consumer's block sequence.
#[derive(Debug, Default)]
pub struct TaskState {
    bound: bool,
    seq: u64,
    offset: usize,
    done: bool,
}

impl TaskState {
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Record that `n` samples of the current block were consumed.
    pub fn advance(&mut self, n: usize) {
        self.offset += n;
    }
}

/// Per-worker view of the broadcast sample stream.
pub struct Consumer {
    rx: Receiver<SampleBlock>,
    current: Option<SampleBlock>,
    seq: u64,
    tasks: usize,
    waiting: usize,
}

impl Consumer {
    pub fn new(rx: Receiver<SampleBlock>) -> Self {
        Self {
            rx,
            current: None,
            seq: 0,
            tasks: 0,
            waiting: 0,
        }
    }

    pub fn add_task(&mut self, ts: &mut TaskState) {
        self.tasks += 1;
        ts.bound = true;
        ts.seq = 0;
        ts.offset = 0;
        ts.done = false;
    }

    pub fn remove_task(&mut self, ts: &mut TaskState) {
        if !ts.bound {
            return;
        }
        self.tasks -= 1;
        if ts.done && ts.seq == self.seq {
            self.waiting -= 1;
        }
        ts.bound = false;
    }

    /// Hand the task the samples it has not consumed yet.
    ///
    /// Returns the current block and the task's offset into it; an offset at
    /// the block's end means "nothing new yet, stay scheduled". Returns
    /// `None` only when the stream has ended, which is the signal to drop
    /// the task.
    pub fn assert_samples(&mut self, ts: &mut TaskState) -> Option<(SampleBlock, usize)> {
        if self.current.is_none() {
            self.fetch()?;
        }

        // A task that was bound before the current block arrived (or that
        // just got resynced by a fetch) starts at the block's beginning.
        if ts.seq < self.seq {
            ts.seq = self.seq;
            ts.offset = 0;
            ts.done = false;
        }

        let block = self.current.clone().expect("fetch populated the block");
        if ts.offset < block.len() {
            return Some((block, ts.offset));
        }

        if !ts.done {
            ts.done = true;
            self.waiting += 1;
        }

        if self.waiting >= self.tasks {
            // Every bound task is through the current block
            self.fetch()?;
            let block = self.current.clone().expect("fetch populated the block");
            ts.seq = self.seq;
            ts.offset = 0;
            ts.done = false;
            return Some((block, 0));
        }

        // Peers are still working on this block
        Some((block, ts.offset))
    }

    /// Pull the next block, blocking on the source. `None` means the stream
    /// is disconnected.
    fn fetch(&mut self) -> Option<()> {
        match self.rx.recv() {
            Ok(block) => {
                self.current = Some(block);
                self.seq += 1;
                self.waiting = 0;
                Some(())
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    fn block(len: usize, value: f32) -> SampleBlock {
        Arc::new(vec![Complex32::new(value, 0.0); len])
    }

    #[test]
    fn test_single_task_walks_blocks_in_order() {
        let (tx, rx) = channel::unbounded();
        tx.send(block(4, 1.0)).unwrap();
        tx.send(block(4, 2.0)).unwrap();
        drop(tx);

        let mut consumer = Consumer::new(rx);
        let mut ts = TaskState::default();
        consumer.add_task(&mut ts);

        let (b, off) = consumer.assert_samples(&mut ts).unwrap();
        assert_eq!(off, 0);
        assert_eq!(b[0].re, 1.0);
        ts.advance(b.len());

        let (b, off) = consumer.assert_samples(&mut ts).unwrap();
        assert_eq!(off, 0);
        assert_eq!(b[0].re, 2.0);
        ts.advance(b.len());

        // Stream exhausted
        assert!(consumer.assert_samples(&mut ts).is_none());
    }

    #[test]
    fn test_partial_consumption_resumes_at_offset() {
        let (tx, rx) = channel::unbounded();
        tx.send(block(10, 1.0)).unwrap();
        drop(tx);

        let mut consumer = Consumer::new(rx);
        let mut ts = TaskState::default();
        consumer.add_task(&mut ts);

        let (_, off) = consumer.assert_samples(&mut ts).unwrap();
        assert_eq!(off, 0);
        ts.advance(3);

        let (b, off) = consumer.assert_samples(&mut ts).unwrap();
        assert_eq!(off, 3);
        assert_eq!(b.len(), 10);
    }

    #[test]
    fn test_next_block_waits_for_all_tasks() {
        let (tx, rx) = channel::unbounded();
        tx.send(block(4, 1.0)).unwrap();
        tx.send(block(4, 2.0)).unwrap();
        drop(tx);

        let mut consumer = Consumer::new(rx);
        let mut fast = TaskState::default();
        let mut slow = TaskState::default();
        consumer.add_task(&mut fast);
        consumer.add_task(&mut slow);

        // Fast task finishes the first block
        let (b, _) = consumer.assert_samples(&mut fast).unwrap();
        fast.advance(b.len());

        // Fast asks again: the slow task has not finished, so it gets an
        // empty view of the same block instead of the next one.
        let (b, off) = consumer.assert_samples(&mut fast).unwrap();
        assert_eq!(off, b.len());
        assert_eq!(b[0].re, 1.0);

        // Slow task catches up
        let (b, _) = consumer.assert_samples(&mut slow).unwrap();
        assert_eq!(b[0].re, 1.0);
        slow.advance(b.len());

        // Now either task advances to the next block
        let (b, off) = consumer.assert_samples(&mut slow).unwrap();
        assert_eq!(off, 0);
        assert_eq!(b[0].re, 2.0);

        let (b, off) = consumer.assert_samples(&mut fast).unwrap();
        assert_eq!(off, 0);
        assert_eq!(b[0].re, 2.0);
    }

    #[test]
    fn test_removing_a_lagging_task_unblocks_peers() {
        let (tx, rx) = channel::unbounded();
        tx.send(block(4, 1.0)).unwrap();
        tx.send(block(4, 2.0)).unwrap();
        drop(tx);

        let mut consumer = Consumer::new(rx);
        let mut a = TaskState::default();
        let mut b_ts = TaskState::default();
        consumer.add_task(&mut a);
        consumer.add_task(&mut b_ts);

        let (blk, _) = consumer.assert_samples(&mut a).unwrap();
        a.advance(blk.len());
        let (_, off) = consumer.assert_samples(&mut a).unwrap();
        assert_eq!(off, 4); // stuck behind b

        consumer.remove_task(&mut b_ts);

        let (blk, off) = consumer.assert_samples(&mut a).unwrap();
        assert_eq!(off, 0);
        assert_eq!(blk[0].re, 2.0);
    }

    #[test]
    fn test_late_task_joins_at_current_block_start() {
        let (tx, rx) = channel::unbounded();
        tx.send(block(6, 1.0)).unwrap();
        drop(tx);

        let mut consumer = Consumer::new(rx);
        let mut first = TaskState::default();
        consumer.add_task(&mut first);
        let (_, _) = consumer.assert_samples(&mut first).unwrap();
        first.advance(2);

        let mut late = TaskState::default();
        consumer.add_task(&mut late);
        let (b, off) = consumer.assert_samples(&mut late).unwrap();
        assert_eq!(off, 0);
        assert_eq!(b.len(), 6);
    }
}
