// Copyright 2025-2026 CEMAXECUTER LLC

//! Blocking message queue with urgent-push and typed reads.
//!
//! A mutex-guarded FIFO with a single broadcast condition variable. Urgent
//! writes jump to the front of the queue; typed reads pull the first message
//! of the requested type and leave everything else in order. The broadcast
//! on every push is deliberate: readers with different type filters all have
//! to re-check after any write.
//!
//! Message headers (the boxes the queue stores) are recycled through a
//! process-wide pool so steady-state traffic does not hit the allocator.
//! Payloads are never pooled; ownership of the payload moves to the queue on
//! write and to the reader on read.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::msg::{Message, MsgType};

/// Freelist cap: headers beyond this go back to the allocator.
const MSG_POOL_MAX: usize = 1024;
/// Peak-size modulus at which the pool logs a growth warning.
const MSG_POOL_WARNING_THRESHOLD: usize = 256;

mod pool {
    use super::{MSG_POOL_MAX, MSG_POOL_WARNING_THRESHOLD};
    use crate::msg::Message;
    use std::sync::Mutex;

    struct MsgPool {
        free: Vec<Box<Message>>,
        peak: usize,
    }

    static MSG_POOL: Mutex<MsgPool> = Mutex::new(MsgPool {
        free: Vec::new(),
        peak: 0,
    });

    /// Wrap a payload in a header, reusing a pooled box when one is free.
    pub fn fetch(msg: Message) -> Box<Message> {
        let recycled = MSG_POOL.lock().unwrap().free.pop();
        match recycled {
            Some(mut header) => {
                *header = msg;
                header
            }
            None => Box::new(msg),
        }
    }

    /// Take the payload out of a header and return the header to the pool.
    pub fn recycle(mut header: Box<Message>) -> Message {
        let msg = std::mem::replace(&mut *header, Message::Halt);

        let mut warn_peak = None;
        {
            let mut pool = MSG_POOL.lock().unwrap();
            if pool.free.len() < MSG_POOL_MAX {
                pool.free.push(header);
                if pool.free.len() > pool.peak {
                    pool.peak = pool.free.len();
                    if pool.peak % MSG_POOL_WARNING_THRESHOLD == 0 {
                        warn_peak = Some(pool.peak);
                    }
                }
            }
            // At the cap the header simply drops back to the allocator.
        }

        // Never log while holding the pool lock.
        if let Some(peak) = warn_peak {
            log::warn!("message pool freelist grew to {} headers", peak);
        }

        msg
    }

    #[cfg(test)]
    pub fn stats() -> (usize, usize) {
        let pool = MSG_POOL.lock().unwrap();
        (pool.free.len(), pool.peak)
    }
}

/// Bounded-by-convention FIFO of [`Message`]s shared between threads.
pub struct Mq {
    queue: Mutex<VecDeque<Box<Message>>>,
    cond: Condvar,
}

impl Default for Mq {
    fn default() -> Self {
        Self::new()
    }
}

impl Mq {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Append a message and wake every waiter.
    pub fn write(&self, msg: Message) {
        let header = pool::fetch(msg);
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(header);
        self.cond.notify_all();
    }

    /// Prepend a message so it overtakes everything already queued.
    /// Concurrent urgent writes come out newest-first.
    pub fn write_urgent(&self, msg: Message) {
        let header = pool::fetch(msg);
        let mut queue = self.queue.lock().unwrap();
        queue.push_front(header);
        self.cond.notify_all();
    }

    /// Block until any message is available and pop the head.
    pub fn read(&self) -> Message {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(header) = queue.pop_front() {
                return pool::recycle(header);
            }
            queue = self.cond.wait(queue).unwrap();
        }
    }

    /// Block until a message of exactly `ty` is available and pop the first
    /// such message, preserving the relative order of the rest.
    pub fn read_w_type(&self, ty: MsgType) -> Message {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(idx) = queue.iter().position(|m| m.msg_type() == ty) {
                let header = queue.remove(idx).expect("index just found");
                return pool::recycle(header);
            }
            queue = self.cond.wait(queue).unwrap();
        }
    }

    /// Non-blocking [`read`](Self::read).
    pub fn poll(&self) -> Option<Message> {
        let mut queue = self.queue.lock().unwrap();
        queue.pop_front().map(pool::recycle)
    }

    /// Non-blocking [`read_w_type`](Self::read_w_type).
    pub fn poll_w_type(&self, ty: MsgType) -> Option<Message> {
        let mut queue = self.queue.lock().unwrap();
        let idx = queue.iter().position(|m| m.msg_type() == ty)?;
        queue.remove(idx).map(pool::recycle)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

impl Drop for Mq {
    fn drop(&mut self) {
        // Drain leftovers so their headers make it back to the pool.
        let mut queue = self.queue.lock().unwrap();
        while let Some(header) = queue.pop_front() {
            let _ = pool::recycle(header);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::SampleBatchMsg;
    use std::sync::Arc;

    fn batch(id: u32) -> Message {
        Message::Samples(SampleBatchMsg::new(id))
    }

    fn batch_id(msg: Message) -> u32 {
        match msg {
            Message::Samples(b) => b.inspector_id,
            other => panic!("expected samples message, got {:?}", other),
        }
    }

    #[test]
    fn test_fifo_order() {
        let mq = Mq::new();
        for id in 0..8 {
            mq.write(batch(id));
        }
        for id in 0..8 {
            assert_eq!(batch_id(mq.read()), id);
        }
        assert!(mq.is_empty());
    }

    #[test]
    fn test_urgent_overtakes() {
        // Write A, B normally, then urgent C: reads give C, A, B
        let mq = Mq::new();
        mq.write(batch(1));
        mq.write(batch(2));
        mq.write_urgent(batch(3));

        assert_eq!(batch_id(mq.read()), 3);
        assert_eq!(batch_id(mq.read()), 1);
        assert_eq!(batch_id(mq.read()), 2);
    }

    #[test]
    fn test_urgent_is_lifo_among_urgents() {
        let mq = Mq::new();
        mq.write(batch(1));
        mq.write_urgent(batch(2));
        mq.write_urgent(batch(3));

        assert_eq!(batch_id(mq.read()), 3);
        assert_eq!(batch_id(mq.read()), 2);
        assert_eq!(batch_id(mq.read()), 1);
    }

    #[test]
    fn test_typed_read_overtakes_and_preserves_rest() {
        use crate::msg::{InspectorMsg, InspectorMsgKind};

        let mq = Mq::new();
        mq.write(Message::Inspector(InspectorMsg::new(
            InspectorMsgKind::Open,
            1,
        )));
        mq.write(batch(2));
        mq.write(Message::Inspector(InspectorMsg::new(
            InspectorMsgKind::Open,
            3,
        )));

        assert_eq!(batch_id(mq.read_w_type(MsgType::Samples)), 2);

        match mq.read() {
            Message::Inspector(m) => assert_eq!(m.req_id, 1),
            other => panic!("unexpected message {:?}", other),
        }
        match mq.read() {
            Message::Inspector(m) => assert_eq!(m.req_id, 3),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_poll_does_not_block() {
        let mq = Mq::new();
        assert!(mq.poll().is_none());
        assert!(mq.poll_w_type(MsgType::Samples).is_none());

        mq.write(batch(7));
        assert!(mq.poll_w_type(MsgType::SourceEos).is_none());
        assert_eq!(batch_id(mq.poll().unwrap()), 7);
    }

    #[test]
    fn test_blocking_read_wakes_on_write() {
        let mq = Arc::new(Mq::new());
        let reader = {
            let mq = Arc::clone(&mq);
            std::thread::spawn(move || batch_id(mq.read_w_type(MsgType::Samples)))
        };

        // Give the reader a chance to park, then publish
        std::thread::sleep(std::time::Duration::from_millis(20));
        mq.write(Message::SourceEos);
        mq.write(batch(9));

        assert_eq!(reader.join().unwrap(), 9);
        // The non-matching message is still there
        assert!(matches!(mq.poll(), Some(Message::SourceEos)));
    }

    #[test]
    fn test_pool_recycles_headers() {
        let mq = Mq::new();
        // Queue a burst, then drain it: the freelist peak must reflect the
        // backlog that passed through.
        for id in 0..300 {
            mq.write(batch(id));
        }
        for _ in 0..300 {
            mq.read();
        }

        let (size, peak) = pool::stats();
        assert!(size <= MSG_POOL_MAX);
        // Other tests share the process-wide pool, so only a lower bound on
        // the peak is stable.
        assert!(peak >= 200, "pool peak = {}", peak);
    }
}
