// Copyright 2025-2026 CEMAXECUTER LLC

//! Analyzer: owns the inspector table, dispatches control requests and wires
//! the source, worker pool and message queues together.
//!
//! Clients talk to the analyzer exclusively through two queues: requests go
//! in on the control queue, responses and symbol batches come out on the
//! output queue. The control thread is the only thread that touches the
//! inspector table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel;

use crate::inspector::{
    BaudRateInfo, Channel, Handle, Inspector, InspectorParams, InspectorShared, InspectorState,
    InspectorTask,
};
use crate::mq::Mq;
use crate::msg::{InspectorMsg, InspectorMsgKind, Message, MsgType};
use crate::source::SampleSource;
use crate::worker::WorkerPool;

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Worker threads (and sample-stream subscriptions).
    pub workers: usize,
    /// Broadcast block size; also the inspectors' detector window length.
    pub bufsiz: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            bufsiz: crate::source::DEFAULT_BUFSIZ,
        }
    }
}

/// Control-thread state: the inspector table plus dispatch bookkeeping.
struct ControlState {
    table: Vec<Option<Arc<InspectorShared>>>,
    pool: WorkerPool,
    next_worker: usize,
    mq_out: Arc<Mq>,
    samp_rate: f32,
    bufsiz: usize,
}

impl ControlState {
    /// Handle validation: in range, not a tombstone, still running.
    fn get_inspector(&self, handle: Handle) -> Option<&Arc<InspectorShared>> {
        if handle < 0 {
            return None;
        }
        let shared = self.table.get(handle as usize)?.as_ref()?;
        if shared.state() == InspectorState::Running {
            Some(shared)
        } else {
            None
        }
    }

    /// CLOSE also needs to see inspectors whose worker already halted them.
    fn get_closable(&self, handle: Handle) -> Option<&Arc<InspectorShared>> {
        if handle < 0 {
            return None;
        }
        let shared = self.table.get(handle as usize)?.as_ref()?;
        match shared.state() {
            InspectorState::Running | InspectorState::Halted => Some(shared),
            _ => None,
        }
    }

    /// Tombstone a handle. Slots are never reused.
    fn dispose(&mut self, handle: Handle) -> bool {
        if handle < 0 {
            return false;
        }
        match self.table.get_mut(handle as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Append to the table, mark running and push the worker task.
    fn register(&mut self, insp: Inspector) -> Result<Handle, String> {
        let shared = insp.shared();
        let handle = self.table.len() as Handle;
        self.table.push(Some(Arc::clone(&shared)));
        shared.advance_state(InspectorState::Running);

        let worker = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.pool.len();

        if let Err(e) = self.pool.push(worker, Box::new(InspectorTask::new(insp))) {
            self.dispose(handle);
            return Err(e);
        }

        Ok(handle)
    }

    /// Reap inspectors whose worker callback has already dropped them.
    fn sweep(&mut self) {
        for slot in &mut self.table {
            if let Some(shared) = slot {
                if shared.state() == InspectorState::Halted {
                    *slot = None;
                }
            }
        }
    }

    /// Process one control request, rewriting it in place into the response
    /// and posting it on the output queue.
    fn parse_inspector_msg(&mut self, mut msg: Box<InspectorMsg>) {
        let mut found: Option<Arc<InspectorShared>> = None;

        match msg.kind {
            InspectorMsgKind::Open => {
                match Inspector::new(self.samp_rate, &msg.channel, self.bufsiz) {
                    Ok(insp) => {
                        let shared = insp.shared();
                        match self.register(insp) {
                            Ok(handle) => {
                                msg.handle = handle;
                                found = Some(shared);
                            }
                            Err(e) => {
                                log::error!("failed to register inspector: {}", e);
                                msg.kind = InspectorMsgKind::Error;
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("failed to open inspector: {}", e);
                        msg.kind = InspectorMsgKind::Error;
                    }
                }
            }

            InspectorMsgKind::GetInfo => match self.get_inspector(msg.handle) {
                None => msg.kind = InspectorMsgKind::WrongHandle,
                Some(shared) => {
                    msg.kind = InspectorMsgKind::Info;
                    msg.baud = shared.info();
                    found = Some(Arc::clone(shared));
                }
            },

            InspectorMsgKind::GetParams => match self.get_inspector(msg.handle) {
                None => msg.kind = InspectorMsgKind::WrongHandle,
                Some(shared) => {
                    msg.kind = InspectorMsgKind::Params;
                    msg.params = shared.params();
                    found = Some(Arc::clone(shared));
                }
            },

            InspectorMsgKind::Params => match self.get_inspector(msg.handle) {
                None => msg.kind = InspectorMsgKind::WrongHandle,
                Some(shared) => {
                    shared.update_params(&msg.params);
                    found = Some(Arc::clone(shared));
                }
            },

            InspectorMsgKind::Close => match self.get_closable(msg.handle) {
                None => msg.kind = InspectorMsgKind::WrongHandle,
                Some(shared) => {
                    let shared = Arc::clone(shared);
                    // Flag the worker if it still holds the inspector; the
                    // callback unschedules itself and frees the DSP state.
                    shared.advance_state(InspectorState::Halting);
                    // Either way the handle dies now.
                    self.dispose(msg.handle);
                    found = Some(shared);
                }
            },

            other => {
                msg.status = other.raw();
                msg.kind = InspectorMsgKind::WrongKind;
            }
        }

        if let Some(shared) = found {
            msg.inspector_id = shared.params().inspector_id;
        }

        self.mq_out.write(Message::Inspector(msg));
    }

    /// Flag every live inspector so workers drain, then fold the pool.
    fn shutdown(self) {
        for shared in self.table.iter().flatten() {
            shared.advance_state(InspectorState::Halting);
        }
        self.pool.halt();
    }
}

/// Engine front end. Start it over a sample source, then drive it through
/// the blocking or async client calls and the output stream.
pub struct Analyzer {
    mq_in: Arc<Mq>,
    mq_out: Arc<Mq>,
    running: Arc<AtomicBool>,
    ctl_thread: Option<JoinHandle<()>>,
    source_thread: Option<JoinHandle<()>>,
    samp_rate: f32,
}

impl Analyzer {
    pub fn start(
        mut source: Box<dyn SampleSource>,
        config: AnalyzerConfig,
    ) -> Result<Self, String> {
        let samp_rate = source.samp_rate();
        if samp_rate <= 0.0 {
            return Err(format!("source sample rate out of range: {}", samp_rate));
        }
        if config.workers == 0 {
            return Err("analyzer needs at least one worker".to_string());
        }

        let mq_in = Arc::new(Mq::new());
        let mq_out = Arc::new(Mq::new());
        let running = Arc::new(AtomicBool::new(true));

        let mut block_txs = Vec::with_capacity(config.workers);
        let mut block_rxs = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let (tx, rx) = channel::bounded(8);
            block_txs.push(tx);
            block_rxs.push(rx);
        }

        let pool = WorkerPool::new(&mq_out, block_rxs)?;

        let source_thread = {
            let running = Arc::clone(&running);
            let mq_out = Arc::clone(&mq_out);
            std::thread::Builder::new()
                .name("rk-source".to_string())
                .spawn(move || {
                    if let Err(e) = source.run(&block_txs, &running) {
                        log::error!("sample source failed: {}", e);
                    }
                    mq_out.write(Message::SourceEos);
                })
                .map_err(|e| format!("failed to spawn source thread: {}", e))?
        };

        let ctl_thread = {
            let mq_in = Arc::clone(&mq_in);
            let mut ctl = ControlState {
                table: Vec::new(),
                pool,
                next_worker: 0,
                mq_out: Arc::clone(&mq_out),
                samp_rate,
                bufsiz: config.bufsiz,
            };
            std::thread::Builder::new()
                .name("rk-analyzer".to_string())
                .spawn(move || {
                    loop {
                        match mq_in.read() {
                            Message::Inspector(msg) => ctl.parse_inspector_msg(msg),
                            Message::Halt => break,
                            other => log::warn!(
                                "unexpected {:?} message on the control queue",
                                other.msg_type()
                            ),
                        }
                        ctl.sweep();
                    }
                    ctl.shutdown();
                })
                .map_err(|e| format!("failed to spawn analyzer thread: {}", e))?
        };

        Ok(Self {
            mq_in,
            mq_out,
            running,
            ctl_thread: Some(ctl_thread),
            source_thread: Some(source_thread),
            samp_rate,
        })
    }

    pub fn samp_rate(&self) -> f32 {
        self.samp_rate
    }

    /// Flag shared with the source; clearing it ends the stream.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Ship a raw control request. Ownership of the message passes to the
    /// engine; the response comes back on the output queue.
    pub fn send(&self, msg: Box<InspectorMsg>) {
        self.mq_in.write(Message::Inspector(msg));
    }

    /// Next message from the output stream, blocking.
    pub fn read(&self) -> Message {
        self.mq_out.read()
    }

    /// Non-blocking output read.
    pub fn poll(&self) -> Option<Message> {
        self.mq_out.poll()
    }

    /// Next control response, blocking; symbol batches stay queued.
    pub fn read_inspector_msg(&self) -> Box<InspectorMsg> {
        match self.mq_out.read_w_type(MsgType::Inspector) {
            Message::Inspector(msg) => msg,
            _ => unreachable!("typed read returned a foreign message"),
        }
    }

    pub fn open_async(&self, channel: &Channel, req_id: u32) {
        let mut req = InspectorMsg::new(InspectorMsgKind::Open, req_id);
        req.channel = *channel;
        self.send(req);
    }

    pub fn close_async(&self, handle: Handle, req_id: u32) {
        let mut req = InspectorMsg::new(InspectorMsgKind::Close, req_id);
        req.handle = handle;
        self.send(req);
    }

    pub fn get_info_async(&self, handle: Handle, req_id: u32) {
        let mut req = InspectorMsg::new(InspectorMsgKind::GetInfo, req_id);
        req.handle = handle;
        self.send(req);
    }

    pub fn get_params_async(&self, handle: Handle, req_id: u32) {
        let mut req = InspectorMsg::new(InspectorMsgKind::GetParams, req_id);
        req.handle = handle;
        self.send(req);
    }

    pub fn set_params_async(&self, handle: Handle, params: &InspectorParams, req_id: u32) {
        let mut req = InspectorMsg::new(InspectorMsgKind::Params, req_id);
        req.handle = handle;
        req.params = *params;
        self.send(req);
    }

    /// Wait for the response matching `req_id`.
    fn expect_response(&self, req_id: u32) -> Result<Box<InspectorMsg>, String> {
        let resp = self.read_inspector_msg();
        if resp.req_id != req_id {
            log::error!("unmatched response: req_id {} != {}", resp.req_id, req_id);
            return Err("unmatched control response".to_string());
        }
        Ok(resp)
    }

    /// Open an inspector over `channel` and wait for its handle.
    pub fn open(&self, channel: &Channel) -> Result<Handle, String> {
        let req_id = rand::random();
        self.open_async(channel, req_id);

        let resp = self.expect_response(req_id)?;
        match resp.kind {
            InspectorMsgKind::Open => Ok(resp.handle),
            InspectorMsgKind::Error => Err("inspector open failed".to_string()),
            kind => {
                log::error!("unexpected response kind {:?} to open", kind);
                Err("unexpected response kind".to_string())
            }
        }
    }

    /// Close `handle` and wait for the acknowledgement.
    pub fn close(&self, handle: Handle) -> Result<(), String> {
        let req_id = rand::random();
        self.close_async(handle, req_id);

        let resp = self.expect_response(req_id)?;
        match resp.kind {
            InspectorMsgKind::Close => Ok(()),
            InspectorMsgKind::WrongHandle => {
                log::warn!("close: wrong handle {}", handle);
                Err("wrong handle".to_string())
            }
            kind => {
                log::error!("unexpected response kind {:?} to close", kind);
                Err("unexpected response kind".to_string())
            }
        }
    }

    /// Current blind baud estimates for `handle`.
    pub fn get_info(&self, handle: Handle) -> Result<BaudRateInfo, String> {
        let req_id = rand::random();
        self.get_info_async(handle, req_id);

        let resp = self.expect_response(req_id)?;
        match resp.kind {
            InspectorMsgKind::Info => Ok(resp.baud),
            InspectorMsgKind::WrongHandle => {
                log::warn!("get_info: wrong handle {}", handle);
                Err("wrong handle".to_string())
            }
            kind => {
                log::error!("unexpected response kind {:?} to get_info", kind);
                Err("unexpected response kind".to_string())
            }
        }
    }

    fn halt_inner(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.mq_in.write_urgent(Message::Halt);

        if let Some(thread) = self.ctl_thread.take() {
            if thread.join().is_err() {
                log::error!("analyzer thread panicked");
            }
        }
        if let Some(thread) = self.source_thread.take() {
            if thread.join().is_err() {
                log::error!("source thread panicked");
            }
        }
    }

    /// Stop the source, drain the workers and join every engine thread.
    pub fn halt(mut self) {
        self.halt_inner();
    }
}

impl Drop for Analyzer {
    fn drop(&mut self) {
        if self.ctl_thread.is_some() {
            self.halt_inner();
        }
    }
}
