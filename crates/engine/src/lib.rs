// Copyright 2025-2026 CEMAXECUTER LLC

//! Channel inspector engine.
//!
//! Opens per-channel DSP pipelines (inspectors) over a shared sample stream,
//! drives them from a worker pool, and exposes a request/response control
//! protocol plus a symbol-sample output stream over in-process message
//! queues.

pub mod analyzer;
pub mod consumer;
pub mod inspector;
pub mod mq;
pub mod msg;
pub mod source;
pub mod worker;

pub use analyzer::{Analyzer, AnalyzerConfig};
pub use inspector::{BaudRateInfo, CarrierControl, Channel, Handle, InspectorParams, InspectorState};
pub use msg::{InspectorMsg, InspectorMsgKind, Message, MsgType, SampleBatchMsg};
