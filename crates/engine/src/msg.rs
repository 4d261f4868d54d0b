// Copyright 2025-2026 CEMAXECUTER LLC

//! Messages exchanged over the engine queues.

use num_complex::Complex32;

use crate::inspector::{BaudRateInfo, Channel, Handle, InspectorParams};

/// Discriminant used for typed queue reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Control request or response ([`InspectorMsg`]).
    Inspector,
    /// Batched symbol samples from a worker.
    Samples,
    /// The upstream sample stream ended.
    SourceEos,
    /// Engine shutdown marker.
    Halt,
}

/// A queue payload. Control messages are boxed: they are by far the largest
/// variant and their headers are what the message pool recycles.
#[derive(Debug)]
pub enum Message {
    Inspector(Box<InspectorMsg>),
    Samples(SampleBatchMsg),
    SourceEos,
    Halt,
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Inspector(_) => MsgType::Inspector,
            Message::Samples(_) => MsgType::Samples,
            Message::SourceEos => MsgType::SourceEos,
            Message::Halt => MsgType::Halt,
        }
    }
}

/// Request/response kinds of the inspector control protocol.
///
/// One record serves as both request and response: the handler rewrites
/// `kind` in place. `Other` carries kinds this build does not recognize so
/// they can be bounced back as [`WrongKind`](InspectorMsgKind::WrongKind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectorMsgKind {
    Open,
    GetInfo,
    Info,
    GetParams,
    Params,
    Close,
    WrongHandle,
    WrongKind,
    Error,
    Other(u32),
}

impl InspectorMsgKind {
    /// Wire value of the kind, echoed in `status` for WRONG_KIND responses.
    pub fn raw(self) -> u32 {
        match self {
            InspectorMsgKind::Open => 0,
            InspectorMsgKind::GetInfo => 1,
            InspectorMsgKind::Info => 2,
            InspectorMsgKind::GetParams => 3,
            InspectorMsgKind::Params => 4,
            InspectorMsgKind::Close => 5,
            InspectorMsgKind::WrongHandle => 6,
            InspectorMsgKind::WrongKind => 7,
            InspectorMsgKind::Error => 8,
            InspectorMsgKind::Other(v) => v,
        }
    }
}

/// Control message, mutated in place by the analyzer into its response.
#[derive(Debug, Clone)]
pub struct InspectorMsg {
    pub kind: InspectorMsgKind,
    /// Client-chosen correlation id, copied back unchanged.
    pub req_id: u32,
    pub handle: Handle,
    pub channel: Channel,
    pub params: InspectorParams,
    pub baud: BaudRateInfo,
    /// Application-level inspector label, filled in whenever the request
    /// resolved to an inspector.
    pub inspector_id: u32,
    /// For WRONG_KIND responses, the raw kind of the offending request.
    pub status: u32,
}

impl InspectorMsg {
    pub fn new(kind: InspectorMsgKind, req_id: u32) -> Box<Self> {
        Box::new(Self {
            kind,
            req_id,
            handle: -1,
            channel: Channel::default(),
            params: InspectorParams::default(),
            baud: BaudRateInfo::default(),
            inspector_id: 0,
            status: 0,
        })
    }
}

/// Symbol samples recovered by one inspector, batched per worker pass.
#[derive(Debug, Clone)]
pub struct SampleBatchMsg {
    pub inspector_id: u32,
    pub samples: Vec<Complex32>,
}

impl SampleBatchMsg {
    pub fn new(inspector_id: u32) -> Self {
        Self {
            inspector_id,
            samples: Vec::new(),
        }
    }

    pub fn push(&mut self, sample: Complex32) {
        self.samples.push(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_raw_round_trip_for_other() {
        assert_eq!(InspectorMsgKind::Other(0xFF).raw(), 0xFF);
        assert_eq!(InspectorMsgKind::Close.raw(), 5);
    }

    #[test]
    fn test_new_message_defaults() {
        let msg = InspectorMsg::new(InspectorMsgKind::Open, 42);
        assert_eq!(msg.req_id, 42);
        assert_eq!(msg.handle, -1);
        assert_eq!(msg.kind, InspectorMsgKind::Open);
    }
}
