//! Frames exchanged over a multiplexed connection.
//!
//! Every stream starts with an `Open` frame, carries zero or more `Message`
//! frames in each direction and ends with a `Close` frame from each side.
//! A `Close` sent by the client half-closes its sending side; a `Close`
//! sent by the server terminates the stream and carries the call status.

use serde::{Deserialize, Serialize};

use super::Metadata;

pub type StreamId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Open {
        stream_id: StreamId,
        method: String,
        headers: Metadata,
    },
    Message {
        stream_id: StreamId,
        payload: Vec<u8>,
    },
    Close {
        stream_id: StreamId,
        error: Option<String>,
    },
}

impl Frame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Open { stream_id, .. }
            | Frame::Message { stream_id, .. }
            | Frame::Close { stream_id, .. } => *stream_id,
        }
    }
}
