//! Normalized events and their wire frames

use bytes::Bytes;
use num_bigint::BigUint;
use serde::{Serialize, Serializer};

use super::phase::Phase;

/// A frame written to the client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close,
}

/// Block height as delivered by the upstream protocol.
///
/// Heights that arrive as hex quantities are arbitrary precision and go out
/// as decimal strings, since they routinely exceed what a JSON number can
/// carry safely. Heights that arrive as JSON numbers go out as numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHeight {
    Number(u64),
    Quantity(BigUint),
}

impl Serialize for BlockHeight {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BlockHeight::Number(n) => serializer.serialize_u64(*n),
            BlockHeight::Quantity(q) => serializer.serialize_str(&q.to_str_radix(10)),
        }
    }
}

/// Protocol-agnostic statistics; absent fields were not obtained
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSample {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_block: Option<BlockHeight>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_block: Option<BlockHeight>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peers_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syncing: Option<bool>,
}

impl StatsSample {
    pub fn is_empty(&self) -> bool {
        self.current_block.is_none()
            && self.highest_block.is_none()
            && self.peers_count.is_none()
            && self.syncing.is_none()
    }

    /// A node that reports it is not syncing is at the chain head
    pub fn fill_head_when_synced(&mut self) {
        if self.syncing == Some(false) && self.highest_block.is_none() {
            self.highest_block = self.current_block.clone();
        }
    }
}

/// One outbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Phase(Phase),
    Stats(StatsSample),
    Error(String),
    Log(Bytes),
}

impl Event {
    pub fn error(message: impl Into<String>) -> Self {
        Event::Error(message.into())
    }

    /// Encode for the wire: phases as bare text, stats and errors as JSON
    /// objects, logs as binary.
    pub fn to_frame(&self) -> Frame {
        match self {
            Event::Phase(phase) => Frame::Text(phase.to_string()),
            Event::Stats(sample) => match serde_json::to_string(sample) {
                Ok(json) => Frame::Text(json),
                Err(e) => error_frame(&format!("failed to encode stats: {}", e)),
            },
            Event::Error(message) => error_frame(message),
            Event::Log(chunk) => Frame::Binary(chunk.clone()),
        }
    }
}

fn error_frame(message: &str) -> Frame {
    Frame::Text(serde_json::json!({ "error": message }).to_string())
}
