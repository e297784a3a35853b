//! RPC telemetry collector
//!
//! Two strategies, picked by the protocol profile:
//!
//! - [`polling`]: independent HTTP JSON-RPC calls on a fixed interval. A
//!   failed call only drops its fields from that cycle's sample.
//! - [`proxied`]: one persistent upstream WebSocket carrying correlated
//!   requests. Any failure tears the upstream down and starts over from
//!   readiness, since a multiplexed stream cannot resynchronize mid-flight.
//!
//! Both normalize results into [`StatsSample`] through the profile's field
//! mappings.

pub mod polling;
pub mod proxied;
pub mod rpc;

use num_bigint::BigUint;
use serde_json::Value;

use super::event::{BlockHeight, StatsSample};
use super::{ProducerContext, StreamEnd};
use crate::config::{CollectorProfile, RpcCall, StatsField};

pub use proxied::Correlator;
pub use rpc::{HttpRpcClient, RpcClient, RpcError};

/// Stats producer: runs the profile's strategy until the connection ends
pub async fn run(ctx: &ProducerContext) -> StreamEnd {
    match &ctx.profile.collector {
        CollectorProfile::Polling { calls } => {
            let client = HttpRpcClient::new(ctx.config.request_timeout());
            polling::run(ctx, &client, calls).await
        }
        CollectorProfile::Proxied { calls } => proxied::run(ctx, calls).await,
    }
}

/// Copy the values a call's field mappings select into `sample`.
/// Values that are missing or fail to parse leave the field untouched.
pub fn apply_result(sample: &mut StatsSample, call: &RpcCall, result: &Value) {
    for mapping in &call.fields {
        let value = if mapping.pointer.is_empty() {
            Some(result)
        } else {
            result.pointer(&mapping.pointer)
        };
        let Some(value) = value else {
            continue;
        };

        match mapping.field {
            StatsField::CurrentBlock => {
                if let Some(height) = parse_height(value) {
                    sample.current_block = Some(height);
                }
            }
            StatsField::HighestBlock => {
                if let Some(height) = parse_height(value) {
                    sample.highest_block = Some(height);
                }
            }
            StatsField::PeersCount => {
                if let Some(count) = parse_count(value) {
                    sample.peers_count = Some(count);
                }
            }
            StatsField::Syncing => {
                if let Some(syncing) = parse_syncing(value) {
                    sample.syncing = Some(syncing);
                }
            }
        }
    }
}

/// Block height from a JSON number, a `0x` quantity or a decimal string
pub fn parse_height(value: &Value) -> Option<BlockHeight> {
    match value {
        Value::Number(n) => n.as_u64().map(BlockHeight::Number),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => BigUint::parse_bytes(hex.as_bytes(), 16).map(BlockHeight::Quantity),
            None => BigUint::parse_bytes(s.as_bytes(), 10).map(BlockHeight::Quantity),
        },
        _ => None,
    }
}

/// Small counters (peers) from a JSON number, a `0x` quantity or a decimal string
pub fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

/// `true`/`false`, or a progress object meaning "syncing"
pub fn parse_syncing(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Object(_) => Some(true),
        _ => None,
    }
}
