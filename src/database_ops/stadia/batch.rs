//! Batch envelope codec for the `batchexecute` endpoint.
//!
//! Request: `f.req=[[[method, json(args), null, "<1-based index>"], ...]]`.
//! Response: an anti-XSSI prefix followed by chunks separated by decimal
//! length lines. Each chunk is a JSON array of envelopes; the ones tagged
//! `wrb.fr` carry a JSON-encoded payload at [2] and the request index at [6].

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use super::RpcError;
use crate::util::proto::Proto;

pub const RESPONSE_TAG: &str = "wrb.fr";

mod envelope_offsets {
    pub const TAG: usize = 0;
    pub const METHOD: usize = 1;
    pub const PAYLOAD: usize = 2;
    pub const INDEX: usize = 6;
}

/// One logical call inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub method: String,
    pub request: Option<Proto>,
}

impl RpcCall {
    pub fn new(method: impl Into<String>, request: impl Into<Proto>) -> Self {
        Self {
            method: method.into(),
            request: Some(request.into()),
        }
    }

    /// A call with no arguments; sent as `[]`.
    pub fn bare(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            request: None,
        }
    }

    pub fn request_or_empty(&self) -> Proto {
        self.request.clone().unwrap_or_else(|| Proto::array([]))
    }
}

/// Comma-joined method ids for the `rpcids` query parameter.
pub fn method_ids(calls: &[RpcCall]) -> String {
    calls
        .iter()
        .map(|c| c.method.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// The `f.req` form value for a batch.
pub fn encode_batch(calls: &[RpcCall]) -> String {
    let envelopes: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(i, call)| {
            json!([
                call.method,
                call.request_or_empty().to_json_string(),
                null,
                (i + 1).to_string()
            ])
        })
        .collect();
    json!([envelopes]).to_string()
}

fn chunk_separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| Regex::new(r"\n\d+\n").expect("static regex"))
}

/// Decode a batch response into payloads ordered by their request index.
///
/// Bodies without any `wrb.fr` envelope decode to an empty list.
pub fn decode_batch(text: &str) -> Result<Vec<Proto>, RpcError> {
    use envelope_offsets::*;

    let mut tagged: Vec<(u64, Proto)> = Vec::new();
    for chunk in chunk_separator().split(text).skip(1) {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        let envelopes: Value = serde_json::from_str(chunk)
            .map_err(|err| RpcError::MalformedEnvelope(format!("chunk is not json: {err}")))?;
        let Some(envelopes) = envelopes.as_array() else {
            return Err(RpcError::MalformedEnvelope("chunk is not an array".into()));
        };
        for envelope in envelopes {
            if envelope.get(TAG).and_then(Value::as_str) != Some(RESPONSE_TAG) {
                continue;
            }
            let index = envelope
                .get(INDEX)
                .and_then(|v| match v {
                    Value::String(s) => s.parse::<u64>().ok(),
                    Value::Number(n) => n.as_u64(),
                    _ => None,
                })
                .ok_or_else(|| {
                    RpcError::MalformedEnvelope(format!(
                        "{} envelope without a request index",
                        envelope.get(METHOD).unwrap_or(&Value::Null)
                    ))
                })?;
            let payload = match envelope.get(PAYLOAD) {
                Some(Value::String(encoded)) => Proto::from_json_str(encoded).map_err(|err| {
                    RpcError::MalformedEnvelope(format!("payload {index} is not a proto: {err}"))
                })?,
                _ => Proto::Null,
            };
            tagged.push((index, payload));
        }
    }
    tagged.sort_by_key(|(index, _)| *index);
    Ok(tagged.into_iter().map(|(_, payload)| payload).collect())
}
