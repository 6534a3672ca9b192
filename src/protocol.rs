//! NIP-01 subscription protocol codec.
//!
//! Queries go out as `["REQ", <sub>, <filter>]` text frames; everything a
//! relay sends back is decoded once at the connection boundary into a typed
//! [`Frame`] so nothing downstream touches raw JSON arrays.

use serde_json::{json, Map, Value};

use crate::event::Event;

/// Request specification for a subscription.
///
/// An empty dimension means "no constraint", and is omitted from the wire
/// filter object entirely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Accepted author public keys.
    pub authors: Vec<String>,
    /// Accepted kind numbers.
    pub kinds: Vec<u32>,
    /// Accepted event ids.
    pub ids: Vec<String>,
    /// Single-letter tag filters, serialized as `"#<letter>"` keys.
    pub tags: Vec<(char, Vec<String>)>,
}

impl Filter {
    /// Serialize into the NIP-01 filter object.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        if !self.authors.is_empty() {
            map.insert(
                "authors".into(),
                Value::Array(self.authors.iter().cloned().map(Value::String).collect()),
            );
        }
        if !self.kinds.is_empty() {
            map.insert(
                "kinds".into(),
                Value::Array(self.kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        if !self.ids.is_empty() {
            map.insert(
                "ids".into(),
                Value::Array(self.ids.iter().cloned().map(Value::String).collect()),
            );
        }
        for (name, values) in &self.tags {
            if !values.is_empty() {
                map.insert(
                    format!("#{name}"),
                    Value::Array(values.iter().cloned().map(Value::String).collect()),
                );
            }
        }
        Value::Object(map)
    }
}

/// Encode a subscription request frame.
pub fn encode_req(sub_id: &str, filter: &Filter) -> String {
    json!(["REQ", sub_id, filter.to_json()]).to_string()
}

/// One decoded relay message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// An event delivered for a subscription.
    Event { sub_id: String, event: Event },
    /// The relay has sent all stored events for a subscription.
    EndOfStream { sub_id: String },
    /// A protocol-level rejection or warning from the relay.
    Notice { message: String },
    /// Anything that did not parse as one of the above.
    Unknown { raw: String },
}

/// Decode a text frame defensively.
///
/// A malformed message from a misbehaving relay yields [`Frame::Unknown`];
/// it must never abort processing of the relay's other messages.
pub fn decode_frame(raw: &str) -> Frame {
    let unknown = || Frame::Unknown { raw: raw.to_string() };
    let val: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return unknown(),
    };
    let Some(arr) = val.as_array() else {
        return unknown();
    };
    match arr.first().and_then(Value::as_str) {
        Some("EVENT") if arr.len() >= 3 => {
            let sub_id = arr[1].as_str().unwrap_or_default().to_string();
            match serde_json::from_value::<Event>(arr[2].clone()) {
                Ok(event) => Frame::Event { sub_id, event },
                Err(_) => unknown(),
            }
        }
        Some("EOSE") if arr.len() >= 2 => Frame::EndOfStream {
            sub_id: arr[1].as_str().unwrap_or_default().to_string(),
        },
        Some("NOTICE") => Frame::Notice {
            message: arr.get(1).and_then(Value::as_str).unwrap_or_default().to_string(),
        },
        _ => unknown(),
    }
}
