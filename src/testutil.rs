//! In-process relays backing the async tests.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::event::{Event, Tag};

/// Build an event with the given identity fields and tags.
pub fn sample_event(id: &str, pubkey: &str, kind: u32, created_at: u64, tags: Vec<Vec<&str>>) -> Event {
    Event {
        id: id.into(),
        pubkey: pubkey.into(),
        kind,
        created_at,
        tags: tags
            .into_iter()
            .map(|t| Tag(t.into_iter().map(String::from).collect()))
            .collect(),
        content: String::new(),
        sig: String::new(),
    }
}

/// What a scripted relay sends back after reading the REQ.
pub enum Reply {
    /// `["EVENT", <sub>, event]` using the subscription id from the REQ.
    Event(Event),
    /// `["EOSE", <sub>]`.
    Eose,
    /// `["NOTICE", <message>]`.
    Notice(String),
    /// A verbatim JSON value.
    Raw(Value),
    /// A binary WebSocket message.
    Binary(Vec<u8>),
}

/// Serve a single connection: read the REQ, send the scripted replies, then
/// either hold the socket open or wait for the peer to go away.
pub async fn script_relay(replies: Vec<Reply>, hold_open: bool) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let sub = match ws.next().await {
            Some(Ok(Message::Text(txt))) => serde_json::from_str::<Value>(&txt)
                .ok()
                .and_then(|v| v[1].as_str().map(String::from))
                .unwrap_or_else(|| "sub".into()),
            _ => return,
        };
        for reply in replies {
            let msg = match reply {
                Reply::Event(ev) => Message::Text(json!(["EVENT", sub, ev]).to_string()),
                Reply::Eose => Message::Text(json!(["EOSE", sub]).to_string()),
                Reply::Notice(text) => Message::Text(json!(["NOTICE", text]).to_string()),
                Reply::Raw(val) => Message::Text(val.to_string()),
                Reply::Binary(bytes) => Message::Binary(bytes),
            };
            if ws.send(msg).await.is_err() {
                return;
            }
        }
        if hold_open {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        } else {
            while let Some(msg) = ws.next().await {
                if msg.is_err() {
                    break;
                }
            }
        }
    });
    (format!("ws://{}", addr), handle)
}

/// Serve any number of connections, answering each REQ with the stored
/// events matching its filter followed by an EOSE.
pub async fn filter_relay(events: Vec<Event>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let events = events.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                let Some(Ok(Message::Text(txt))) = ws.next().await else {
                    return;
                };
                let Ok(req) = serde_json::from_str::<Value>(&txt) else {
                    return;
                };
                let sub = req[1].as_str().unwrap_or("sub").to_string();
                for ev in events.iter().filter(|ev| filter_matches(&req[2], ev)) {
                    if ws
                        .send(Message::Text(json!(["EVENT", sub, ev]).to_string()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                let _ = ws.send(Message::Text(json!(["EOSE", sub]).to_string())).await;
                while let Some(msg) = ws.next().await {
                    if msg.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (format!("ws://{}", addr), handle)
}

fn filter_matches(filter: &Value, ev: &Event) -> bool {
    if let Some(authors) = filter.get("authors").and_then(Value::as_array) {
        if !authors.iter().any(|a| a.as_str() == Some(ev.pubkey.as_str())) {
            return false;
        }
    }
    if let Some(kinds) = filter.get("kinds").and_then(Value::as_array) {
        if !kinds.iter().any(|k| k.as_u64() == Some(ev.kind as u64)) {
            return false;
        }
    }
    if let Some(ds) = filter.get("#d").and_then(Value::as_array) {
        if !ds.iter().any(|d| d.as_str() == ev.tag_value("d")) {
            return false;
        }
    }
    if let Some(ps) = filter.get("#p").and_then(Value::as_array) {
        if !ps
            .iter()
            .any(|p| p.as_str().map(|s| ev.has_tag("p", s)).unwrap_or(false))
        {
            return false;
        }
    }
    true
}
