//! Concurrent fan-out of one query across many relays.
//!
//! One task per endpoint feeds a single channel of admitted events. The
//! fan-out is done when every task has terminated (a join barrier, not a
//! race) or when the caller's stage budget runs out, at which point any
//! straggler task is abandoned. Per-endpoint trouble is recorded as a
//! [`SoftFailure`] and never fails the call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::dedup::Deduper;
use crate::event::Event;
use crate::protocol::{Filter, Frame};
use crate::relay::{Received, RelayConnection};

/// Classification of a per-endpoint soft failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailKind {
    /// The transport handshake failed.
    Connect,
    /// Sending the subscription request failed.
    Send,
    /// Reading from the connection failed.
    Read,
    /// The rolling read deadline expired mid-stream.
    Timeout,
    /// The relay rejected the subscription with a NOTICE.
    Notice,
}

/// A per-endpoint error that reduced completeness without failing the call.
#[derive(Debug, Clone, Serialize)]
pub struct SoftFailure {
    pub endpoint: String,
    pub kind: FailKind,
    pub detail: String,
}

/// Options shared by every connection of one query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Rolling per-read deadline for each connection.
    pub read_timeout: Duration,
    /// Optional SOCKS5 proxy (host:port).
    pub socks: Option<String>,
}

/// Everything a finished fan-out produced.
#[derive(Debug)]
pub struct QueryOutcome {
    /// Union of admitted events from all endpoints, in admission order.
    pub events: Vec<Event>,
    /// Per-endpoint soft failures.
    pub failures: Vec<SoftFailure>,
    /// How many endpoints completed the transport handshake.
    pub connections: usize,
}

/// A live fan-out; yields admitted events as they arrive.
pub struct QueryStream {
    rx: mpsc::Receiver<Event>,
    tasks: Vec<JoinHandle<()>>,
    failures: Arc<Mutex<Vec<SoftFailure>>>,
    connected: Arc<AtomicUsize>,
}

/// Handles shared by every endpoint task of one fan-out.
#[derive(Clone)]
struct Shared {
    tx: mpsc::Sender<Event>,
    seen: Deduper,
    failures: Arc<Mutex<Vec<SoftFailure>>>,
    connected: Arc<AtomicUsize>,
}

impl Shared {
    async fn record(&self, endpoint: &str, kind: FailKind, detail: String) {
        eprintln!("relay {endpoint}: {detail}");
        self.failures.lock().await.push(SoftFailure {
            endpoint: endpoint.to_string(),
            kind,
            detail,
        });
    }
}

/// Spawn one connection task per endpoint, all feeding a single channel.
pub fn spawn(endpoints: &[String], sub_id: &str, filter: &Filter, opts: &QueryOptions) -> QueryStream {
    let (tx, rx) = mpsc::channel(64);
    let failures = Arc::new(Mutex::new(Vec::new()));
    let connected = Arc::new(AtomicUsize::new(0));
    let shared = Shared {
        tx,
        seen: Deduper::new(),
        failures: failures.clone(),
        connected: connected.clone(),
    };
    let mut tasks = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let endpoint = endpoint.clone();
        let sub_id = sub_id.to_string();
        let filter = filter.clone();
        let opts = opts.clone();
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            query_relay(endpoint, sub_id, filter, opts, shared).await;
        }));
    }
    QueryStream {
        rx,
        tasks,
        failures,
        connected,
    }
}

impl QueryStream {
    /// Next admitted event, or `None` once every endpoint task has finished.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Drain the stream until every endpoint finishes or `budget` elapses,
    /// then abandon whatever is still running.
    pub async fn collect(mut self, budget: Duration) -> QueryOutcome {
        let deadline = Instant::now() + budget;
        let mut events = Vec::new();
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                // All senders dropped: the join barrier has been reached.
                Ok(None) => break,
                Ok(Some(ev)) => events.push(ev),
                // Stage budget exhausted; late results are discarded.
                Err(_) => break,
            }
        }
        let connections = self.connected.load(Ordering::SeqCst);
        let failures = self.finish().await;
        QueryOutcome {
            events,
            failures,
            connections,
        }
    }

    /// Abandon any still-running tasks and return the recorded failures.
    pub async fn finish(self) -> Vec<SoftFailure> {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        let failures = self.failures.lock().await;
        failures.clone()
    }
}

/// Run one endpoint's subscription to completion.
async fn query_relay(endpoint: String, sub_id: String, filter: Filter, opts: QueryOptions, shared: Shared) {
    let mut conn = match RelayConnection::open(&endpoint, opts.socks.as_deref()).await {
        Ok(conn) => conn,
        Err(e) => {
            shared.record(&endpoint, FailKind::Connect, e.to_string()).await;
            return;
        }
    };
    shared.connected.fetch_add(1, Ordering::SeqCst);
    if let Err(e) = conn.subscribe(&sub_id, &filter).await {
        shared.record(&endpoint, FailKind::Send, e.to_string()).await;
        conn.close().await;
        return;
    }
    loop {
        match conn.next_frame(opts.read_timeout).await {
            Ok(Received::Frame(Frame::Event { sub_id: sub, event })) => {
                if sub != sub_id {
                    continue;
                }
                if shared.seen.admit(&event.id).await && shared.tx.send(event).await.is_err() {
                    // Receiver gone: the stage was abandoned.
                    break;
                }
            }
            Ok(Received::Frame(Frame::EndOfStream { sub_id: sub })) => {
                if sub == sub_id {
                    break;
                }
            }
            Ok(Received::Frame(Frame::Notice { message })) => {
                shared.record(&endpoint, FailKind::Notice, message).await;
                break;
            }
            Ok(Received::Frame(Frame::Unknown { raw })) => {
                eprintln!("unknown frame from {endpoint}: {raw}");
            }
            Ok(Received::Timeout) => {
                shared
                    .record(&endpoint, FailKind::Timeout, "read deadline expired".into())
                    .await;
                break;
            }
            Ok(Received::Closed) => break,
            Err(e) => {
                shared.record(&endpoint, FailKind::Read, e.to_string()).await;
                break;
            }
        }
    }
    conn.close().await;
}
