//! Subject profile lookups: metadata and advertised relay lists.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::badges::AggregateOptions;
use crate::event::{self, Event};
use crate::fanout::{self, SoftFailure};
use crate::protocol::Filter;

/// Display fields from a metadata event's content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileMeta {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub picture: String,
    #[serde(default)]
    pub about: String,
}

/// Relay endpoints advertised by a NIP-65 relay-list event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayList {
    pub read: Vec<String>,
    pub write: Vec<String>,
    pub both: Vec<String>,
}

impl RelayList {
    /// Relays holding content the subject published (badge collections,
    /// definitions, metadata).
    pub fn content_targets(&self) -> Vec<String> {
        dedup_urls(self.write.iter().chain(self.both.iter()))
    }

    /// Relays holding events that mention the subject (badge awards).
    pub fn mention_targets(&self) -> Vec<String> {
        dedup_urls(self.read.iter().chain(self.both.iter()))
    }

    fn from_event(ev: &Event) -> Self {
        let mut list = RelayList::default();
        for tag in &ev.tags {
            if tag.0.first().map(String::as_str) != Some("r") {
                continue;
            }
            let Some(url) = tag.0.get(1) else {
                continue;
            };
            match tag.0.get(2).map(String::as_str) {
                Some("read") => list.read.push(url.clone()),
                Some("write") => list.write.push(url.clone()),
                None => list.both.push(url.clone()),
                Some(_) => {}
            }
        }
        list
    }
}

fn dedup_urls<'a>(urls: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for url in urls {
        if !targets.contains(url) {
            targets.push(url.clone());
        }
    }
    targets
}

/// Fetch the subject's metadata; the newest parseable content wins.
pub async fn fetch_metadata(
    subject: &str,
    relays: &[String],
    opts: &AggregateOptions,
) -> Result<(Option<ProfileMeta>, Vec<SoftFailure>)> {
    let filter = Filter {
        authors: vec![subject.to_string()],
        kinds: vec![event::METADATA],
        ..Filter::default()
    };
    let stream = fanout::spawn(relays, "meta", &filter, &opts.query());
    let outcome = stream.collect(opts.stage_timeout).await;
    if outcome.connections == 0 {
        bail!("no relay reachable for metadata lookup");
    }
    let meta = newest_first(outcome.events)
        .iter()
        .find_map(|ev| serde_json::from_str::<ProfileMeta>(&ev.content).ok());
    Ok((meta, outcome.failures))
}

/// Fetch the subject's advertised relay list from the index relays.
pub async fn fetch_relay_list(
    subject: &str,
    index_relays: &[String],
    opts: &AggregateOptions,
) -> Result<(Option<RelayList>, Vec<SoftFailure>)> {
    let filter = Filter {
        authors: vec![subject.to_string()],
        kinds: vec![event::RELAY_LIST],
        ..Filter::default()
    };
    let stream = fanout::spawn(index_relays, "relays", &filter, &opts.query());
    let outcome = stream.collect(opts.stage_timeout).await;
    if outcome.connections == 0 {
        bail!("no index relay reachable for relay-list lookup");
    }
    let list = newest_first(outcome.events).first().map(RelayList::from_event);
    Ok((list, outcome.failures))
}

/// Order events newest first, ties broken toward the smaller id so the
/// winner does not depend on arrival order.
fn newest_first(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
    events
}
