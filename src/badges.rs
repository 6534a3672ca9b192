//! Badge aggregation across relays.
//!
//! Stage 1 fans a collection query out to every endpoint; stage 2 resolves
//! each discovered definition reference with its own smaller fan-out. Relay
//! flakiness degrades the result instead of failing it; the only hard error
//! is a stage-1 fan-out that cannot reach a single relay.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::time::{timeout_at, Instant};

use crate::event::{self, Event};
use crate::fanout::{self, QueryOptions, SoftFailure};
use crate::protocol::Filter;

/// Deadlines and transport options for one aggregation call.
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Rolling per-read deadline on each connection.
    pub read_timeout: Duration,
    /// Total budget for a first-stage fan-out.
    pub stage_timeout: Duration,
    /// Budget for resolving one definition reference.
    pub resolve_timeout: Duration,
    /// Optional SOCKS5 proxy (host:port).
    pub socks: Option<String>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            stage_timeout: Duration::from_secs(10),
            resolve_timeout: Duration::from_secs(5),
            socks: None,
        }
    }
}

impl AggregateOptions {
    /// Per-connection options for the fan-out layer.
    pub fn query(&self) -> QueryOptions {
        QueryOptions {
            read_timeout: self.read_timeout,
            socks: self.socks.clone(),
        }
    }
}

/// A definition triple discovered in a collection or award event, paired
/// with the award event it arrived through.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossReference {
    pub kind: u32,
    pub author: String,
    pub discriminator: String,
    pub award_event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_relay: Option<String>,
}

impl CrossReference {
    /// Stable identity of the referenced definition.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.kind, self.author, self.discriminator)
    }
}

/// Parse an `a` tag value of the form `kind:pubkey:discriminator`.
fn parse_triple(value: &str) -> Option<(u32, String, String)> {
    let mut parts = value.splitn(3, ':');
    let kind = parts.next()?.parse().ok()?;
    let author = parts.next()?.to_string();
    let discriminator = parts.next()?.to_string();
    if author.is_empty() || discriminator.is_empty() {
        return None;
    }
    Some((kind, author, discriminator))
}

/// Resolved badge metadata from a definition event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Definition {
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub thumb_url: String,
    pub discriminator: String,
    pub source_event_id: String,
}

impl Definition {
    fn from_event(ev: &Event) -> Self {
        let mut def = Definition {
            source_event_id: ev.id.clone(),
            ..Definition::default()
        };
        for tag in &ev.tags {
            match (tag.0.first().map(String::as_str), tag.0.get(1)) {
                (Some("name"), Some(v)) => def.name = v.clone(),
                (Some("description"), Some(v)) => def.description = v.clone(),
                (Some("image"), Some(v)) => def.image_url = v.clone(),
                (Some("thumb"), Some(v)) => def.thumb_url = v.clone(),
                (Some("d"), Some(v)) => def.discriminator = v.clone(),
                _ => {}
            }
        }
        def
    }
}

/// One aggregated badge: the reference and, when a relay produced a match
/// in time, its definition.
#[derive(Debug, Clone, Serialize)]
pub struct BadgeEntry {
    pub reference: CrossReference,
    pub definition: Option<Definition>,
}

/// Result of a full profile-badge aggregation.
#[derive(Debug, Serialize)]
pub struct AggregateOutcome {
    pub badges: Vec<BadgeEntry>,
    pub failures: Vec<SoftFailure>,
}

/// A badge definition authored by the subject.
#[derive(Debug, Serialize)]
pub struct CreatedOutcome {
    pub badges: Vec<Definition>,
    pub failures: Vec<SoftFailure>,
}

/// A badge award naming the subject, with its definition when resolvable.
#[derive(Debug, Clone, Serialize)]
pub struct AwardedBadge {
    pub awarded_by: String,
    pub award_event_id: String,
    pub created_at: u64,
    pub discriminator: String,
    pub definition: Option<Definition>,
}

/// Result of an awarded-badges lookup.
#[derive(Debug, Serialize)]
pub struct AwardedOutcome {
    pub badges: Vec<AwardedBadge>,
    pub failures: Vec<SoftFailure>,
}

/// Aggregate the subject's profile badges.
pub async fn collect_badges(
    subject: &str,
    relays: &[String],
    opts: &AggregateOptions,
) -> Result<AggregateOutcome> {
    let filter = Filter {
        authors: vec![subject.to_string()],
        kinds: vec![event::PROFILE_BADGES],
        ..Filter::default()
    };
    let stream = fanout::spawn(relays, "badges", &filter, &opts.query());
    let outcome = stream.collect(opts.stage_timeout).await;
    if outcome.connections == 0 {
        bail!("no relay reachable for badge aggregation");
    }
    let mut failures = outcome.failures;
    let refs = fold_references(&outcome.events);

    let mut tasks = Vec::new();
    for reference in &refs {
        let reference = reference.clone();
        let relays = relays.to_vec();
        let opts = opts.clone();
        tasks.push(tokio::spawn(async move {
            resolve_definition(&reference, &relays, &opts).await
        }));
    }
    let mut badges = Vec::new();
    for (reference, task) in refs.into_iter().zip(tasks) {
        let (definition, fails) = match task.await {
            Ok(v) => v,
            Err(_) => (None, Vec::new()),
        };
        failures.extend(fails);
        badges.push(BadgeEntry { reference, definition });
    }
    Ok(AggregateOutcome { badges, failures })
}

/// List badge definitions the subject has authored, newest version per
/// discriminator, in first-discovery order.
pub async fn collect_created(
    subject: &str,
    relays: &[String],
    opts: &AggregateOptions,
) -> Result<CreatedOutcome> {
    let filter = Filter {
        authors: vec![subject.to_string()],
        kinds: vec![event::BADGE_DEFINITION],
        ..Filter::default()
    };
    let stream = fanout::spawn(relays, "created", &filter, &opts.query());
    let outcome = stream.collect(opts.stage_timeout).await;
    if outcome.connections == 0 {
        bail!("no relay reachable for created-badge lookup");
    }
    Ok(CreatedOutcome {
        badges: fold_definitions(&outcome.events),
        failures: outcome.failures,
    })
}

/// List badges awarded to the subject, each with its resolved definition.
pub async fn collect_awarded(
    subject: &str,
    relays: &[String],
    opts: &AggregateOptions,
) -> Result<AwardedOutcome> {
    let filter = Filter {
        kinds: vec![event::BADGE_AWARD],
        tags: vec![('p', vec![subject.to_string()])],
        ..Filter::default()
    };
    let stream = fanout::spawn(relays, "awards", &filter, &opts.query());
    let outcome = stream.collect(opts.stage_timeout).await;
    if outcome.connections == 0 {
        bail!("no relay reachable for award lookup");
    }
    let mut failures = outcome.failures;

    let mut pending = Vec::new();
    for ev in &outcome.events {
        let Some(value) = ev.tag_value("a") else {
            continue;
        };
        let Some((kind, author, discriminator)) = parse_triple(value) else {
            continue;
        };
        // The relay hint rides on the subject's own `p` entry.
        let suggested_relay = ev
            .tags
            .iter()
            .find(|t| {
                t.0.first().map(String::as_str) == Some("p")
                    && t.0.get(1).map(String::as_str) == Some(subject)
            })
            .and_then(|t| t.0.get(2))
            .filter(|s| !s.is_empty())
            .cloned();
        let reference = CrossReference {
            kind,
            author,
            discriminator,
            award_event_id: ev.id.clone(),
            suggested_relay,
        };
        pending.push((ev, reference));
    }

    let mut tasks = Vec::new();
    for (_, reference) in &pending {
        let reference = reference.clone();
        let relays = relays.to_vec();
        let opts = opts.clone();
        tasks.push(tokio::spawn(async move {
            resolve_definition(&reference, &relays, &opts).await
        }));
    }
    let mut badges = Vec::new();
    for ((ev, reference), task) in pending.into_iter().zip(tasks) {
        let (definition, fails) = match task.await {
            Ok(v) => v,
            Err(_) => (None, Vec::new()),
        };
        failures.extend(fails);
        badges.push(AwardedBadge {
            awarded_by: ev.pubkey.clone(),
            award_event_id: ev.id.clone(),
            created_at: ev.created_at,
            discriminator: reference.discriminator,
            definition,
        });
    }
    Ok(AwardedOutcome { badges, failures })
}

/// Fold admitted collection events into distinct references.
///
/// References keep first-discovery order. When the same triple shows up in
/// more than one event, the pairing from the newest event wins, ties broken
/// toward the smaller event id so the outcome is arrival-independent.
fn fold_references(events: &[Event]) -> Vec<CrossReference> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, (u64, String, CrossReference)> = HashMap::new();
    for ev in events {
        // Events lacking the collection marker are network noise.
        if !ev.has_tag("d", event::PROFILE_BADGES_IDENTIFIER) {
            continue;
        }
        for reference in extract_references(ev) {
            match best.entry(reference.key()) {
                Entry::Vacant(slot) => {
                    order.push(slot.key().clone());
                    slot.insert((ev.created_at, ev.id.clone(), reference));
                }
                Entry::Occupied(mut slot) => {
                    let (created_at, id, _) = slot.get();
                    if ev.created_at > *created_at
                        || (ev.created_at == *created_at && ev.id < *id)
                    {
                        slot.insert((ev.created_at, ev.id.clone(), reference));
                    }
                }
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| best.remove(&key))
        .map(|(_, _, reference)| reference)
        .collect()
}

/// Scan an event's tags for adjacent `a`/`e` pairs forming references.
fn extract_references(ev: &Event) -> Vec<CrossReference> {
    let mut refs = Vec::new();
    let mut i = 0;
    while i < ev.tags.len() {
        let tag = &ev.tags[i].0;
        if tag.first().map(String::as_str) == Some("a") {
            if let (Some(value), Some(next)) = (tag.get(1), ev.tags.get(i + 1)) {
                if next.0.first().map(String::as_str) == Some("e") {
                    if let (Some((kind, author, discriminator)), Some(award_id)) =
                        (parse_triple(value), next.0.get(1))
                    {
                        let suggested_relay =
                            next.0.get(2).filter(|s| !s.is_empty()).cloned();
                        refs.push(CrossReference {
                            kind,
                            author,
                            discriminator,
                            award_event_id: award_id.clone(),
                            suggested_relay,
                        });
                        i += 1;
                    }
                }
            }
        }
        i += 1;
    }
    refs
}

/// Newest definition per discriminator, in first-discovery order.
fn fold_definitions(events: &[Event]) -> Vec<Definition> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, (u64, String, Definition)> = HashMap::new();
    for ev in events {
        let Some(discriminator) = ev.tag_value("d") else {
            continue;
        };
        match best.entry(discriminator.to_string()) {
            Entry::Vacant(slot) => {
                order.push(slot.key().clone());
                slot.insert((ev.created_at, ev.id.clone(), Definition::from_event(ev)));
            }
            Entry::Occupied(mut slot) => {
                let (created_at, id, _) = slot.get();
                if ev.created_at > *created_at || (ev.created_at == *created_at && ev.id < *id) {
                    slot.insert((ev.created_at, ev.id.clone(), Definition::from_event(ev)));
                }
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| best.remove(&key))
        .map(|(_, _, def)| def)
        .collect()
}

/// Resolve one reference: the first relay to return a definition whose
/// discriminator matches wins; a mismatch counts as not-found on that relay.
async fn resolve_definition(
    reference: &CrossReference,
    relays: &[String],
    opts: &AggregateOptions,
) -> (Option<Definition>, Vec<SoftFailure>) {
    let candidates: Vec<String> = match &reference.suggested_relay {
        Some(url) => vec![url.clone()],
        None => relays.to_vec(),
    };
    let filter = Filter {
        authors: vec![reference.author.clone()],
        kinds: vec![reference.kind],
        tags: vec![('d', vec![reference.discriminator.clone()])],
        ..Filter::default()
    };
    let mut stream = fanout::spawn(&candidates, "resolve", &filter, &opts.query());
    let deadline = Instant::now() + opts.resolve_timeout;
    let mut found = None;
    loop {
        match timeout_at(deadline, stream.recv()).await {
            Ok(Some(ev)) => {
                let def = Definition::from_event(&ev);
                if def.discriminator == reference.discriminator {
                    found = Some(def);
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    let failures = stream.finish().await;
    (found, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::testutil::{filter_relay, sample_event, script_relay, Reply};

    fn quick_opts() -> AggregateOptions {
        AggregateOptions {
            read_timeout: Duration::from_millis(500),
            stage_timeout: Duration::from_secs(5),
            resolve_timeout: Duration::from_secs(2),
            socks: None,
        }
    }

    fn collection_event(id: &str, pubkey: &str, created_at: u64, pairs: Vec<(&str, &str)>) -> Event {
        let mut tags = vec![vec!["d", "profile_badges"]];
        for (a, e) in pairs {
            tags.push(vec!["a", a]);
            tags.push(vec!["e", e]);
        }
        sample_event(id, pubkey, event::PROFILE_BADGES, created_at, tags)
    }

    fn definition_event(id: &str, pubkey: &str, d: &str, name: &str) -> Event {
        sample_event(
            id,
            pubkey,
            event::BADGE_DEFINITION,
            1,
            vec![
                vec!["d", d],
                vec!["name", name],
                vec!["description", "desc"],
                vec!["image", "https://img"],
                vec!["thumb", "https://thumb"],
            ],
        )
    }

    #[test]
    fn extract_references_pairs_adjacent_tags() {
        let ev = sample_event(
            "col1",
            "alice",
            event::PROFILE_BADGES,
            1,
            vec![
                vec!["d", "collection"],
                vec!["a", "30009:alice:brave"],
                vec!["e", "ev1"],
                vec!["a", "30009:bob:kind2"],
                vec!["e", "ev2"],
            ],
        );
        let refs = extract_references(&ev);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].key(), "30009:alice:brave");
        assert_eq!(refs[0].award_event_id, "ev1");
        assert_eq!(refs[1].key(), "30009:bob:kind2");
        assert_eq!(refs[1].award_event_id, "ev2");
    }

    #[test]
    fn extract_references_skips_unpaired_and_malformed_tags() {
        let ev = sample_event(
            "col1",
            "alice",
            event::PROFILE_BADGES,
            1,
            vec![
                vec!["a", "30009:alice:brave"], // no `e` follows
                vec!["p", "alice"],
                vec!["a", "garbage"], // malformed triple
                vec!["e", "ev1"],
                vec!["a", "30009:bob:star"],
                vec!["e", "ev2", "wss://hint"],
            ],
        );
        let refs = extract_references(&ev);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].key(), "30009:bob:star");
        assert_eq!(refs[0].suggested_relay.as_deref(), Some("wss://hint"));
    }

    #[test]
    fn parse_triple_rejects_malformed_values() {
        assert!(parse_triple("30009:alice:brave").is_some());
        assert!(parse_triple("x:alice:brave").is_none());
        assert!(parse_triple("30009:alice").is_none());
        assert!(parse_triple("30009::brave").is_none());
        assert!(parse_triple("30009:alice:").is_none());
        // Discriminators may themselves contain colons.
        let (_, _, d) = parse_triple("30009:alice:a:b").unwrap();
        assert_eq!(d, "a:b");
    }

    #[test]
    fn fold_references_latest_pairing_wins_regardless_of_arrival() {
        let older = collection_event("aa11", "alice", 10, vec![("30009:bob:brave", "old-award")]);
        let newer = collection_event("bb22", "alice", 20, vec![("30009:bob:brave", "new-award")]);

        for events in [
            vec![older.clone(), newer.clone()],
            vec![newer.clone(), older.clone()],
        ] {
            let refs = fold_references(&events);
            assert_eq!(refs.len(), 1);
            assert_eq!(refs[0].award_event_id, "new-award");
        }
    }

    #[test]
    fn fold_references_drops_events_without_marker() {
        let ev = sample_event(
            "aa11",
            "alice",
            event::PROFILE_BADGES,
            1,
            vec![vec!["a", "30009:bob:brave"], vec!["e", "ev1"]],
        );
        assert!(fold_references(&[ev]).is_empty());
    }

    #[test]
    fn fold_definitions_latest_per_discriminator() {
        let mut newer = definition_event("bb22", "alice", "brave", "Bravery v2");
        newer.created_at = 20;
        let mut older = definition_event("aa11", "alice", "brave", "Bravery");
        older.created_at = 10;
        let other = definition_event("cc33", "alice", "star", "Star");

        let defs = fold_definitions(&[older, newer, other]);
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "Bravery v2");
        assert_eq!(defs[1].name, "Star");
    }

    #[test]
    fn definition_from_event_reads_tags() {
        let def = Definition::from_event(&definition_event("dd44", "bob", "brave", "Bravery"));
        assert_eq!(def.name, "Bravery");
        assert_eq!(def.description, "desc");
        assert_eq!(def.image_url, "https://img");
        assert_eq!(def.thumb_url, "https://thumb");
        assert_eq!(def.discriminator, "brave");
        assert_eq!(def.source_event_id, "dd44");
    }

    #[tokio::test]
    async fn mismatched_discriminator_is_not_found_on_that_relay() {
        let reference = CrossReference {
            kind: event::BADGE_DEFINITION,
            author: "bob".into(),
            discriminator: "brave".into(),
            award_event_id: "aw1".into(),
            suggested_relay: None,
        };
        // One relay answers the `#d` filter with the wrong definition; the
        // other has the real one.
        let (wrong_url, s1) = script_relay(
            vec![
                Reply::Event(definition_event("xx99", "bob", "wrong", "Wrong")),
                Reply::Eose,
            ],
            false,
        )
        .await;
        let (right_url, s2) = filter_relay(vec![definition_event("dd44", "bob", "brave", "Bravery")]).await;

        let (def, _) = resolve_definition(&reference, &[wrong_url, right_url], &quick_opts()).await;
        let def = def.unwrap();
        assert_eq!(def.discriminator, "brave");
        assert_eq!(def.source_event_id, "dd44");
        s1.abort();
        s2.abort();
    }

    #[tokio::test]
    async fn mismatched_discriminator_alone_resolves_to_absent() {
        let reference = CrossReference {
            kind: event::BADGE_DEFINITION,
            author: "bob".into(),
            discriminator: "brave".into(),
            award_event_id: "aw1".into(),
            suggested_relay: None,
        };
        let (url, server) = script_relay(
            vec![
                Reply::Event(definition_event("xx99", "bob", "wrong", "Wrong")),
                Reply::Eose,
            ],
            false,
        )
        .await;
        let (def, _) = resolve_definition(&reference, &[url], &quick_opts()).await;
        assert!(def.is_none());
        server.abort();
    }

    #[tokio::test]
    async fn aggregation_fails_hard_only_when_nothing_is_reachable() {
        let err = collect_badges("alice", &["ws://127.0.0.1:1".to_string()], &quick_opts())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no relay reachable"));
    }

    #[tokio::test]
    async fn end_to_end_two_relays_duplicate_and_partial() {
        // R1 carries the collection event and bob's "brave" definition.
        let collection = collection_event("col1", "alice", 5, vec![("30009:bob:brave", "award1")]);
        let (r1, s1) = filter_relay(vec![
            collection.clone(),
            definition_event("def1", "bob", "brave", "Bravery"),
        ])
        .await;
        // R2 redelivers the same collection event plus a second one whose
        // "star" definition no relay has.
        let extra = collection_event("col2", "alice", 6, vec![("30009:carol:star", "award2")]);
        let (r2, s2) = filter_relay(vec![collection, extra]).await;

        let outcome = collect_badges("alice", &[r1, r2], &quick_opts()).await.unwrap();

        assert_eq!(outcome.badges.len(), 2);
        let brave = outcome
            .badges
            .iter()
            .find(|b| b.reference.key() == "30009:bob:brave")
            .unwrap();
        assert_eq!(brave.reference.award_event_id, "award1");
        assert_eq!(brave.definition.as_ref().unwrap().name, "Bravery");
        let star = outcome
            .badges
            .iter()
            .find(|b| b.reference.key() == "30009:carol:star")
            .unwrap();
        assert_eq!(star.reference.award_event_id, "award2");
        assert!(star.definition.is_none());
        assert!(outcome.failures.is_empty());
        s1.abort();
        s2.abort();
    }

    #[tokio::test]
    async fn collect_created_lists_latest_definitions() {
        let mut v1 = definition_event("aa11", "alice", "brave", "Bravery");
        v1.created_at = 10;
        let mut v2 = definition_event("bb22", "alice", "brave", "Bravery v2");
        v2.created_at = 20;
        let star = definition_event("cc33", "alice", "star", "Star");
        let (url, server) = filter_relay(vec![v1, v2, star]).await;

        let outcome = collect_created("alice", &[url], &quick_opts()).await.unwrap();
        assert_eq!(outcome.badges.len(), 2);
        assert_eq!(outcome.badges[0].name, "Bravery v2");
        assert_eq!(outcome.badges[1].name, "Star");
        server.abort();
    }

    #[tokio::test]
    async fn collect_awarded_resolves_definitions() {
        let mut award = sample_event(
            "aw1",
            "bob",
            event::BADGE_AWARD,
            42,
            vec![vec!["a", "30009:bob:brave"], vec!["p", "alice"]],
        );
        award.tags.push(Tag(vec!["p".into(), "someone-else".into()]));
        let (url, server) = filter_relay(vec![
            award,
            definition_event("def1", "bob", "brave", "Bravery"),
        ])
        .await;

        let outcome = collect_awarded("alice", &[url], &quick_opts()).await.unwrap();
        assert_eq!(outcome.badges.len(), 1);
        let badge = &outcome.badges[0];
        assert_eq!(badge.awarded_by, "bob");
        assert_eq!(badge.award_event_id, "aw1");
        assert_eq!(badge.created_at, 42);
        assert_eq!(badge.discriminator, "brave");
        assert_eq!(badge.definition.as_ref().unwrap().name, "Bravery");
        server.abort();
    }

    #[tokio::test]
    async fn collect_awarded_skips_awards_without_reference() {
        let no_a_tag = sample_event("aw1", "bob", event::BADGE_AWARD, 1, vec![vec!["p", "alice"]]);
        let bad_triple = sample_event(
            "aw2",
            "bob",
            event::BADGE_AWARD,
            2,
            vec![vec!["a", "garbage"], vec!["p", "alice"]],
        );
        let (url, server) = filter_relay(vec![no_a_tag, bad_triple]).await;

        let outcome = collect_awarded("alice", &[url], &quick_opts()).await.unwrap();
        assert!(outcome.badges.is_empty());
        server.abort();
    }
}
