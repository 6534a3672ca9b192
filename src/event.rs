//! Nostr event model.

use serde::{Deserialize, Serialize};

/// Kind number of user metadata events.
pub const METADATA: u32 = 0;
/// Kind number of badge award events.
pub const BADGE_AWARD: u32 = 8;
/// Kind number of NIP-65 relay-list events.
pub const RELAY_LIST: u32 = 10002;
/// Kind number of profile-badges collection events.
pub const PROFILE_BADGES: u32 = 30008;
/// Kind number of badge definition events.
pub const BADGE_DEFINITION: u32 = 30009;
/// `d` tag value marking a profile-badges collection event.
pub const PROFILE_BADGES_IDENTIFIER: &str = "profile_badges";

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and
/// the following elements hold data. The tags this tool cares about:
///
/// - `d` – identifier of a replaceable event (the badge discriminator)
/// - `a` – reference to a replaceable event as `kind:pubkey:identifier`
/// - `e` – links to another event ID, optionally followed by a relay hint
/// - `p` – references another author's public key
/// - `r` – a relay URL in a NIP-65 relay list
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Core Nostr event as delivered by relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "npub...",
///   "kind": 30008,
///   "created_at": 1700000000,
///   "tags": [["d", "profile_badges"], ["a", "30009:alice:brave"], ["e", "ev1"]],
///   "content": "",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash). Two events with the same id
    /// are the same logical event no matter which relay delivered them.
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `8` or `30009`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags such as `d` (identifier) or `a` (reference).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash (verification is delegated).
    pub sig: String,
}

impl Event {
    /// Value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.0.first().map(String::as_str) == Some(name))
            .and_then(|t| t.0.get(1))
            .map(String::as_str)
    }

    /// Whether any tag pairs `name` with `value`.
    pub fn has_tag(&self, name: &str, value: &str) -> bool {
        self.tags.iter().any(|t| {
            t.0.first().map(String::as_str) == Some(name)
                && t.0.get(1).map(String::as_str) == Some(value)
        })
    }
}
