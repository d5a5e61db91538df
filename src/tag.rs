//! Event tags.
//!
//! On the wire a tag is an array whose first element names the tag type and
//! whose remaining elements hold its arguments:
//!
//! - `["e", <event id>, <relay hint>, <marker>]` references another event
//! - `["p", <pubkey>, <relay hint>, <petname>]` references an author
//! - `["a", <kind:pubkey:d>, <relay hint>]` references an addressable event
//! - `["d", <identifier>]`, `["t", <topic>]`, `["challenge", ..]`, `["relay", ..]`
//!
//! Decoding only picks a typed variant when re-encoding it reproduces the
//! exact same array; anything else is kept verbatim in [`Tag::Other`] so the
//! canonical serialization of foreign events is never altered.

use serde::{
    de::{Deserializer, Error as _},
    ser::{SerializeSeq, Serializer},
    Deserialize, Serialize,
};
use serde_json::Value;

use crate::error::{Error, Result};

pub const TAG_EVENT: &str = "e";
pub const TAG_PUBKEY: &str = "p";
pub const TAG_ADDRESS: &str = "a";
pub const TAG_IDENTIFIER: &str = "d";
pub const TAG_HASHTAG: &str = "t";
pub const TAG_CHALLENGE: &str = "challenge";
pub const TAG_RELAY: &str = "relay";

/// Position of an `e` reference within a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Root,
    Reply,
    Mention,
}

impl Marker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marker::Root => "root",
            Marker::Reply => "reply",
            Marker::Mention => "mention",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "root" => Some(Marker::Root),
            "reply" => Some(Marker::Reply),
            "mention" => Some(Marker::Mention),
            _ => None,
        }
    }
}

/// A single event tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    /// `e`: reference to another event.
    Event {
        id: String,
        relay: Option<String>,
        marker: Option<Marker>,
    },
    /// `p`: reference to another author.
    Pubkey {
        pubkey: String,
        relay: Option<String>,
        petname: Option<String>,
    },
    /// `a`: reference to an addressable event by `kind:pubkey:identifier`.
    Address {
        coordinate: String,
        relay: Option<String>,
    },
    /// `d`: identifier of an addressable event.
    Identifier(String),
    /// `t`: topic.
    Hashtag(String),
    /// `challenge`: NIP-42 auth challenge echoed back to a relay.
    Challenge(String),
    /// `relay`: relay URL, used by NIP-42 auth events.
    Relay(String),
    /// Any other tag, kept exactly as received. Never empty and the first
    /// element is always a string.
    Other(Vec<Value>),
}

impl Tag {
    pub fn event(id: impl Into<String>) -> Self {
        Tag::Event {
            id: id.into(),
            relay: None,
            marker: None,
        }
    }

    pub fn pubkey(pubkey: impl Into<String>) -> Self {
        Tag::Pubkey {
            pubkey: pubkey.into(),
            relay: None,
            petname: None,
        }
    }

    pub fn identifier(d: impl Into<String>) -> Self {
        Tag::Identifier(d.into())
    }

    pub fn hashtag(t: impl Into<String>) -> Self {
        Tag::Hashtag(t.into())
    }

    pub fn challenge(c: impl Into<String>) -> Self {
        Tag::Challenge(c.into())
    }

    pub fn relay(url: impl Into<String>) -> Self {
        Tag::Relay(url.into())
    }

    /// Build a tag from its positional wire form. This is the only place raw
    /// tag arrays are interpreted.
    pub fn from_values(values: Vec<Value>) -> Result<Self> {
        let kind = match values.first() {
            None => return Err(Error::Tag("empty tag".into())),
            Some(Value::String(s)) => s.as_str(),
            Some(other) => {
                return Err(Error::Tag(format!(
                    "tag type must be a string, got {other}"
                )))
            }
        };
        let strings: Option<Vec<&str>> = values.iter().map(|v| v.as_str()).collect();
        let typed = strings.and_then(|s| match (kind, s.len()) {
            (TAG_EVENT, 2..=4) => {
                let marker = match s.get(3) {
                    Some(m) => Some(Marker::parse(m)?),
                    None => None,
                };
                Some(Tag::Event {
                    id: s[1].to_string(),
                    relay: relay_hint(&s),
                    marker,
                })
            }
            (TAG_PUBKEY, 2..=4) => Some(Tag::Pubkey {
                pubkey: s[1].to_string(),
                relay: relay_hint(&s),
                petname: s.get(3).map(|p| p.to_string()),
            }),
            (TAG_ADDRESS, 2..=3) => Some(Tag::Address {
                coordinate: s[1].to_string(),
                relay: s.get(2).map(|r| r.to_string()),
            }),
            (TAG_IDENTIFIER, 2) => Some(Tag::Identifier(s[1].to_string())),
            (TAG_HASHTAG, 2) => Some(Tag::Hashtag(s[1].to_string())),
            (TAG_CHALLENGE, 2) => Some(Tag::Challenge(s[1].to_string())),
            (TAG_RELAY, 2) => Some(Tag::Relay(s[1].to_string())),
            _ => None,
        });
        Ok(typed.unwrap_or(Tag::Other(values)))
    }

    /// Tag type, the first element of the wire array.
    pub fn kind(&self) -> &str {
        match self {
            Tag::Event { .. } => TAG_EVENT,
            Tag::Pubkey { .. } => TAG_PUBKEY,
            Tag::Address { .. } => TAG_ADDRESS,
            Tag::Identifier(_) => TAG_IDENTIFIER,
            Tag::Hashtag(_) => TAG_HASHTAG,
            Tag::Challenge(_) => TAG_CHALLENGE,
            Tag::Relay(_) => TAG_RELAY,
            Tag::Other(values) => values.first().and_then(|v| v.as_str()).unwrap_or_default(),
        }
    }

    /// Positional wire form of the tag.
    pub fn to_values(&self) -> Vec<Value> {
        fn s(v: &str) -> Value {
            Value::String(v.to_string())
        }
        // A trailing element forces every earlier optional slot to be written.
        fn optional_tail(out: &mut Vec<Value>, slots: &[Option<&str>]) {
            let last = slots.iter().rposition(|slot| slot.is_some());
            if let Some(last) = last {
                for slot in &slots[..=last] {
                    out.push(s(slot.unwrap_or_default()));
                }
            }
        }
        match self {
            Tag::Event { id, relay, marker } => {
                let mut out = vec![s(TAG_EVENT), s(id)];
                optional_tail(
                    &mut out,
                    &[relay.as_deref(), marker.as_ref().map(Marker::as_str)],
                );
                out
            }
            Tag::Pubkey {
                pubkey,
                relay,
                petname,
            } => {
                let mut out = vec![s(TAG_PUBKEY), s(pubkey)];
                optional_tail(&mut out, &[relay.as_deref(), petname.as_deref()]);
                out
            }
            Tag::Address { coordinate, relay } => {
                let mut out = vec![s(TAG_ADDRESS), s(coordinate)];
                optional_tail(&mut out, &[relay.as_deref()]);
                out
            }
            Tag::Identifier(v) => vec![s(TAG_IDENTIFIER), s(v)],
            Tag::Hashtag(v) => vec![s(TAG_HASHTAG), s(v)],
            Tag::Challenge(v) => vec![s(TAG_CHALLENGE), s(v)],
            Tag::Relay(v) => vec![s(TAG_RELAY), s(v)],
            Tag::Other(values) => values.clone(),
        }
    }

    /// String element at `index`, failing when it is absent or not a string.
    pub fn get_str(&self, index: usize) -> Result<String> {
        match self.to_values().get(index) {
            Some(Value::String(v)) => Ok(v.clone()),
            Some(other) => Err(Error::Tag(format!(
                "element {index} of `{}` tag is not a string: {other}",
                self.kind()
            ))),
            None => Err(Error::Tag(format!(
                "`{}` tag has no element {index}",
                self.kind()
            ))),
        }
    }
}

/// Relay hint at index 2. An empty hint with a later element after it is
/// the placeholder written for "no hint".
fn relay_hint(s: &[&str]) -> Option<String> {
    match s.get(2) {
        Some(h) if h.is_empty() && s.len() > 3 => None,
        other => other.map(|h| h.to_string()),
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let values = self.to_values();
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for v in &values {
            seq.serialize_element(v)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let values = Vec::<Value>::deserialize(deserializer)?;
        Tag::from_values(values).map_err(D::Error::custom)
    }
}
