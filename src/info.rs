//! Documents a relay serves over plain HTTP.
//!
//! - NIP-11 relay information, returned for `GET /` with
//!   `Accept: application/nostr+json`
//! - NIP-05 identifiers, returned for `GET /.well-known/nostr.json?name=`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Media type clients send to ask for the information document.
pub const NOSTR_JSON: &str = "application/nostr+json";

/// NIPs implemented by this crate.
pub const SUPPORTED_NIPS: &[u16] = &[1, 11, 42, 45];

/// NIP-11 relay information document. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InformationDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Administrative contact pubkey (hex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_nips: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limitation: Option<Limitation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relay_countries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub language_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posting_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payments_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees: Option<Fees>,
}

impl InformationDocument {
    /// Document advertising this software, its version and supported NIPs.
    pub fn for_software() -> Self {
        Self {
            software: Some(env!("CARGO_PKG_NAME").into()),
            version: Some(env!("CARGO_PKG_VERSION").into()),
            supported_nips: SUPPORTED_NIPS.to_vec(),
            ..Default::default()
        }
    }
}

/// Limits a relay announces. Announcing a limit does not enforce it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Limitation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_filters: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_subid_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_prefix: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_event_tags: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_pow_difficulty: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auth_required: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub payment_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fees {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admission: Vec<Fee>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscription: Vec<Fee>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publication: Vec<Fee>,
}

/// One fee schedule entry, e.g. `{"amount": 1000000, "unit": "msats"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub amount: u64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
}

/// NIP-05 `nostr.json` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentifierDocument {
    pub names: BTreeMap<String, String>,
    /// Relay URLs keyed by pubkey.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relays: BTreeMap<String, Vec<String>>,
}

impl IdentifierDocument {
    /// Subset of `names` answering a lookup for `name`. With no name the
    /// whole directory is returned.
    pub fn lookup(
        names: &BTreeMap<String, String>,
        relays: &[String],
        name: Option<&str>,
    ) -> Self {
        let names: BTreeMap<String, String> = match name {
            Some(name) => names
                .get(name)
                .map(|pk| (name.to_string(), pk.clone()))
                .into_iter()
                .collect(),
            None => names.clone(),
        };
        let relays = if relays.is_empty() {
            BTreeMap::new()
        } else {
            names
                .values()
                .map(|pk| (pk.clone(), relays.to_vec()))
                .collect()
        };
        Self { names, relays }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn information_document_omits_empty_fields() {
        let doc = InformationDocument {
            name: Some("test".into()),
            limitation: Some(Limitation {
                max_message_length: Some(16384),
                auth_required: false,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&doc).unwrap(),
            r#"{"name":"test","limitation":{"max_message_length":16384}}"#
        );
    }

    #[test]
    fn parses_published_documents() {
        let raw = r#"{
            "name": "relay",
            "supported_nips": [1, 11],
            "software": "x",
            "limitation": {"payment_required": true},
            "fees": {"admission": [{"amount": 1000000, "unit": "msats"}]},
            "unknown_field": 1
        }"#;
        let doc: InformationDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.supported_nips, vec![1, 11]);
        assert!(doc.limitation.unwrap().payment_required);
        assert_eq!(doc.fees.unwrap().admission[0].unit, "msats");
    }

    #[test]
    fn software_defaults() {
        let doc = InformationDocument::for_software();
        assert_eq!(doc.software.as_deref(), Some("nostrwire"));
        assert!(doc.supported_nips.contains(&1));
    }

    #[test]
    fn identifier_lookup() {
        let mut names = BTreeMap::new();
        names.insert("bob".to_string(), "b0b".to_string());
        names.insert("alice".to_string(), "a11ce".to_string());

        let doc = IdentifierDocument::lookup(&names, &["wss://r".into()], Some("bob"));
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            serde_json::json!({"names": {"bob": "b0b"}, "relays": {"b0b": ["wss://r"]}})
        );
        let doc = IdentifierDocument::lookup(&names, &[], Some("carol"));
        assert_eq!(serde_json::to_string(&doc).unwrap(), r#"{"names":{}}"#);
        assert_eq!(IdentifierDocument::lookup(&names, &[], None).names.len(), 2);
    }
}
