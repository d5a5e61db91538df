//! Configuration loading from `.env` files.

use std::{collections::BTreeMap, env};

use anyhow::{bail, Context, Result};

use crate::{
    dispatch::DEFAULT_MAX_HANDLERS,
    info::{InformationDocument, Limitation},
    subscription,
};

/// Default cap on inbound frame size, in bytes.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 64_000_000;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// WebSocket/HTTP bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    pub relay_name: Option<String>,
    pub relay_description: Option<String>,
    /// Operator pubkey (hex) advertised in the information document.
    pub relay_pubkey: Option<String>,
    pub relay_contact: Option<String>,
    /// NIP-05 names served from `/.well-known/nostr.json`.
    pub nip05_names: BTreeMap<String, String>,
    /// Reject inbound events whose id or signature does not check out.
    pub verify_sig: bool,
    /// Handler invocations allowed to run at once.
    pub max_handlers: usize,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_length: usize,
    /// Optional Tor SOCKS proxy (host:port) for outbound dials.
    pub tor_socks: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let bind_ws = env::var("BIND_WS").context("BIND_WS is not set")?;
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1";
        let nip05_names = csv_pairs(env::var("NIP05_NAMES").unwrap_or_default())?;
        let max_handlers = parse_or("MAX_HANDLERS", DEFAULT_MAX_HANDLERS)?;
        let max_message_length = parse_or("MAX_MESSAGE_LENGTH", DEFAULT_MAX_MESSAGE_LENGTH)?;
        Ok(Self {
            bind_ws,
            relay_name: non_empty("RELAY_NAME"),
            relay_description: non_empty("RELAY_DESCRIPTION"),
            relay_pubkey: non_empty("RELAY_PUBKEY"),
            relay_contact: non_empty("RELAY_CONTACT"),
            nip05_names,
            verify_sig,
            max_handlers,
            max_message_length,
            tor_socks: non_empty("TOR_SOCKS"),
        })
    }

    /// NIP-11 document describing a relay run with these settings.
    pub fn information_document(&self) -> InformationDocument {
        InformationDocument {
            name: self.relay_name.clone(),
            description: self.relay_description.clone(),
            pubkey: self.relay_pubkey.clone(),
            contact: self.relay_contact.clone(),
            limitation: Some(Limitation {
                max_message_length: Some(self.max_message_length as u64),
                max_subid_length: Some(subscription::MAX_LEN as u64),
                ..Default::default()
            }),
            ..InformationDocument::for_software()
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|s| !s.trim().is_empty())
}

fn parse_or(var: &str, default: usize) -> Result<usize> {
    match non_empty(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{var} must be a number, got `{raw}`")),
        None => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Parse `key=value,key=value` into a map.
pub fn csv_pairs(input: impl AsRef<str>) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for entry in csv_strings(input) {
        let Some((k, v)) = entry.split_once('=') else {
            bail!("expected key=value, got `{entry}`");
        };
        let (k, v) = (k.trim(), v.trim());
        if k.is_empty() || v.is_empty() {
            bail!("expected key=value, got `{entry}`");
        }
        out.insert(k.to_string(), v.to_string());
    }
    Ok(out)
}
