//! Typed protocol messages.
//!
//! | type     | wire form                                   |
//! |----------|---------------------------------------------|
//! | `AUTH`   | `["AUTH", <challenge>]` / `["AUTH", <event>]` |
//! | `CLOSE`  | `["CLOSE", <sub id>]`                        |
//! | `COUNT`  | `["COUNT", <sub id>, <filter>...]` / `["COUNT", <sub id>, {"count": n}]` |
//! | `EOSE`   | `["EOSE", <sub id>]`                         |
//! | `EVENT`  | `["EVENT", <sub id>, <event>]` / `["EVENT", <event>]` |
//! | `NOTICE` | `["NOTICE", <message>]`                      |
//! | `OK`     | `["OK", <event id>, <bool>, <message>]`      |
//! | `REQ`    | `["REQ", <sub id>, <filter>, ...]`           |

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    envelope::Envelope,
    error::{Error, Result},
    event::Event,
    subscription,
};

/// Message type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Auth,
    Close,
    Count,
    Eose,
    Event,
    Notice,
    Ok,
    Req,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::Auth,
        MessageType::Close,
        MessageType::Count,
        MessageType::Eose,
        MessageType::Event,
        MessageType::Notice,
        MessageType::Ok,
        MessageType::Req,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Auth => "AUTH",
            MessageType::Close => "CLOSE",
            MessageType::Count => "COUNT",
            MessageType::Eose => "EOSE",
            MessageType::Event => "EVENT",
            MessageType::Notice => "NOTICE",
            MessageType::Ok => "OK",
            MessageType::Req => "REQ",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Envelope(format!("unknown message type `{s}`")))
    }
}

/// Subscription filter. Conditions within one filter must all hold; the
/// filters of a `REQ` are alternatives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    /// Events referenced by an `e` tag.
    #[serde(rename = "#e", default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
    /// Pubkeys referenced by a `p` tag.
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I: IntoIterator<Item = S>, S: Into<String>>(mut self, authors: I) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I: IntoIterator<Item = u16>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn events<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.events = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn pubkeys<I: IntoIterator<Item = S>, S: Into<String>>(mut self, pubkeys: I) -> Self {
        self.pubkeys = Some(pubkeys.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }
}

/// Payload of an `AUTH` message.
#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    /// Relay to client.
    Challenge(String),
    /// Client to relay: a signed kind-22242 event.
    Event(Arc<Event>),
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Auth(Auth),
    Close {
        subscription_id: String,
    },
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    CountResult {
        subscription_id: String,
        count: u64,
    },
    Eose {
        subscription_id: String,
    },
    /// `subscription_id` is `None` when a client publishes, `Some` when a
    /// relay delivers to a subscription.
    Event {
        subscription_id: Option<String>,
        event: Arc<Event>,
    },
    Notice {
        message: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
}

#[derive(Serialize, Deserialize)]
struct CountBody {
    count: u64,
}

impl Message {
    pub fn auth_challenge(challenge: impl Into<String>) -> Self {
        Message::Auth(Auth::Challenge(challenge.into()))
    }

    pub fn auth_event(event: impl Into<Arc<Event>>) -> Self {
        Message::Auth(Auth::Event(event.into()))
    }

    pub fn close(subscription_id: impl Into<String>) -> Result<Self> {
        let subscription_id = checked(subscription_id)?;
        Ok(Message::Close { subscription_id })
    }

    pub fn count(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Result<Self> {
        let subscription_id = checked(subscription_id)?;
        Ok(Message::Count {
            subscription_id,
            filters,
        })
    }

    pub fn count_result(subscription_id: impl Into<String>, count: u64) -> Result<Self> {
        let subscription_id = checked(subscription_id)?;
        Ok(Message::CountResult {
            subscription_id,
            count,
        })
    }

    pub fn eose(subscription_id: impl Into<String>) -> Result<Self> {
        let subscription_id = checked(subscription_id)?;
        Ok(Message::Eose { subscription_id })
    }

    /// Event delivered on a subscription.
    pub fn event(subscription_id: impl Into<String>, event: impl Into<Arc<Event>>) -> Result<Self> {
        let subscription_id = checked(subscription_id)?;
        Ok(Message::Event {
            subscription_id: Some(subscription_id),
            event: event.into(),
        })
    }

    /// Event sent by a client for the relay to store and forward.
    pub fn publish(event: impl Into<Arc<Event>>) -> Self {
        Message::Event {
            subscription_id: None,
            event: event.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Message::Notice {
            message: message.into(),
        }
    }

    pub fn ok(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        Message::Ok {
            event_id: event_id.into(),
            accepted,
            message: message.into(),
        }
    }

    /// Subscription request; at least one filter is required.
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Result<Self> {
        let subscription_id = checked(subscription_id)?;
        if filters.is_empty() {
            return Err(Error::Envelope("REQ needs at least one filter".into()));
        }
        Ok(Message::Req {
            subscription_id,
            filters,
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Auth(_) => MessageType::Auth,
            Message::Close { .. } => MessageType::Close,
            Message::Count { .. } | Message::CountResult { .. } => MessageType::Count,
            Message::Eose { .. } => MessageType::Eose,
            Message::Event { .. } => MessageType::Event,
            Message::Notice { .. } => MessageType::Notice,
            Message::Ok { .. } => MessageType::Ok,
            Message::Req { .. } => MessageType::Req,
        }
    }

    /// Subscription this message belongs to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Message::Close { subscription_id }
            | Message::Count {
                subscription_id, ..
            }
            | Message::CountResult {
                subscription_id, ..
            }
            | Message::Eose { subscription_id }
            | Message::Req {
                subscription_id, ..
            } => Some(subscription_id),
            Message::Event {
                subscription_id, ..
            } => subscription_id.as_deref(),
            _ => None,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope> {
        let mut env = Envelope::new(self.message_type().as_str());
        match self {
            Message::Auth(Auth::Challenge(challenge)) => env.push(challenge)?,
            Message::Auth(Auth::Event(event)) => env.push(event.as_ref())?,
            Message::Close { subscription_id } | Message::Eose { subscription_id } => {
                env.push(subscription_id)?
            }
            Message::Count {
                subscription_id,
                filters,
            }
            | Message::Req {
                subscription_id,
                filters,
            } => {
                env.push(subscription_id)?;
                for filter in filters {
                    env.push(filter)?;
                }
            }
            Message::CountResult {
                subscription_id,
                count,
            } => {
                env.push(subscription_id)?;
                env.push(&CountBody { count: *count })?;
            }
            Message::Event {
                subscription_id,
                event,
            } => {
                if let Some(id) = subscription_id {
                    env.push(id)?;
                }
                env.push(event.as_ref())?;
            }
            Message::Notice { message } => env.push(message)?,
            Message::Ok {
                event_id,
                accepted,
                message,
            } => {
                env.push(event_id)?;
                env.push(accepted)?;
                env.push(message)?;
            }
        }
        Ok(env)
    }

    pub fn to_json(&self) -> Result<String> {
        self.to_envelope()?.to_json()
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Envelope::from_json(data)?.try_into()
    }
}

impl TryFrom<Envelope> for Message {
    type Error = Error;

    fn try_from(env: Envelope) -> Result<Self> {
        let message_type: MessageType = env
            .message_type()
            .ok_or_else(|| Error::Envelope("missing message type".into()))?
            .parse()?;
        match message_type {
            MessageType::Auth => match env.value(1)? {
                Value::String(challenge) => Ok(Message::auth_challenge(challenge.clone())),
                _ => Ok(Message::auth_event(env.get::<Event>(1)?)),
            },
            MessageType::Close => Message::close(env.get_str(1)?),
            MessageType::Count => {
                let id = env.get_str(1)?;
                if env.len() == 3 && is_count_body(env.value(2)?) {
                    let body: CountBody = env.get(2)?;
                    return Message::count_result(id, body.count);
                }
                Message::count(id, filters_from(&env)?)
            }
            MessageType::Eose => Message::eose(env.get_str(1)?),
            MessageType::Event => match env.len() {
                2 => Ok(Message::publish(env.get::<Event>(1)?)),
                _ => Message::event(env.get_str(1)?, env.get::<Event>(2)?),
            },
            MessageType::Notice => Ok(Message::notice(env.get_str(1)?)),
            MessageType::Ok => {
                let message = match env.len() {
                    3 => String::new(),
                    _ => env.get_str(3)?.to_string(),
                };
                Ok(Message::ok(env.get_str(1)?, env.get::<bool>(2)?, message))
            }
            MessageType::Req => Message::req(env.get_str(1)?, filters_from(&env)?),
        }
    }
}

impl TryFrom<&Message> for Envelope {
    type Error = Error;

    fn try_from(message: &Message) -> Result<Self> {
        message.to_envelope()
    }
}

fn checked(subscription_id: impl Into<String>) -> Result<String> {
    let id = subscription_id.into();
    subscription::validate(&id)?;
    Ok(id)
}

fn filters_from(env: &Envelope) -> Result<Vec<Filter>> {
    (2..env.len()).map(|i| env.get::<Filter>(i)).collect()
}

fn is_count_body(v: &Value) -> bool {
    v.as_object()
        .is_some_and(|obj| obj.len() == 1 && obj.get("count").is_some_and(Value::is_u64))
}
