//! Raw wire envelopes.
//!
//! Every protocol message is a JSON array whose first element names the
//! message type. [`Envelope`] is that array before it is interpreted; the
//! typed view lives in [`crate::message`].

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Ordered list of JSON values making up one wire message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    values: Vec<Value>,
}

impl Envelope {
    /// Envelope holding just the type discriminant.
    pub fn new(message_type: &str) -> Self {
        Self {
            values: vec![Value::String(message_type.to_string())],
        }
    }

    /// Append `value` to the end of the envelope.
    pub fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.values.push(serde_json::to_value(value)?);
        Ok(())
    }

    /// Builder form of [`Envelope::push`].
    pub fn with<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.push(value)?;
        Ok(self)
    }

    /// Message type, or `None` when the envelope is empty or its first
    /// element is not a string.
    pub fn message_type(&self) -> Option<&str> {
        self.values.first().and_then(Value::as_str)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// String element at `index`.
    pub fn get_str(&self, index: usize) -> Result<&str> {
        self.value(index)?.as_str().ok_or_else(|| {
            Error::Envelope(format!("element {index} of {} is not a string", self.label()))
        })
    }

    /// Element at `index` decoded as `T`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        T::deserialize(self.value(index)?).map_err(|e| {
            Error::Envelope(format!("element {index} of {}: {e}", self.label()))
        })
    }

    /// Raw element at `index`.
    pub fn value(&self, index: usize) -> Result<&Value> {
        self.values.get(index).ok_or_else(|| {
            Error::Envelope(format!(
                "{} has {} elements, element {index} is missing",
                self.label(),
                self.values.len()
            ))
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.values)?)
    }

    /// Parse a wire array. Anything other than a JSON array is rejected.
    pub fn from_json(data: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(data)? {
            Value::Array(values) => Ok(Self { values }),
            other => Err(Error::Envelope(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            ))),
        }
    }

    fn label(&self) -> String {
        match self.message_type() {
            Some(t) => format!("{t} envelope"),
            None => "envelope".to_string(),
        }
    }
}

impl From<Vec<Value>> for Envelope {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_envelope_has_no_type() {
        assert_eq!(Envelope::default().message_type(), None);
        assert_eq!(Envelope::from_json("[]").unwrap().message_type(), None);
        assert_eq!(Envelope::from_json("[1]").unwrap().message_type(), None);
    }

    #[test]
    fn round_trip_keeps_values() {
        let env = Envelope::new("OK")
            .with("abc")
            .unwrap()
            .with(&true)
            .unwrap()
            .with("")
            .unwrap();
        let json = env.to_json().unwrap();
        assert_eq!(json, r#"["OK","abc",true,""]"#);
        let back = Envelope::from_json(&json).unwrap();
        assert_eq!(back.values(), env.values());
        assert_eq!(back.message_type(), Some("OK"));
        assert_eq!(back.len(), 4);
    }

    #[test]
    fn typed_getters() {
        let env = Envelope::from(vec![json!("COUNT"), json!("sub"), json!({"count": 3})]);
        assert_eq!(env.get_str(1).unwrap(), "sub");
        assert_eq!(env.get::<Value>(2).unwrap()["count"], 3);

        let err = env.get_str(2).unwrap_err().to_string();
        assert!(err.contains("element 2"), "{err}");
        let err = env.get::<bool>(1).unwrap_err().to_string();
        assert!(err.contains("element 1"), "{err}");
        let err = env.get_str(7).unwrap_err().to_string();
        assert!(err.contains("element 7 is missing"), "{err}");
    }

    #[test]
    fn rejects_non_array_json() {
        assert!(matches!(
            Envelope::from_json(r#"{"a":1}"#),
            Err(Error::Envelope(_))
        ));
        assert!(matches!(Envelope::from_json("[1,"), Err(Error::Json(_))));
    }
}
