use std::{collections::HashMap, fmt, sync::Arc};

use serde_json::Value;
use thiserror::Error;

use crate::model::{SensorMessage, SensorType};

/// Parser failure for a whole message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// No parser registered for the sensor family.
    #[error("no parser registered for sensor type {0}")]
    NoParser(SensorType),
    /// Payload does not have the shape the parser expects.
    #[error("unsupported payload shape: {0}")]
    UnsupportedShape(String),
}

/// Decodes a sensor payload into common-shape entity objects.
///
/// Entities are returned as JSON so that the entity gate can reject each one
/// individually; decoders only normalize field names and fill defaults.
pub trait SensorParser: Send + Sync {
    /// Family this parser handles.
    fn sensor_type(&self) -> SensorType;

    /// Decodes the payload.
    fn parse(&self, message: &SensorMessage) -> Result<Vec<Value>, ParseError>;
}

/// Parser for payloads already in the common entity shape:
/// `{"entities": [...]}` or `{"entity": {...}}`.
#[derive(Debug, Clone, Copy)]
pub struct StructuredEntityParser {
    sensor_type: SensorType,
}

impl StructuredEntityParser {
    /// Parser bound to one sensor family.
    #[must_use]
    pub const fn new(sensor_type: SensorType) -> Self {
        Self { sensor_type }
    }
}

impl SensorParser for StructuredEntityParser {
    fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    fn parse(&self, message: &SensorMessage) -> Result<Vec<Value>, ParseError> {
        let items = match &message.payload {
            Value::Object(map) => match (map.get("entities"), map.get("entity")) {
                (Some(Value::Array(items)), _) => items.clone(),
                (None, Some(single @ Value::Object(_))) => vec![single.clone()],
                _ => {
                    return Err(ParseError::UnsupportedShape(
                        "expected an 'entities' array or an 'entity' object".into(),
                    ))
                }
            },
            Value::Array(items) => items.clone(),
            _ => return Err(ParseError::UnsupportedShape("payload is not an object".into())),
        };
        Ok(items
            .into_iter()
            .map(|mut item| {
                if let Value::Object(map) = &mut item {
                    map.entry("timestamp")
                        .or_insert_with(|| Value::String(message.timestamp.to_rfc3339()));
                    map.entry("entity_type")
                        .or_insert_with(|| Value::String("unknown".into()));
                    map.insert(
                        "source_sensors".into(),
                        Value::Array(vec![Value::String(message.sensor_id.clone())]),
                    );
                }
                item
            })
            .collect())
    }
}

/// Parsers keyed by sensor family.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: HashMap<SensorType, Arc<dyn SensorParser>>,
}

impl fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.parsers.keys().collect();
        kinds.sort();
        f.debug_struct("ParserRegistry")
            .field("sensor_types", &kinds)
            .finish()
    }
}

impl ParserRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the structured parser for every family.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in SensorType::ALL {
            registry.register(Arc::new(StructuredEntityParser::new(kind)));
        }
        registry
    }

    /// Installs a parser, replacing any previous one for the same family.
    pub fn register(&mut self, parser: Arc<dyn SensorParser>) {
        self.parsers.insert(parser.sensor_type(), parser);
    }

    /// Dispatches on the message's sensor family.
    pub fn parse(&self, message: &SensorMessage) -> Result<Vec<Value>, ParseError> {
        self.parsers
            .get(&message.sensor_type)
            .ok_or(ParseError::NoParser(message.sensor_type))?
            .parse(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    struct VoiceParser;

    impl SensorParser for VoiceParser {
        fn sensor_type(&self) -> SensorType {
            SensorType::Radio
        }

        fn parse(&self, message: &SensorMessage) -> Result<Vec<Value>, ParseError> {
            let text = message.payload["transcript"]
                .as_str()
                .ok_or_else(|| ParseError::UnsupportedShape("missing transcript".into()))?;
            Ok(vec![json!({ "entity_id": "radio_contact", "comments": text })])
        }
    }

    #[test]
    fn structured_parser_fills_defaults() {
        let registry = ParserRegistry::with_defaults();
        let msg = SensorMessage::new(
            "radar_01",
            SensorType::Radar,
            Utc::now(),
            json!({ "entities": [{ "entity_id": "T1", "source_sensors": ["spoofed"] }] }),
        );
        let parsed = registry.parse(&msg).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["entity_type"], "unknown");
        assert_eq!(parsed[0]["source_sensors"], json!(["radar_01"]));
    }

    #[test]
    fn custom_parser_replaces_default() {
        let mut registry = ParserRegistry::with_defaults();
        registry.register(Arc::new(VoiceParser));
        let msg = SensorMessage::new(
            "radio_02",
            SensorType::Radio,
            Utc::now(),
            json!({ "transcript": "two tanks near the bridge" }),
        );
        assert_eq!(registry.parse(&msg).unwrap()[0]["entity_id"], "radio_contact");
    }

    #[test]
    fn missing_parser_and_bad_shape() {
        let registry = ParserRegistry::new();
        let msg = SensorMessage::new("x", SensorType::Other, Utc::now(), json!({ "a": 1 }));
        assert_eq!(registry.parse(&msg), Err(ParseError::NoParser(SensorType::Other)));
        let registry = ParserRegistry::with_defaults();
        assert!(matches!(
            registry.parse(&msg),
            Err(ParseError::UnsupportedShape(_))
        ));
    }
}
