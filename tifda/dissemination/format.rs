use std::{fmt, fmt::Write as _, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_event_bus::QualityOfService;
use tifda_cop::model::{Dimension, EntityCop, IffClassification, ThreatLevel};
use uuid::Uuid;

use crate::{engine::DisseminationDecision, recipient::ConfigError, release::effective_criticality};

/// Wire format a recipient accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Structured JSON document.
    #[default]
    Json,
    /// Cursor-on-Target style XML.
    Cot,
    /// Plain sentences for text-to-speech relays.
    VoiceText,
}

impl OutputFormat {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cot => "cot",
            Self::VoiceText => "voice_text",
        }
    }

    /// MIME type of the body.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Cot => "application/xml",
            Self::VoiceText => "text/plain",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "json" => Ok(Self::Json),
            "cot" | "xml" => Ok(Self::Cot),
            "voice_text" | "voice" | "text" => Ok(Self::VoiceText),
            _ => Err(ConfigError::UnknownFormat(s.to_string())),
        }
    }
}

/// A decision rendered for the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormattedMessage {
    /// Message id, used by delivery tracking.
    pub message_id: Uuid,
    /// Decision the message renders.
    pub decision_id: Uuid,
    /// Recipient.
    pub recipient_id: String,
    /// Channel.
    pub topic: String,
    /// Broker guarantee.
    pub qos: QualityOfService,
    /// Format of `body`.
    pub format: OutputFormat,
    /// Rendered payload.
    pub body: String,
}

/// Topic every recipient output is published on.
#[must_use]
pub fn output_topic(recipient_id: &str) -> String {
    format!("tifda/output/{recipient_id}")
}

/// Broker guarantee for a criticality.
#[must_use]
pub const fn qos_for(criticality: ThreatLevel) -> QualityOfService {
    match criticality {
        ThreatLevel::Critical => QualityOfService::ExactlyOnce,
        ThreatLevel::High | ThreatLevel::Medium => QualityOfService::AtLeastOnce,
        ThreatLevel::Low => QualityOfService::AtMostOnce,
    }
}

/// Renders decisions into recipient wire formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatAdapter;

impl FormatAdapter {
    /// Renders `decision` as `format`.
    pub fn render(decision: &DisseminationDecision, format: OutputFormat) -> Result<FormattedMessage, serde_json::Error> {
        let body = match format {
            OutputFormat::Json => render_json(decision)?,
            OutputFormat::Cot => render_cot(decision),
            OutputFormat::VoiceText => render_voice(decision),
        };
        Ok(FormattedMessage {
            message_id: Uuid::new_v4(),
            decision_id: decision.decision_id,
            recipient_id: decision.recipient_id.clone(),
            topic: output_topic(&decision.recipient_id),
            qos: qos_for(effective_criticality(decision)),
            format,
            body,
        })
    }
}

fn render_json(decision: &DisseminationDecision) -> Result<String, serde_json::Error> {
    serde_json::to_string(&json!({
        "message_type": "tifda.cop.update",
        "recipient_id": decision.recipient_id,
        "classification": decision.highest_classification_sent,
        "criticality": decision.criticality,
        "snapshot_version": decision.snapshot_version,
        "generated_at": decision.created_at,
        "entities": decision.entities,
    }))
}

fn cot_type(entity: &EntityCop) -> String {
    let affiliation = match entity.classification {
        IffClassification::Friendly => 'f',
        IffClassification::Hostile => 'h',
        IffClassification::Neutral => 'n',
        IffClassification::Unknown => 'u',
    };
    let dimension = match entity.dimension() {
        Dimension::Air => 'A',
        Dimension::Ground => 'G',
        Dimension::SeaSurface => 'S',
        Dimension::SeaSubsurface => 'U',
        Dimension::Space => 'P',
        Dimension::Cyber | Dimension::Other => 'X',
    };
    format!("a-{affiliation}-{dimension}")
}

fn xml_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn cot_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn render_cot(decision: &DisseminationDecision) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<events>\n");
    for entity in &decision.entities {
        let stale = entity.timestamp + Duration::minutes(5);
        let _ = write!(
            xml,
            "  <event version=\"2.0\" uid=\"{uid}\" type=\"{kind}\" time=\"{time}\" start=\"{time}\" stale=\"{stale}\" how=\"m-g\">\n    <point lat=\"{lat:.6}\" lon=\"{lon:.6}\" hae=\"{hae:.1}\" ce=\"9999999.0\" le=\"9999999.0\"/>\n    <detail>\n      <remarks>{remarks}</remarks>\n    </detail>\n  </event>\n",
            uid = xml_escape(&entity.entity_id),
            kind = cot_type(entity),
            time = cot_time(entity.timestamp),
            stale = cot_time(stale),
            lat = entity.location.lat,
            lon = entity.location.lon,
            hae = entity.location.alt.unwrap_or(0.0),
            remarks = xml_escape(
                format!(
                    "{} {} {}",
                    entity.entity_type,
                    entity.information_classification,
                    entity.comments.as_deref().unwrap_or("")
                )
                .trim()
            ),
        );
    }
    xml.push_str("</events>\n");
    xml
}

fn render_voice(decision: &DisseminationDecision) -> String {
    let mut lines = vec![format!(
        "{} update for {}. {} contacts.",
        decision.highest_classification_sent.as_str().replace('_', " "),
        decision.recipient_id,
        decision.entities.len()
    )];
    for entity in &decision.entities {
        let mut line = format!(
            "{} {} at {:.2} north, {:.2} east",
            entity.classification, entity.entity_type, entity.location.lat, entity.location.lon
        );
        if let Some(speed) = entity.speed_kmh {
            let _ = write!(line, ", moving {speed:.0} kilometers per hour");
        }
        if let Some(heading) = entity.heading {
            let _ = write!(line, " heading {heading:03.0}");
        }
        line.push('.');
        lines.push(line);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tifda_cop::model::{InformationClassification, Location};

    fn decision(criticality: ThreatLevel, is_deception: bool) -> DisseminationDecision {
        let mut entity = EntityCop::new("h<1>", "fighter", Location::new(39.5, -0.4).with_alt(9000.0), Utc::now(), 0.9);
        entity.classification = IffClassification::Hostile;
        entity.speed_kmh = Some(850.0);
        entity.heading = Some(90.0);
        DisseminationDecision {
            decision_id: Uuid::new_v4(),
            recipient_id: "base_alpha".into(),
            information_subset: vec![entity.entity_id.clone()],
            entities: vec![entity],
            decoy_ids: Vec::new(),
            highest_classification_sent: InformationClassification::Secret,
            requires_human_approval: false,
            approval_reasons: Vec::new(),
            is_deception,
            criticality,
            snapshot_version: 4,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn topic_and_qos_follow_criticality() {
        let message = FormatAdapter::render(&decision(ThreatLevel::Critical, false), OutputFormat::Json).unwrap();
        assert_eq!(message.topic, "tifda/output/base_alpha");
        assert_eq!(message.qos.level(), 2);
        let message = FormatAdapter::render(&decision(ThreatLevel::Medium, false), OutputFormat::Json).unwrap();
        assert_eq!(message.qos.level(), 1);
        let message = FormatAdapter::render(&decision(ThreatLevel::Low, false), OutputFormat::Json).unwrap();
        assert_eq!(message.qos.level(), 0);
        let message = FormatAdapter::render(&decision(ThreatLevel::Low, true), OutputFormat::Json).unwrap();
        assert_eq!(message.qos.level(), 2);
    }

    #[test]
    fn json_body_hides_decoy_markers() {
        let mut d = decision(ThreatLevel::Low, true);
        d.decoy_ids = vec![d.information_subset[0].clone()];
        let message = FormatAdapter::render(&d, OutputFormat::Json).unwrap();
        let body: serde_json::Value = serde_json::from_str(&message.body).unwrap();
        assert_eq!(body["entities"][0]["entity_id"], "h<1>");
        assert!(!message.body.contains("decoy"));
        assert!(!message.body.contains("is_deception"));
    }

    #[test]
    fn cot_events_are_escaped_and_typed() {
        let message = FormatAdapter::render(&decision(ThreatLevel::High, false), OutputFormat::Cot).unwrap();
        assert!(message.body.contains("uid=\"h&lt;1&gt;\""));
        assert!(message.body.contains("type=\"a-h-A\""));
        assert!(message.body.contains("hae=\"9000.0\""));
        assert_eq!(message.format.content_type(), "application/xml");
    }

    #[test]
    fn voice_text_reads_naturally() {
        let message = FormatAdapter::render(&decision(ThreatLevel::High, false), OutputFormat::VoiceText).unwrap();
        assert!(message.body.starts_with("SECRET update for base_alpha. 1 contacts."));
        assert!(message.body.contains("hostile fighter at 39.50 north, -0.40 east, moving 850 kilometers per hour heading 090."));
    }

    #[test]
    fn format_names() {
        assert_eq!("voice_text".parse::<OutputFormat>().unwrap(), OutputFormat::VoiceText);
        assert_eq!("COT".parse::<OutputFormat>().unwrap(), OutputFormat::Cot);
        assert!(matches!("pdf".parse::<OutputFormat>(), Err(ConfigError::UnknownFormat(_))));
    }
}
