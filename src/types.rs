use crate::error::{PipelineError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type PartitionKey = String;
pub type ChannelName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    MarketTrend,
    CustomerInteraction,
    EcosystemFeedback,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [
        SourceType::MarketTrend,
        SourceType::CustomerInteraction,
        SourceType::EcosystemFeedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::MarketTrend => "market_trend",
            SourceType::CustomerInteraction => "customer_interaction",
            SourceType::EcosystemFeedback => "ecosystem_feedback",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "market_trend" => Ok(SourceType::MarketTrend),
            "customer_interaction" => Ok(SourceType::CustomerInteraction),
            "ecosystem_feedback" => Ok(SourceType::EcosystemFeedback),
            other => Err(PipelineError::UnknownSourceType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
}

/// Sentiment attached to customer interactions by the enrichment stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub score: f64,
    pub label: SentimentLabel,
    pub classified_at: DateTime<Utc>,
}

impl Enrichment {
    /// Scores strictly above `positive_threshold` are labelled positive.
    pub fn from_score(score: f64, positive_threshold: f64) -> Self {
        let label = if score > positive_threshold {
            SentimentLabel::Positive
        } else {
            SentimentLabel::Negative
        };
        Self {
            score,
            label,
            classified_at: Utc::now(),
        }
    }
}

/// A unit of ingested data.
///
/// Fields are private: the source type and creation time never change after
/// ingestion and the enrichment slot can be filled at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    source_type: SourceType,
    payload: Bytes,
    partition_key: PartitionKey,
    created_at: DateTime<Utc>,
    enrichment: Option<Enrichment>,
}

impl Record {
    pub fn new(
        source_type: SourceType,
        partition_key: impl Into<PartitionKey>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            source_type,
            payload: payload.into(),
            partition_key: partition_key.into(),
            created_at: Utc::now(),
            enrichment: None,
        }
    }

    /// Market data keyed by its market segment.
    pub fn market_trend(segment_id: &str, payload: impl Into<Bytes>) -> Self {
        Self::new(SourceType::MarketTrend, format!("segment:{}", segment_id), payload)
    }

    /// Customer events keyed by customer id.
    pub fn customer_interaction(customer_id: &str, payload: impl Into<Bytes>) -> Self {
        Self::new(
            SourceType::CustomerInteraction,
            format!("customer:{}", customer_id),
            payload,
        )
    }

    /// Ecosystem feedback keyed by the submitting source.
    pub fn ecosystem_feedback(feedback_source: &str, payload: impl Into<Bytes>) -> Self {
        Self::new(
            SourceType::EcosystemFeedback,
            format!("feedback:{}", feedback_source),
            payload,
        )
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn enrichment(&self) -> Option<&Enrichment> {
        self.enrichment.as_ref()
    }

    pub fn set_enrichment(&mut self, enrichment: Enrichment) -> Result<()> {
        if self.source_type != SourceType::CustomerInteraction {
            return Err(PipelineError::InvalidOperation(format!(
                "enrichment is only defined for customer interactions, record {} is {}",
                self.id, self.source_type
            )));
        }
        if self.enrichment.is_some() {
            return Err(PipelineError::InvalidOperation(format!(
                "record {} is already enriched",
                self.id
            )));
        }
        self.enrichment = Some(enrichment);
        Ok(())
    }

    /// Text handed to the classifier: the `text` field of a JSON object
    /// payload, otherwise the whole payload read as UTF-8.
    pub fn text(&self) -> String {
        if let Ok(serde_json::Value::Object(map)) =
            serde_json::from_slice::<serde_json::Value>(&self.payload)
        {
            if let Some(serde_json::Value::String(text)) = map.get("text") {
                return text.clone();
            }
        }
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Bytes handed to the message bus.
    pub fn to_envelope(&self) -> Result<Bytes> {
        let payload = match serde_json::from_slice::<serde_json::Value>(&self.payload) {
            Ok(value) => value,
            Err(_) => serde_json::Value::String(String::from_utf8_lossy(&self.payload).into_owned()),
        };

        let envelope = Envelope {
            id: self.id,
            source_type: self.source_type,
            partition_key: &self.partition_key,
            created_at: self.created_at,
            payload,
            enrichment: self.enrichment.as_ref(),
        };

        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    id: RecordId,
    source_type: SourceType,
    partition_key: &'a str,
    created_at: DateTime<Utc>,
    payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    enrichment: Option<&'a Enrichment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_constructors_derive_partition_key() {
        let market = Record::market_trend("technology", "{}");
        assert_eq!(market.partition_key(), "segment:technology");
        assert_eq!(market.source_type(), SourceType::MarketTrend);

        let customer = Record::customer_interaction("C1234", "{}");
        assert_eq!(customer.partition_key(), "customer:C1234");

        let feedback = Record::ecosystem_feedback("partner-portal", "{}");
        assert_eq!(feedback.partition_key(), "feedback:partner-portal");
    }

    #[test]
    fn test_enrichment_is_write_once() {
        let mut record = Record::customer_interaction("C1", r#"{"text":"Great product!"}"#);
        record.set_enrichment(Enrichment::from_score(0.9, 0.5)).unwrap();

        let second = record.set_enrichment(Enrichment::from_score(0.1, 0.5));
        assert!(matches!(second, Err(PipelineError::InvalidOperation(_))));
        assert_eq!(record.enrichment().unwrap().label, SentimentLabel::Positive);
    }

    #[test]
    fn test_enrichment_rejected_for_other_sources() {
        let mut record = Record::market_trend("tech", "{}");
        let result = record.set_enrichment(Enrichment::from_score(0.9, 0.5));
        assert!(matches!(result, Err(PipelineError::InvalidOperation(_))));
        assert!(record.enrichment().is_none());
    }

    #[test]
    fn test_sentiment_threshold_is_exclusive() {
        assert_eq!(Enrichment::from_score(0.5, 0.5).label, SentimentLabel::Negative);
        assert_eq!(Enrichment::from_score(0.51, 0.5).label, SentimentLabel::Positive);
    }

    #[test]
    fn test_text_prefers_json_text_field() {
        let record = Record::customer_interaction(
            "C1234",
            r#"{"customer_id":"C1234","text":"Great product! I love it!"}"#,
        );
        assert_eq!(record.text(), "Great product! I love it!");

        let plain = Record::customer_interaction("C1234", "just words");
        assert_eq!(plain.text(), "just words");
    }

    #[test]
    fn test_unknown_source_type_name() {
        assert_eq!("market_trend".parse::<SourceType>().unwrap(), SourceType::MarketTrend);
        let err = "weather".parse::<SourceType>().unwrap_err();
        assert!(matches!(err, PipelineError::UnknownSourceType(name) if name == "weather"));
    }

    #[test]
    fn test_envelope_embeds_json_payload_and_enrichment() {
        let mut record = Record::customer_interaction("C1", r#"{"text":"meh"}"#);
        record.set_enrichment(Enrichment::from_score(0.2, 0.5)).unwrap();

        let envelope: serde_json::Value =
            serde_json::from_slice(&record.to_envelope().unwrap()).unwrap();
        assert_eq!(envelope["source_type"], "CustomerInteraction");
        assert_eq!(envelope["payload"]["text"], "meh");
        assert_eq!(envelope["enrichment"]["label"], "negative");
    }
}
