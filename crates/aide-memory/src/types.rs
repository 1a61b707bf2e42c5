use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// How a fact was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactSource {
    /// User explicitly asked to remember it.
    Stated,
    /// Extracted during consolidation.
    Inferred,
    /// Operator-provisioned.
    Configured,
}

impl std::fmt::Display for FactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stated => write!(f, "stated"),
            Self::Inferred => write!(f, "inferred"),
            Self::Configured => write!(f, "configured"),
        }
    }
}

impl std::str::FromStr for FactSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stated" => Ok(Self::Stated),
            "inferred" => Ok(Self::Inferred),
            "configured" => Ok(Self::Configured),
            other => Err(format!("unknown fact source: {other}")),
        }
    }
}

/// A stored conversation message. Never mutated after insert; compaction
/// removes (or archives) whole rows by `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub message_id: String,
    pub direction: Direction,
    pub content_type: String,
    pub content_text: Option<String>,
    pub conversation_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    /// Transport timestamp, epoch milliseconds.
    pub timestamp: i64,
    pub created_at: i64,
    pub archived: bool,
}

/// Input for `store_message`.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub message_id: String,
    pub content_type: String,
    pub content_text: Option<String>,
    pub conversation_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub timestamp: i64,
}

/// A long-term fact, keyed per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFact {
    pub id: i64,
    pub conversation_id: String,
    pub category: String,
    pub key: String,
    /// A complete sentence containing the person's name.
    pub value: String,
    pub confidence: f64,
    pub source: FactSource,
    pub learned_at: i64,
    pub last_verified_at: Option<i64>,
}

/// A compacted slice of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSummary {
    pub id: i64,
    pub conversation_id: String,
    pub summary_type: String,
    pub period_start: i64,
    pub period_end: i64,
    pub summary_text: String,
    pub message_count: i64,
    pub created_at: i64,
}

/// One indexed slice of an ingested document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: i64,
    /// Access scope; a conversation-id-derived string, never empty for
    /// reachable chunks (empty-scope rows are orphaned).
    pub scope: String,
    pub source: String,
    pub title: String,
    pub content: String,
    pub chunk_index: i64,
    pub created_at: i64,
}

/// Aggregate row for the admin listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub scope: String,
    pub source: String,
    pub chunk_count: i64,
    pub last_updated: i64,
}
