//! Entity, log and handoff types shared by every worker crate.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type EntityId = String;

/// The `kind` of an entity is an open set - extraction can produce types we
/// never enumerate ahead of time - so it is a newtype over `String` rather
/// than a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKind(pub String);

impl EntityKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub const TEXT_CHUNK: &'static str = "text_chunk";
    pub const CLUSTER_LEADER: &'static str = "cluster_leader";
    pub const SCATTER_JOB: &'static str = "scatter_job";
    pub const KLADOS_LOG: &'static str = "klados_log";
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of predicates the spec names, plus a catch-all for forward
/// compatibility with relationship kinds the workflow engine adds later.
/// Serializes as a plain string so it round-trips through the entity
/// store's relationship edges unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Predicate {
    SentTo,
    FirstLog,
    ReceivedFrom,
    SummarizedBy,
    ExtractedFrom,
    Other(String),
}

impl Predicate {
    fn as_str(&self) -> &str {
        match self {
            Predicate::SentTo => "sent_to",
            Predicate::FirstLog => "first_log",
            Predicate::ReceivedFrom => "received_from",
            Predicate::SummarizedBy => "summarized_by",
            Predicate::ExtractedFrom => "extracted_from",
            Predicate::Other(s) => s,
        }
    }
}

impl From<&str> for Predicate {
    fn from(s: &str) -> Self {
        match s {
            "sent_to" => Predicate::SentTo,
            "first_log" => Predicate::FirstLog,
            "received_from" => Predicate::ReceivedFrom,
            "summarized_by" => Predicate::SummarizedBy,
            "extracted_from" => Predicate::ExtractedFrom,
            other => Predicate::Other(other.to_string()),
        }
    }
}

impl Serialize for Predicate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Predicate::from(s.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relationship {
    pub predicate: Predicate,
    pub peer: EntityId,
}

/// Entity as stored by the external entity-store. `properties` carries the
/// full raw property bag (including `_kg_layer`); `layer` surfaces that one
/// property as a typed field for convenience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub layer: Option<u32>,
    #[serde(default)]
    pub relationships: BTreeSet<Relationship>,
}

impl Entity {
    pub fn label(&self) -> Option<&str> {
        self.properties.get("label").and_then(|v| v.as_str())
    }

    pub fn description(&self) -> Option<&str> {
        self.properties.get("description").and_then(|v| v.as_str())
    }

    pub fn incoming(&self, predicate: &Predicate) -> impl Iterator<Item = &EntityId> {
        self.relationships
            .iter()
            .filter(move |r| &r.predicate == predicate)
            .map(|r| &r.peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_copies: Option<u32>,
}

/// What a log entry handed work off to. Mirrors the four handoff shapes of
/// the external workflow engine exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handoff {
    Invoke {
        outputs: [EntityId; 1],
    },
    Pass {
        outputs: [EntityId; 1],
    },
    Scatter {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Vec<EntityId>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invocations: Option<Vec<serde_json::Value>>,
        #[serde(default)]
        delegated: bool,
    },
    Gather {
        outputs: [EntityId; 1],
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Received {
    pub from_log: EntityId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: EntityId,
    pub klados_id: String,
    pub status: LogStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<Received>,
    #[serde(default)]
    pub handoffs: Vec<Handoff>,
    #[serde(default)]
    pub messages: Vec<LogMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCollection {
    pub id: EntityId,
    pub first_log: EntityId,
}
