use serde::{Deserialize, Serialize};

/// A single audit entry representing one event in the enforcement
/// lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: DecisionEventType,
    pub source: DecisionSource,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforcement: Option<EnforceRecord>,
}

impl DecisionEntry {
    /// Create a new entry with an auto-generated UUID v4 and the current
    /// UTC timestamp. The caller supplies the event type, source, and
    /// free-form details JSON value. `enforcement` defaults to `None`.
    pub fn new(
        event_type: DecisionEventType,
        source: DecisionSource,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event_type,
            source,
            details,
            enforcement: None,
        }
    }

    /// Attach the enforcement record to this entry, consuming and
    /// returning `self` for builder-style usage.
    pub fn with_enforcement(mut self, record: EnforceRecord) -> Self {
        self.enforcement = Some(record);
        self
    }
}

/// The category of event being recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionEventType {
    Enforce,
    PolicyLoaded,
    PolicySaved,
    PolicyMutated,
    ModelReloaded,
    RoleLinksRebuilt,
    EnforcementDisabled,
    EnforcementEnabled,
}

/// Identifies the embedding component and optional contextual metadata
/// for the event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionSource {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl DecisionSource {
    /// Convenience constructor that only requires the component name. All
    /// optional fields default to `None`.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            instance: None,
            request_id: None,
        }
    }
}

/// The outcome of a single enforcement attached to an audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforceRecord {
    /// The request tuple, rendered to strings.
    pub request: Vec<String>,
    /// The boolean decision.
    pub allowed: bool,
    /// The policy tuple that settled the outcome, when one did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<Vec<String>>,
}

impl EnforceRecord {
    /// Build a record straight from an `Enforcer::enforce_ex` outcome.
    /// Request values are rendered to strings; an empty explanation means
    /// no tuple settled the decision and is stored as `None`.
    pub fn capture(request: &[gatewarden::Value], allowed: bool, explain: &[String]) -> Self {
        Self {
            request: request.iter().map(ToString::to_string).collect(),
            allowed,
            matched_rule: (!explain.is_empty()).then(|| explain.to_vec()),
        }
    }
}
