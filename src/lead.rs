//! Lead and message-log data model.
//!
//! A `Lead` is keyed by the contact's channel address. It is created on the
//! first inbound message, mutated once per turn through a `LeadPatch`, and
//! never deleted by the agent.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::proposal::BillingData;

/// Source recorded for leads that arrive without a campaign tag.
pub const ORGANIC_SOURCE: &str = "organic";

// ── Stage ───────────────────────────────────────────────────────────

/// Position in the qualification funnel.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Stage(pub u32);

impl Stage {
    pub const INITIAL: Stage = Stage(0);

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Interest level ──────────────────────────────────────────────────

/// Interest tag assigned by the language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestLevel {
    Low,
    Medium,
    High,
    VeryHigh,
    /// The contact asked for (or needs) a human operator.
    NeedsHuman,
}

impl InterestLevel {
    /// Parse a model tag, ignoring case, accents and separators.
    ///
    /// Unknown tags return `None` and are never stored.
    pub fn parse(tag: &str) -> Option<Self> {
        match fold_tag(tag).as_str() {
            "baixo" | "baixa" | "low" | "frio" | "cold" => Some(Self::Low),
            "medio" | "media" | "medium" | "morno" | "warm" => Some(Self::Medium),
            "alto" | "alta" | "high" | "quente" | "hot" => Some(Self::High),
            "muito alto" | "muito alta" | "very high" | "muito quente" => Some(Self::VeryHigh),
            "humano" | "human" | "needs human" | "atendente" | "intervencao humana" => {
                Some(Self::NeedsHuman)
            }
            _ => None,
        }
    }

    /// Canonical tag used in storage and notification payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "very_high",
            Self::NeedsHuman => "needs_human",
        }
    }

    /// Member of the "hot" set that triggers a high-interest alert.
    pub fn is_hot(self) -> bool {
        match self {
            Self::High | Self::VeryHigh => true,
            Self::Low | Self::Medium | Self::NeedsHuman => false,
        }
    }

    pub fn needs_human(self) -> bool {
        matches!(self, Self::NeedsHuman)
    }
}

impl fmt::Display for InterestLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase, strip Portuguese accents and collapse `_`/`-`/whitespace runs
/// into single spaces.
pub(crate) fn fold_tag(tag: &str) -> String {
    let folded: String = tag
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            '_' | '-' => ' ',
            other => other,
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Captured fields ─────────────────────────────────────────────────

/// Contact data collected during the conversation.
///
/// Updated in place: a `None` in an update never erases a stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedFields {
    pub name: Option<String>,
    pub tax_id: Option<String>,
    pub email: Option<String>,
    pub street: Option<String>,
    pub number: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub average_consumption: Option<String>,
}

impl CapturedFields {
    /// Overwrite every field that is set in `update`.
    pub fn merge(&mut self, update: &CapturedFields) {
        fn take(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }
        take(&mut self.name, &update.name);
        take(&mut self.tax_id, &update.tax_id);
        take(&mut self.email, &update.email);
        take(&mut self.street, &update.street);
        take(&mut self.number, &update.number);
        take(&mut self.neighborhood, &update.neighborhood);
        take(&mut self.city, &update.city);
        take(&mut self.state, &update.state);
        take(&mut self.zip_code, &update.zip_code);
        take(&mut self.average_consumption, &update.average_consumption);
    }

    /// Known fields as `(label, value)` pairs, in a stable order.
    pub fn known(&self) -> Vec<(&'static str, &str)> {
        [
            ("name", &self.name),
            ("tax_id", &self.tax_id),
            ("email", &self.email),
            ("street", &self.street),
            ("number", &self.number),
            ("neighborhood", &self.neighborhood),
            ("city", &self.city),
            ("state", &self.state),
            ("zip_code", &self.zip_code),
            ("average_consumption", &self.average_consumption),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.as_deref().map(|v| (label, v)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.known().is_empty()
    }
}

// ── Lead ────────────────────────────────────────────────────────────

/// A prospect tracked through the funnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    /// Channel address (phone number, chat id).
    pub contact_id: String,
    pub stage: Stage,
    pub interest_level: Option<InterestLevel>,
    /// Campaign attribution, set once at creation.
    pub source: String,
    pub fields: CapturedFields,
    pub summary: Option<String>,
    /// Last structured bill read from a document.
    pub billing: Option<BillingData>,
    pub proposal_sent: bool,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(contact_id: impl Into<String>, source: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            contact_id: contact_id.into(),
            stage: Stage::INITIAL,
            interest_level: None,
            source: source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(ORGANIC_SOURCE)
                .to_string(),
            fields: CapturedFields::default(),
            summary: None,
            billing: None,
            proposal_sent: false,
            last_interaction_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &LeadPatch) {
        if let Some(stage) = patch.stage {
            self.stage = stage;
        }
        if let Some(level) = patch.interest_level {
            self.interest_level = Some(level);
        }
        if let Some(ref source) = patch.source {
            self.source = source.clone();
        }
        self.fields.merge(&patch.fields);
        if let Some(ref summary) = patch.summary {
            self.summary = Some(summary.clone());
        }
        if let Some(ref billing) = patch.billing {
            self.billing = Some(billing.clone());
        }
        if let Some(sent) = patch.proposal_sent {
            self.proposal_sent = sent;
        }
        if let Some(at) = patch.last_interaction_at {
            self.last_interaction_at = Some(at);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial lead update. Unset fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeadPatch {
    pub stage: Option<Stage>,
    pub interest_level: Option<InterestLevel>,
    pub source: Option<String>,
    pub fields: CapturedFields,
    pub summary: Option<String>,
    pub billing: Option<BillingData>,
    pub proposal_sent: Option<bool>,
    pub last_interaction_at: Option<DateTime<Utc>>,
}

// ── Message log ─────────────────────────────────────────────────────

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    User,
    Agent,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// Append-only conversation log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub contact_id: String,
    pub direction: Direction,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(contact_id: &str, direction: Direction, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id: contact_id.to_string(),
            direction,
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(contact_id: &str, text: impl Into<String>) -> Self {
        Self::new(contact_id, Direction::User, text)
    }

    pub fn agent(contact_id: &str, text: impl Into<String>) -> Self {
        Self::new(contact_id, Direction::Agent, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_parse_ignores_case_and_accents() {
        assert_eq!(InterestLevel::parse("Alto"), Some(InterestLevel::High));
        assert_eq!(InterestLevel::parse("ALTO"), Some(InterestLevel::High));
        assert_eq!(InterestLevel::parse("Médio"), Some(InterestLevel::Medium));
        assert_eq!(InterestLevel::parse("muito_alto"), Some(InterestLevel::VeryHigh));
        assert_eq!(InterestLevel::parse("  Muito   Alto "), Some(InterestLevel::VeryHigh));
        assert_eq!(InterestLevel::parse("Humano"), Some(InterestLevel::NeedsHuman));
        assert_eq!(InterestLevel::parse("very_high"), Some(InterestLevel::VeryHigh));
        assert_eq!(InterestLevel::parse("needs_human"), Some(InterestLevel::NeedsHuman));
        assert_eq!(InterestLevel::parse("excited"), None);
    }

    #[test]
    fn canonical_tags_parse_back() {
        for level in [
            InterestLevel::Low,
            InterestLevel::Medium,
            InterestLevel::High,
            InterestLevel::VeryHigh,
            InterestLevel::NeedsHuman,
        ] {
            assert_eq!(InterestLevel::parse(level.as_str()), Some(level));
        }
    }

    #[test]
    fn hot_set() {
        assert!(InterestLevel::High.is_hot());
        assert!(InterestLevel::VeryHigh.is_hot());
        assert!(!InterestLevel::Medium.is_hot());
        assert!(!InterestLevel::NeedsHuman.is_hot());
        assert!(InterestLevel::NeedsHuman.needs_human());
    }

    #[test]
    fn new_lead_defaults() {
        let lead = Lead::new("5511999990000", None);
        assert_eq!(lead.stage, Stage::INITIAL);
        assert_eq!(lead.source, ORGANIC_SOURCE);
        assert!(!lead.proposal_sent);
        assert!(lead.fields.is_empty());

        let tagged = Lead::new("5511999990001", Some("instagram_ads"));
        assert_eq!(tagged.source, "instagram_ads");
    }

    #[test]
    fn merge_never_erases() {
        let mut fields = CapturedFields {
            name: Some("Ana".into()),
            email: Some("ana@example.com".into()),
            ..Default::default()
        };
        fields.merge(&CapturedFields {
            city: Some("Recife".into()),
            email: None,
            ..Default::default()
        });
        assert_eq!(fields.name.as_deref(), Some("Ana"));
        assert_eq!(fields.email.as_deref(), Some("ana@example.com"));
        assert_eq!(fields.city.as_deref(), Some("Recife"));
    }

    #[test]
    fn apply_patch() {
        let mut lead = Lead::new("c1", None);
        lead.apply(&LeadPatch {
            stage: Some(Stage(2)),
            interest_level: Some(InterestLevel::Medium),
            summary: Some("asked about panels".into()),
            proposal_sent: Some(true),
            ..Default::default()
        });
        assert_eq!(lead.stage, Stage(2));
        assert_eq!(lead.interest_level, Some(InterestLevel::Medium));
        assert_eq!(lead.summary.as_deref(), Some("asked about panels"));
        assert!(lead.proposal_sent);

        // Empty patch leaves values alone
        lead.apply(&LeadPatch::default());
        assert_eq!(lead.stage, Stage(2));
        assert_eq!(lead.interest_level, Some(InterestLevel::Medium));
    }

    #[test]
    fn known_fields_order() {
        let fields = CapturedFields {
            zip_code: Some("50000-000".into()),
            name: Some("Ana".into()),
            ..Default::default()
        };
        let known = fields.known();
        assert_eq!(known, vec![("name", "Ana"), ("zip_code", "50000-000")]);
    }

    #[test]
    fn direction_round_trip() {
        assert_eq!(Direction::parse(Direction::User.as_str()), Some(Direction::User));
        assert_eq!(Direction::parse(Direction::Agent.as_str()), Some(Direction::Agent));
        assert_eq!(Direction::parse("system"), None);
    }
}
