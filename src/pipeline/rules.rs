//! Notification rule engine.
//!
//! Derives admin alerts from the lead's state before and after a turn. Every
//! rule is edge-triggered: it fires when a value changes into the watched
//! state, never while it stays there.

use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::lead::Lead;
use crate::pipeline::contract::{DegradeReason, ResponseContract};
use crate::pipeline::stage::StageMachine;

/// Kind of admin alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    NewLead,
    QualifiedLead,
    HighInterest,
    HumanInterventionRequested,
    SystemError,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewLead => "NEW_LEAD",
            Self::QualifiedLead => "QUALIFIED_LEAD",
            Self::HighInterest => "HIGH_INTEREST",
            Self::HumanInterventionRequested => "HUMAN_INTERVENTION_REQUESTED",
            Self::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub contact_id: String,
    pub payload: Value,
}

impl Notification {
    fn for_lead(kind: NotificationKind, lead: &Lead) -> Self {
        Self {
            kind,
            contact_id: lead.contact_id.clone(),
            payload: json!({
                "contact": lead.contact_id,
                "stage": lead.stage.value(),
                "interest_level": lead.interest_level.map(|l| l.as_str()),
                "name": lead.fields.name,
            }),
        }
    }
}

/// Alert raised when a turn fails outside the lead state machine.
pub fn system_error(contact_id: &str, reason: &str) -> Notification {
    Notification {
        kind: NotificationKind::SystemError,
        contact_id: contact_id.to_string(),
        payload: json!({
            "contact": contact_id,
            "reason": reason,
        }),
    }
}

/// Edge-triggered rules over a turn's lead delta.
#[derive(Debug, Clone, Default)]
pub struct NotificationRules {
    stages: StageMachine,
}

impl NotificationRules {
    pub fn new(stages: StageMachine) -> Self {
        Self { stages }
    }

    /// Alerts for one completed turn.
    ///
    /// `previous` is `None` when the lead was created by this turn. An
    /// upstream-failure contract also raises `SYSTEM_ERROR`.
    pub fn evaluate(
        &self,
        previous: Option<&Lead>,
        updated: &Lead,
        contract: &ResponseContract,
    ) -> Vec<Notification> {
        let mut out = Vec::new();

        if previous.is_none() {
            out.push(Notification::for_lead(NotificationKind::NewLead, updated));
        }

        let previous_stage = previous.map(|l| l.stage).unwrap_or_default();
        if self.stages.crossed_qualified(previous_stage, updated.stage) {
            out.push(Notification::for_lead(NotificationKind::QualifiedLead, updated));
        }

        let previous_level = previous.and_then(|l| l.interest_level);
        if let Some(level) = updated
            .interest_level
            .filter(|level| previous_level != Some(*level))
        {
            if level.is_hot() {
                out.push(Notification::for_lead(NotificationKind::HighInterest, updated));
            }
            if level.needs_human() {
                out.push(Notification::for_lead(
                    NotificationKind::HumanInterventionRequested,
                    updated,
                ));
            }
        }

        if let ResponseContract::Degraded {
            reason: DegradeReason::Upstream(reason),
            ..
        } = contract
        {
            out.push(system_error(&updated.contact_id, reason));
        }

        for n in &out {
            debug!(contact = %updated.contact_id, kind = %n.kind, "Notification rule fired");
        }
        out
    }
}
