//! Orchestrator: runs one turn per inbound event.
//!
//! A turn:
//! 1. claim the contact on the concurrency gate (drop the event if busy)
//! 2. load the lead, normalize media, log the inbound message
//! 3. closed leads stop here
//! 4. collect hints, run proposal generation if due (latched once the model replies)
//! 5. call the language model (bounded by `llm_timeout`) and decode the contract
//! 6. resolve the stage, deliver segments, upsert the lead
//! 7. evaluate notification rules and fire them off
//!
//! Errors and panics that escape a turn are caught here once, reported as
//! `SYSTEM_ERROR`, and the gate is released by the guard's drop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::channels::Transport;
use crate::config::{EngineConfig, PacingConfig};
use crate::error::{LlmError, PipelineError};
use crate::lead::{Lead, LeadPatch, MessageRecord, Stage};
use crate::llm::LlmProvider;
use crate::media::{self, InboundEvent, MediaExtractor, NormalizedInput};
use crate::notify::{self, AdminNotifier};
use crate::pipeline::contract::{self, ResponseContract};
use crate::pipeline::dispatch::{DeliveryReport, DispatchScheduler};
use crate::pipeline::gate::ConcurrencyGate;
use crate::pipeline::prompts::{self, ConversationContext, Hint};
use crate::pipeline::proposal::{self, Proposal};
use crate::pipeline::rules::{self, NotificationRules};
use crate::pipeline::stage::{StageMachine, StagePhase};
use crate::store::LeadStore;

/// External collaborators of the orchestrator.
pub struct OrchestratorDeps {
    pub store: Arc<dyn LeadStore>,
    pub llm: Arc<dyn LlmProvider>,
    pub media: Arc<dyn MediaExtractor>,
    pub transport: Arc<dyn Transport>,
    pub notifier: Arc<dyn AdminNotifier>,
}

/// Summary of a completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub stage: Stage,
    pub delivery: DeliveryReport,
    pub degraded: bool,
    pub proposal: Option<Proposal>,
    pub notifications: usize,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Another turn for the contact was in flight; the event was dropped.
    Rejected,
    /// The lead is past the terminal stage; only the message was logged.
    Closed,
    Completed(TurnReport),
    /// An error or panic escaped the turn.
    Failed(String),
}

pub struct Orchestrator {
    config: EngineConfig,
    stages: StageMachine,
    rules: NotificationRules,
    gate: Arc<ConcurrencyGate>,
    store: Arc<dyn LeadStore>,
    llm: Arc<dyn LlmProvider>,
    media: Arc<dyn MediaExtractor>,
    dispatcher: DispatchScheduler,
    notifier: Arc<dyn AdminNotifier>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, pacing: PacingConfig, deps: OrchestratorDeps) -> Self {
        let stages = StageMachine::from_config(&config);
        Self {
            rules: NotificationRules::new(stages),
            stages,
            gate: ConcurrencyGate::new(),
            dispatcher: DispatchScheduler::new(deps.transport, Arc::clone(&deps.store), pacing),
            store: deps.store,
            llm: deps.llm,
            media: deps.media,
            notifier: deps.notifier,
            config,
        }
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn LeadStore> {
        &self.store
    }

    /// Process one inbound event end to end.
    pub async fn handle_event(&self, event: InboundEvent) -> TurnOutcome {
        let Some(_guard) = self.gate.try_enter(&event.contact_id) else {
            info!(contact = %event.contact_id, "Dropping event, turn already in flight");
            return TurnOutcome::Rejected;
        };

        let failure = match AssertUnwindSafe(self.run_turn(&event)).catch_unwind().await {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => e,
            Err(panic) => PipelineError::Panicked(panic_message(panic.as_ref())),
        };

        let reason = failure.to_string();
        error!(contact = %event.contact_id, error = %reason, "Turn failed");
        notify::dispatch(
            &self.notifier,
            vec![rules::system_error(&event.contact_id, &reason)],
        );
        TurnOutcome::Failed(reason)
    }

    async fn run_turn(&self, event: &InboundEvent) -> Result<TurnOutcome, PipelineError> {
        let contact_id = event.contact_id.as_str();
        let previous = self.store.get_lead(contact_id).await?;
        let input = media::normalize(self.media.as_ref(), event).await;

        let lead = match previous {
            Some(ref lead) => lead.clone(),
            None => Lead::new(contact_id, event.source.as_deref()),
        };

        // Persisted before the model call, and even for closed leads.
        self.store
            .append_message(&MessageRecord::user(contact_id, input.text.as_str()))
            .await?;

        if self.stages.phase(lead.stage) == StagePhase::Closed {
            debug!(contact = %contact_id, stage = %lead.stage, "Lead closed to automation");
            return Ok(TurnOutcome::Closed);
        }

        let mut patch = LeadPatch {
            source: previous.is_none().then(|| lead.source.clone()),
            billing: input.billing.clone(),
            ..Default::default()
        };
        let TurnHints {
            hints,
            proposal,
            proposal_generated,
        } = self.turn_hints(&lead, &input, event);

        let history = self
            .store
            .list_messages(contact_id, self.config.history_limit)
            .await?;
        let context = hints
            .into_iter()
            .fold(ConversationContext::for_lead(&lead, history), |ctx, hint| {
                ctx.with_hint(hint)
            });

        let contract = self.call_model(contact_id, &context).await;
        // A failed call never showed the numbers, so the proposal stays due.
        if proposal_generated && !contract.is_upstream_failure() {
            patch.proposal_sent = Some(true);
        }
        let next_stage = self.stages.next(lead.stage, contract.next_stage());

        let delivery = self.dispatcher.deliver(contact_id, contract.segments()).await;

        patch.stage = Some(next_stage);
        patch.last_interaction_at = Some(Utc::now());
        if let Some(updates) = contract.updates() {
            patch.fields = updates.fields.clone();
            patch.summary = updates.summary.clone();
            patch.interest_level = updates.interest_level;
        }
        let updated = self.store.upsert_lead(contact_id, &patch).await?;

        let notifications = self.rules.evaluate(previous.as_ref(), &updated, &contract);
        let fired = notifications.len();
        notify::dispatch(&self.notifier, notifications);

        info!(
            contact = %contact_id,
            from = %lead.stage,
            to = %updated.stage,
            sent = delivery.sent,
            degraded = contract.is_degraded(),
            "Turn complete"
        );

        Ok(TurnOutcome::Completed(TurnReport {
            stage: updated.stage,
            delivery,
            degraded: contract.is_degraded(),
            proposal,
            notifications: fired,
        }))
    }

    /// Auxiliary hints for this turn, plus proposal generation when due.
    fn turn_hints(&self, lead: &Lead, input: &NormalizedInput, event: &InboundEvent) -> TurnHints {
        let mut hints = Vec::new();

        if input.extraction_error.is_some() {
            hints.push(Hint::UnreadableAttachment(event.kind.to_string()));
        }

        let fresh_proposal = input.billing.as_ref().and_then(proposal::calculate);

        if !self.stages.proposal_due(lead) {
            if let Some(ref p) = fresh_proposal {
                hints.push(Hint::Proposal(p.clone()));
            }
            return TurnHints {
                hints,
                proposal: fresh_proposal,
                proposal_generated: false,
            };
        }

        let generated = fresh_proposal
            .or_else(|| lead.billing.as_ref().and_then(proposal::calculate))
            .or_else(|| {
                lead.fields
                    .average_consumption
                    .as_deref()
                    .and_then(proposal::calculate_free_form)
            });

        match generated {
            Some(ref p) => {
                info!(
                    contact = %lead.contact_id,
                    monthly = %p.monthly_saving,
                    "Proposal generated"
                );
                hints.push(Hint::Proposal(p.clone()));
            }
            None => {
                debug!(contact = %lead.contact_id, "Proposal due without billing data");
                hints.push(Hint::AskForBill);
            }
        }
        TurnHints {
            hints,
            proposal_generated: generated.is_some(),
            proposal: generated,
        }
    }

    /// Call the model under the configured timeout. Never fails.
    async fn call_model(&self, contact_id: &str, context: &ConversationContext) -> ResponseContract {
        let request = prompts::build_request(&self.config, &self.stages, context);
        let timeout = self.config.llm_timeout;

        let result = match tokio::time::timeout(timeout, self.llm.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                timeout,
            }),
        };

        match result {
            Ok(response) => contract::parse(&response.content),
            Err(e) => {
                warn!(contact = %contact_id, error = %e, "Language model call failed");
                ResponseContract::upstream_failure(&self.config.apology_message, e.to_string())
            }
        }
    }
}

/// Hints gathered before the model call.
struct TurnHints {
    hints: Vec<Hint>,
    proposal: Option<Proposal>,
    /// Proposal generation ran this turn; `proposal_sent` latches on success.
    proposal_generated: bool,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    use crate::error::{ChannelError, DatabaseError};
    use crate::lead::{Direction, InterestLevel};
    use crate::llm::{CompletionRequest, CompletionResponse};
    use crate::media::UnsupportedMediaExtractor;
    use crate::pipeline::proposal::{BillingData, ConnectionType};
    use crate::pipeline::rules::{Notification, NotificationKind};
    use crate::store::LibSqlBackend;

    enum Reply {
        Text(String),
        Fail,
        Hang,
        Panic,
    }

    /// Scripted model; records every request it receives.
    struct ScriptedLlm {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last_prompt(&self) -> String {
            let requests = self.requests.lock().unwrap();
            requests
                .last()
                .and_then(|r| r.messages.last())
                .map(|m| m.content.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop_front();
            let content = match reply {
                Some(Reply::Text(text)) => text,
                Some(Reply::Fail) | None => {
                    return Err(LlmError::RequestFailed {
                        provider: "scripted".into(),
                        reason: "unavailable".into(),
                    });
                }
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    String::new()
                }
                Some(Reply::Panic) => panic!("model exploded"),
            };
            Ok(CompletionResponse {
                content,
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    #[derive(Default)]
    struct RecordingTransport(Mutex<Vec<(String, String)>>);

    impl RecordingTransport {
        fn texts(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, contact_id: &str, text: &str) -> Result<(), ChannelError> {
            self.0
                .lock()
                .unwrap()
                .push((contact_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct ChannelNotifier(mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl AdminNotifier for ChannelNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), ChannelError> {
            let _ = self.0.send(notification.clone());
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl AdminNotifier for FailingNotifier {
        async fn notify(&self, _notification: &Notification) -> Result<(), ChannelError> {
            Err(ChannelError::SendFailed {
                name: "failing".into(),
                reason: "sink offline".into(),
            })
        }
    }

    /// Store whose history reads fail; everything else hits libSQL.
    struct BrokenHistoryStore(LibSqlBackend);

    #[async_trait]
    impl LeadStore for BrokenHistoryStore {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            self.0.run_migrations().await
        }

        async fn get_lead(&self, contact_id: &str) -> Result<Option<Lead>, DatabaseError> {
            self.0.get_lead(contact_id).await
        }

        async fn upsert_lead(
            &self,
            contact_id: &str,
            patch: &LeadPatch,
        ) -> Result<Lead, DatabaseError> {
            self.0.upsert_lead(contact_id, patch).await
        }

        async fn reset_stage(&self, contact_id: &str, stage: Stage) -> Result<Lead, DatabaseError> {
            self.0.reset_stage(contact_id, stage).await
        }

        async fn append_message(&self, record: &MessageRecord) -> Result<(), DatabaseError> {
            self.0.append_message(record).await
        }

        async fn list_messages(
            &self,
            _contact_id: &str,
            _limit: usize,
        ) -> Result<Vec<MessageRecord>, DatabaseError> {
            Err(DatabaseError::Query("history table unreadable".into()))
        }
    }

    fn orchestrator_with(
        store: Arc<dyn LeadStore>,
        llm: Arc<ScriptedLlm>,
        notifier: Arc<dyn AdminNotifier>,
    ) -> Orchestrator {
        Orchestrator::new(
            EngineConfig::default(),
            PacingConfig::immediate(),
            OrchestratorDeps {
                store,
                llm,
                media: Arc::new(UnsupportedMediaExtractor),
                transport: Arc::new(RecordingTransport::default()),
                notifier,
            },
        )
    }

    struct Harness {
        orchestrator: Orchestrator,
        llm: Arc<ScriptedLlm>,
        transport: Arc<RecordingTransport>,
        store: Arc<LibSqlBackend>,
        alerts: mpsc::UnboundedReceiver<Notification>,
    }

    impl Harness {
        async fn new(replies: Vec<Reply>) -> Self {
            Self::with_config(replies, EngineConfig::default()).await
        }

        async fn with_config(replies: Vec<Reply>, config: EngineConfig) -> Self {
            let llm = ScriptedLlm::new(replies);
            let transport = Arc::new(RecordingTransport::default());
            let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
            let (tx, alerts) = mpsc::unbounded_channel();
            let orchestrator = Orchestrator::new(
                config,
                PacingConfig::immediate(),
                OrchestratorDeps {
                    store: store.clone(),
                    llm: llm.clone(),
                    media: Arc::new(UnsupportedMediaExtractor),
                    transport: transport.clone(),
                    notifier: Arc::new(ChannelNotifier(tx)),
                },
            );
            Self {
                orchestrator,
                llm,
                transport,
                store,
                alerts,
            }
        }

        /// Notifications fired so far (they are delivered on spawned tasks).
        async fn drain_alerts(&mut self) -> Vec<NotificationKind> {
            let mut kinds = Vec::new();
            while let Ok(Some(n)) =
                tokio::time::timeout(Duration::from_millis(100), self.alerts.recv()).await
            {
                kinds.push(n.kind);
            }
            kinds
        }

        async fn seed(&self, contact: &str, patch: LeadPatch) -> Lead {
            self.store.upsert_lead(contact, &patch).await.unwrap()
        }
    }

    fn reply(json: &str) -> Reply {
        Reply::Text(json.to_string())
    }

    fn completed(outcome: TurnOutcome) -> TurnReport {
        match outcome {
            TurnOutcome::Completed(report) => report,
            other => panic!("expected completed turn, got {other:?}"),
        }
    }

    const CONTACT: &str = "5581999990000";

    #[tokio::test]
    async fn first_turn_creates_lead_and_delivers() {
        let mut h = Harness::new(vec![reply(
            r#"{"messages":["Oi! Sou a Sol ☀️","Como você conheceu a gente?"],
                "next_stage":1,"lead":{"name":"Ana"},"interest_level":"medio"}"#,
        )])
        .await;

        let event = InboundEvent::text(CONTACT, "oi").with_source("insta_julho");
        let report = completed(h.orchestrator.handle_event(event).await);

        assert_eq!(report.stage, Stage(1));
        assert_eq!(report.delivery.sent, 2);
        assert!(!report.degraded);
        assert_eq!(
            h.transport.texts(),
            vec!["Oi! Sou a Sol ☀️", "Como você conheceu a gente?"]
        );

        let lead = h.store.get_lead(CONTACT).await.unwrap().unwrap();
        assert_eq!(lead.stage, Stage(1));
        assert_eq!(lead.source, "insta_julho");
        assert_eq!(lead.fields.name.as_deref(), Some("Ana"));
        assert_eq!(lead.interest_level, Some(InterestLevel::Medium));
        assert!(lead.last_interaction_at.is_some());

        let log = h.store.list_messages(CONTACT, 10).await.unwrap();
        let directions: Vec<_> = log.iter().map(|m| m.direction).collect();
        assert_eq!(
            directions,
            vec![Direction::User, Direction::Agent, Direction::Agent]
        );

        assert_eq!(h.drain_alerts().await, vec![NotificationKind::NewLead]);
        assert!(!h.orchestrator.gate().is_busy(CONTACT));
    }

    #[tokio::test]
    async fn inbound_message_is_in_history_sent_to_model() {
        let h = Harness::new(vec![reply(r#"{"messages":["ok"],"next_stage":0}"#)]).await;
        h.orchestrator
            .handle_event(InboundEvent::text(CONTACT, "quanto custa?"))
            .await;

        let requests = h.llm.requests.lock().unwrap();
        assert!(
            requests[0]
                .messages
                .iter()
                .any(|m| m.content == "quanto custa?")
        );
    }

    #[tokio::test]
    async fn closed_lead_skips_model_and_mutation() {
        let h = Harness::new(vec![reply(r#"{"messages":["should not be sent"]}"#)]).await;
        h.seed(
            CONTACT,
            LeadPatch {
                stage: Some(Stage(6)),
                ..Default::default()
            },
        )
        .await;
        let before = h.store.get_lead(CONTACT).await.unwrap().unwrap();

        let outcome = h
            .orchestrator
            .handle_event(InboundEvent::text(CONTACT, "ainda está aí?"))
            .await;

        assert_eq!(outcome, TurnOutcome::Closed);
        assert_eq!(h.llm.calls(), 0);
        assert!(h.transport.texts().is_empty());
        let after = h.store.get_lead(CONTACT).await.unwrap().unwrap();
        assert_eq!(after, before);
        let log = h.store.list_messages(CONTACT, 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "ainda está aí?");
    }

    #[tokio::test]
    async fn busy_contact_is_rejected() {
        let h = Harness::new(vec![reply(r#"{"messages":["x"]}"#)]).await;
        let _held = h.orchestrator.gate().try_enter(CONTACT).unwrap();

        let outcome = h
            .orchestrator
            .handle_event(InboundEvent::text(CONTACT, "oi"))
            .await;

        assert_eq!(outcome, TurnOutcome::Rejected);
        assert_eq!(h.llm.calls(), 0);
        assert!(h.store.list_messages(CONTACT, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_failure_sends_apology_and_holds_stage() {
        let mut h = Harness::new(vec![Reply::Fail]).await;
        h.seed(
            CONTACT,
            LeadPatch {
                stage: Some(Stage(2)),
                ..Default::default()
            },
        )
        .await;

        let report = completed(
            h.orchestrator
                .handle_event(InboundEvent::text(CONTACT, "oi"))
                .await,
        );

        assert!(report.degraded);
        assert_eq!(report.stage, Stage(2));
        assert_eq!(
            h.transport.texts(),
            vec![EngineConfig::default().apology_message]
        );
        assert_eq!(h.drain_alerts().await, vec![NotificationKind::SystemError]);
    }

    #[tokio::test]
    async fn model_timeout_is_an_upstream_failure() {
        let config = EngineConfig {
            llm_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let mut h = Harness::with_config(vec![Reply::Hang], config).await;

        let report = completed(
            h.orchestrator
                .handle_event(InboundEvent::text(CONTACT, "oi"))
                .await,
        );

        assert!(report.degraded);
        assert_eq!(report.stage, Stage(0));
        let alerts = h.drain_alerts().await;
        assert!(alerts.contains(&NotificationKind::SystemError));
        assert!(alerts.contains(&NotificationKind::NewLead));
    }

    #[tokio::test]
    async fn unparsable_reply_is_sent_verbatim() {
        let h = Harness::new(vec![reply("Oi! Me conta mais sobre sua conta de luz.")]).await;

        let report = completed(
            h.orchestrator
                .handle_event(InboundEvent::text(CONTACT, "oi"))
                .await,
        );

        assert!(report.degraded);
        assert_eq!(report.stage, Stage(0));
        assert_eq!(
            h.transport.texts(),
            vec!["Oi! Me conta mais sobre sua conta de luz."]
        );
    }

    #[tokio::test]
    async fn panic_is_contained_and_gate_released() {
        let mut h = Harness::new(vec![Reply::Panic]).await;

        let outcome = h
            .orchestrator
            .handle_event(InboundEvent::text(CONTACT, "oi"))
            .await;

        match outcome {
            TurnOutcome::Failed(reason) => assert!(reason.contains("model exploded")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!h.orchestrator.gate().is_busy(CONTACT));
        assert_eq!(h.drain_alerts().await, vec![NotificationKind::SystemError]);
    }

    #[tokio::test]
    async fn stage_never_goes_backwards() {
        let h = Harness::new(vec![reply(r#"{"messages":["ok"],"next_stage":1}"#)]).await;
        h.seed(
            CONTACT,
            LeadPatch {
                stage: Some(Stage(3)),
                ..Default::default()
            },
        )
        .await;

        let report = completed(
            h.orchestrator
                .handle_event(InboundEvent::text(CONTACT, "oi"))
                .await,
        );
        assert_eq!(report.stage, Stage(3));
    }

    #[tokio::test]
    async fn qualified_crossing_notifies_once() {
        let mut h = Harness::new(vec![
            reply(r#"{"messages":["ótimo"],"next_stage":3}"#),
            reply(r#"{"messages":["certo"],"next_stage":4}"#),
        ])
        .await;
        h.seed(
            CONTACT,
            LeadPatch {
                stage: Some(Stage(2)),
                ..Default::default()
            },
        )
        .await;

        h.orchestrator
            .handle_event(InboundEvent::text(CONTACT, "minha conta é 400"))
            .await;
        assert_eq!(h.drain_alerts().await, vec![NotificationKind::QualifiedLead]);

        h.orchestrator
            .handle_event(InboundEvent::text(CONTACT, "ok"))
            .await;
        assert!(h.drain_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn high_interest_fires_once_over_two_turns() {
        let mut h = Harness::new(vec![
            reply(r#"{"messages":["a"],"interest_level":"Alto"}"#),
            reply(r#"{"messages":["b"],"interest_level":"Alto"}"#),
        ])
        .await;
        h.seed(CONTACT, LeadPatch::default()).await;

        h.orchestrator
            .handle_event(InboundEvent::text(CONTACT, "quero!"))
            .await;
        h.orchestrator
            .handle_event(InboundEvent::text(CONTACT, "quero muito!"))
            .await;

        let alerts = h.drain_alerts().await;
        assert_eq!(alerts, vec![NotificationKind::HighInterest]);
    }

    #[tokio::test]
    async fn human_request_notifies() {
        let mut h = Harness::new(vec![reply(
            r#"{"messages":["Vou chamar um consultor"],"interest_level":"humano"}"#,
        )])
        .await;
        h.seed(CONTACT, LeadPatch::default()).await;

        h.orchestrator
            .handle_event(InboundEvent::text(CONTACT, "quero falar com uma pessoa"))
            .await;
        assert_eq!(
            h.drain_alerts().await,
            vec![NotificationKind::HumanInterventionRequested]
        );
    }

    #[tokio::test]
    async fn disallowed_fields_never_reach_the_lead() {
        let h = Harness::new(vec![reply(
            r#"{"messages":["ok"],"lead":{"email":"ana@example.com","stage":9,"password":"x"}}"#,
        )])
        .await;

        h.orchestrator
            .handle_event(InboundEvent::text(CONTACT, "ana@example.com"))
            .await;

        let lead = h.store.get_lead(CONTACT).await.unwrap().unwrap();
        assert_eq!(lead.fields.email.as_deref(), Some("ana@example.com"));
        assert_eq!(lead.stage, Stage(0));
        assert_eq!(lead.fields.known().len(), 1);
    }

    #[tokio::test]
    async fn terminal_stage_generates_structured_proposal_once() {
        let h = Harness::new(vec![
            reply(r#"{"messages":["Sua economia:"],"next_stage":5}"#),
            reply(r#"{"messages":["Alguma dúvida?"],"next_stage":5}"#),
        ])
        .await;
        h.seed(
            CONTACT,
            LeadPatch {
                stage: Some(Stage(5)),
                billing: Some(BillingData {
                    total_value: dec!(500),
                    cip_fee: dec!(20),
                    connection_type: Some(ConnectionType::Monofasico),
                    tariff: Some(dec!(0.9)),
                }),
                ..Default::default()
            },
        )
        .await;

        let report = completed(
            h.orchestrator
                .handle_event(InboundEvent::text(CONTACT, "e aí, quanto economizo?"))
                .await,
        );
        let proposal = report.proposal.unwrap();
        assert_eq!(proposal.monthly_saving, dec!(90.60));
        assert!(h.llm.last_prompt().contains("R$ 90.60"));
        assert!(h.store.get_lead(CONTACT).await.unwrap().unwrap().proposal_sent);

        let report = completed(
            h.orchestrator
                .handle_event(InboundEvent::text(CONTACT, "legal"))
                .await,
        );
        assert!(report.proposal.is_none());
        assert!(!h.llm.last_prompt().contains("PROPOSAL"));
    }

    #[tokio::test]
    async fn terminal_stage_falls_back_to_free_form_amount() {
        let h = Harness::new(vec![reply(r#"{"messages":["Veja só"],"next_stage":6}"#)]).await;
        let mut patch = LeadPatch {
            stage: Some(Stage(5)),
            ..Default::default()
        };
        patch.fields.average_consumption = Some("R$ 200".into());
        h.seed(CONTACT, patch).await;

        let report = completed(
            h.orchestrator
                .handle_event(InboundEvent::text(CONTACT, "manda a proposta"))
                .await,
        );

        assert_eq!(report.proposal.unwrap().monthly_saving, dec!(30.00));
        assert_eq!(report.stage, Stage(6));
    }

    #[tokio::test]
    async fn terminal_stage_without_data_asks_for_bill() {
        let h = Harness::new(vec![reply(r#"{"messages":["Me manda a conta?"],"next_stage":5}"#)])
            .await;
        h.seed(
            CONTACT,
            LeadPatch {
                stage: Some(Stage(5)),
                ..Default::default()
            },
        )
        .await;

        let report = completed(
            h.orchestrator
                .handle_event(InboundEvent::text(CONTACT, "oi"))
                .await,
        );

        assert!(report.proposal.is_none());
        assert!(h.llm.last_prompt().contains("latest electricity bill"));
        assert!(!h.store.get_lead(CONTACT).await.unwrap().unwrap().proposal_sent);
    }

    #[tokio::test]
    async fn unreadable_media_continues_with_placeholder() {
        let h = Harness::new(vec![reply(r#"{"messages":["Pode digitar?"]}"#)]).await;
        let event = InboundEvent {
            contact_id: CONTACT.into(),
            kind: crate::media::MediaKind::Audio,
            payload: "https://cdn.example.com/a.ogg".into(),
            source: None,
            mime_type: Some("audio/ogg".into()),
        };

        let report = completed(h.orchestrator.handle_event(event).await);
        assert_eq!(report.delivery.sent, 1);
        assert!(h.llm.last_prompt().contains("could not be read"));
        let log = h.store.list_messages(CONTACT, 10).await.unwrap();
        assert!(log[0].text.contains("áudio"));
    }

    #[tokio::test]
    async fn different_contacts_run_concurrently() {
        let h = Harness::new(vec![
            reply(r#"{"messages":["a"]}"#),
            reply(r#"{"messages":["b"]}"#),
        ])
        .await;
        let (a, b) = tokio::join!(
            h.orchestrator.handle_event(InboundEvent::text("c-a", "oi")),
            h.orchestrator.handle_event(InboundEvent::text("c-b", "oi")),
        );
        assert!(matches!(a, TurnOutcome::Completed(_)));
        assert!(matches!(b, TurnOutcome::Completed(_)));
        assert_eq!(h.llm.calls(), 2);
    }

    #[tokio::test]
    async fn failed_model_call_keeps_proposal_due() {
        let h = Harness::new(vec![
            Reply::Fail,
            reply(r#"{"messages":["Sua economia:"],"next_stage":5}"#),
        ])
        .await;
        h.seed(
            CONTACT,
            LeadPatch {
                stage: Some(Stage(5)),
                billing: Some(BillingData {
                    total_value: dec!(500),
                    cip_fee: dec!(20),
                    connection_type: Some(ConnectionType::Monofasico),
                    tariff: Some(dec!(0.9)),
                }),
                ..Default::default()
            },
        )
        .await;

        let report = completed(
            h.orchestrator
                .handle_event(InboundEvent::text(CONTACT, "e a proposta?"))
                .await,
        );
        assert!(report.degraded);
        assert_eq!(report.stage, Stage(5));
        assert!(!h.store.get_lead(CONTACT).await.unwrap().unwrap().proposal_sent);

        let report = completed(
            h.orchestrator
                .handle_event(InboundEvent::text(CONTACT, "oi de novo"))
                .await,
        );
        assert!(!report.degraded);
        assert_eq!(report.proposal.unwrap().monthly_saving, dec!(90.60));
        assert!(h.llm.last_prompt().contains("PROPOSAL"));
        assert!(h.store.get_lead(CONTACT).await.unwrap().unwrap().proposal_sent);
    }

    #[tokio::test]
    async fn failing_notifier_does_not_affect_lead_update() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let llm = ScriptedLlm::new(vec![reply(
            r#"{"messages":["Oi Ana!"],"next_stage":1,"lead":{"name":"Ana"}}"#,
        )]);
        let orchestrator = orchestrator_with(store.clone(), llm, Arc::new(FailingNotifier));

        let report = completed(
            orchestrator
                .handle_event(InboundEvent::text(CONTACT, "oi, sou a Ana"))
                .await,
        );
        assert!(report.notifications >= 1);

        // Let the spawned notification tasks fail.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let lead = store.get_lead(CONTACT).await.unwrap().unwrap();
        assert_eq!(lead.stage, Stage(1));
        assert_eq!(lead.fields.name.as_deref(), Some("Ana"));
        assert!(!orchestrator.gate().is_busy(CONTACT));
    }

    #[tokio::test]
    async fn store_error_is_reported_and_gate_released() {
        let store = Arc::new(BrokenHistoryStore(LibSqlBackend::new_memory().await.unwrap()));
        let llm = ScriptedLlm::new(vec![reply(r#"{"messages":["nunca enviado"]}"#)]);
        let (tx, mut alerts) = mpsc::unbounded_channel();
        let orchestrator = orchestrator_with(store, llm.clone(), Arc::new(ChannelNotifier(tx)));

        let outcome = orchestrator
            .handle_event(InboundEvent::text(CONTACT, "oi"))
            .await;

        match outcome {
            TurnOutcome::Failed(reason) => assert!(reason.contains("history table unreadable")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!orchestrator.gate().is_busy(CONTACT));
        assert_eq!(llm.calls(), 0);

        let alert = tokio::time::timeout(Duration::from_secs(1), alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.kind, NotificationKind::SystemError);
        assert_eq!(alert.contact_id, CONTACT);
    }
}
