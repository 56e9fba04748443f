//! Per-turn conversation context and prompt assembly.

use crate::config::EngineConfig;
use crate::lead::{Direction, Lead, MessageRecord, ORGANIC_SOURCE, Stage};
use crate::llm::{ChatMessage, CompletionRequest};
use crate::pipeline::contract::SEGMENT_DELIMITER;
use crate::pipeline::proposal::{Proposal, ProposalMode};
use crate::pipeline::stage::StageMachine;

/// Auxiliary facts injected into a turn's prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Hint {
    /// The lead arrived from a campaign.
    CampaignSource(String),
    /// Running summary the model wrote on earlier turns.
    Dossier(String),
    /// Numbers the model may quote. Only these, never invented ones.
    Proposal(Proposal),
    /// Proposal is due but there is nothing to compute it from.
    AskForBill,
    /// An attachment could not be read.
    UnreadableAttachment(String),
}

impl Hint {
    fn render(&self) -> String {
        match self {
            Self::CampaignSource(source) => format!(
                "The contact came from the campaign \"{source}\". Acknowledge it naturally."
            ),
            Self::Dossier(summary) => format!("What we know so far: {summary}"),
            Self::Proposal(p) => {
                let basis = match p.mode {
                    ProposalMode::Structured => "computed from the bill they sent",
                    ProposalMode::FreeForm => "estimated from the bill amount they told us",
                };
                format!(
                    "PROPOSAL ({basis}): monthly saving R$ {}, annual saving R$ {}, \
                     saving over five years R$ {}. Present these exact numbers and \
                     invite the contact to sign up.",
                    p.monthly_saving, p.annual_saving, p.five_year_saving
                )
            }
            Self::AskForBill => "PROPOSAL: we cannot compute savings yet. Ask the contact for \
                                 a photo or PDF of their latest electricity bill, or for the \
                                 average bill amount."
                .to_string(),
            Self::UnreadableAttachment(kind) => format!(
                "The {kind} the contact sent could not be read. Ask them to type the \
                 information or send it again."
            ),
        }
    }
}

/// Ephemeral per-turn context. Never persisted.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub history: Vec<MessageRecord>,
    pub known_fields: Vec<(&'static str, String)>,
    pub stage: Stage,
    pub hints: Vec<Hint>,
}

impl ConversationContext {
    /// Context for `lead`, with the campaign and dossier hints derived from it.
    pub fn for_lead(lead: &Lead, history: Vec<MessageRecord>) -> Self {
        let mut hints = Vec::new();
        if lead.source != ORGANIC_SOURCE {
            hints.push(Hint::CampaignSource(lead.source.clone()));
        }
        if let Some(ref summary) = lead.summary {
            hints.push(Hint::Dossier(summary.clone()));
        }
        Self {
            history,
            known_fields: lead
                .fields
                .known()
                .into_iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect(),
            stage: lead.stage,
            hints,
        }
    }

    pub fn with_hint(mut self, hint: Hint) -> Self {
        self.hints.push(hint);
        self
    }

    /// The compiled turn prompt: stage, known fields, hints.
    pub fn compile(&self, stages: &StageMachine) -> String {
        let mut prompt = String::with_capacity(512);
        prompt.push_str(&format!(
            "Current stage: {} (qualified from {}, proposal at {})\n",
            self.stage,
            stages.qualified_threshold(),
            stages.terminal_stage()
        ));

        if self.known_fields.is_empty() {
            prompt.push_str("Known contact data: none yet\n");
        } else {
            prompt.push_str("Known contact data (do not ask again):\n");
            for (key, value) in &self.known_fields {
                prompt.push_str(&format!("- {key}: {value}\n"));
            }
        }

        if !self.hints.is_empty() {
            prompt.push_str("\nNotes for this turn:\n");
            for hint in &self.hints {
                prompt.push_str(&format!("- {}\n", hint.render()));
            }
        }

        prompt.push_str("\nReply to the contact's last message now.");
        prompt
    }
}

/// Output format the model must follow.
pub fn contract_instructions() -> String {
    format!(
        "\
Always answer with ONE JSON object and nothing else:
{{
  \"messages\": [\"short message\", \"another short message\"],
  \"next_stage\": <integer stage after this reply>,
  \"lead\": {{ only the contact data learned in THIS message }},
  \"interest_level\": \"baixo\" | \"medio\" | \"alto\" | \"muito_alto\" | \"humano\",
  \"summary\": \"one line about the contact so far\"
}}

- messages: 1 to 4 short chat messages, sent one after the other. A single \
string is also accepted, split with {SEGMENT_DELIMITER}.
- lead keys: name, tax_id, email, street, number, neighborhood, city, state, \
zip_code, average_consumption. Omit anything you did not learn.
- next_stage: never lower than the current stage."
    )
}

/// Assemble the completion request for one turn.
pub fn build_request(
    config: &EngineConfig,
    stages: &StageMachine,
    context: &ConversationContext,
) -> CompletionRequest {
    let mut messages = Vec::with_capacity(context.history.len() + 3);
    messages.push(ChatMessage::system(config.system_prompt.clone()));
    messages.push(ChatMessage::system(contract_instructions()));

    for record in &context.history {
        messages.push(match record.direction {
            Direction::User => ChatMessage::user(record.text.clone()),
            Direction::Agent => ChatMessage::assistant(record.text.clone()),
        });
    }

    messages.push(ChatMessage::user(format!(
        "[CONTEXT]\n{}",
        context.compile(stages)
    )));
    CompletionRequest::new(messages)
}
