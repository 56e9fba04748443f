//! Inbound events and media normalization.
//!
//! Non-text events are turned into text (and, for bills, structured billing
//! data) by a [`MediaExtractor`] before they reach the pipeline. Extraction
//! failures never fail the turn: the text becomes a placeholder describing
//! the unreadable attachment.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MediaError;
use crate::pipeline::proposal::BillingData;

/// Kind of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Text,
    Audio,
    Image,
    Document,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
            Self::Image => "image",
            Self::Document => "document",
        }
    }

    fn placeholder(self) -> &'static str {
        match self {
            Self::Text => "",
            Self::Audio => "[O contato enviou um áudio que não pôde ser transcrito]",
            Self::Image => "[O contato enviou uma imagem que não pôde ser lida]",
            Self::Document => "[O contato enviou um documento que não pôde ser lido]",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound event from the messaging transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Channel address of the sender.
    #[serde(alias = "contactId")]
    pub contact_id: String,
    pub kind: MediaKind,
    /// Message text, or a media reference (URL / base64) for other kinds.
    pub payload: String,
    /// Campaign attribution tag, honored only when the lead is created.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
}

impl InboundEvent {
    pub fn text(contact_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            kind: MediaKind::Text,
            payload: text.into(),
            source: None,
            mime_type: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// What an extractor managed to read from an attachment.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// Audio transcript or plain image/document text.
    Transcript(String),
    /// A document or image recognized as an electricity bill.
    Bill {
        text: Option<String>,
        billing: BillingData,
    },
}

/// Converts audio, image and document payloads to text and fields.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn extract(
        &self,
        kind: MediaKind,
        payload: &str,
        mime_type: Option<&str>,
    ) -> Result<Extraction, MediaError>;
}

/// Default extractor: every attachment is reported as unsupported.
pub struct UnsupportedMediaExtractor;

#[async_trait]
impl MediaExtractor for UnsupportedMediaExtractor {
    async fn extract(
        &self,
        kind: MediaKind,
        _payload: &str,
        _mime_type: Option<&str>,
    ) -> Result<Extraction, MediaError> {
        Err(MediaError::Unsupported(kind.to_string()))
    }
}

/// An inbound event reduced to what the pipeline consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedInput {
    pub text: String,
    pub billing: Option<BillingData>,
    /// Set when extraction failed and `text` is a placeholder.
    pub extraction_error: Option<String>,
}

/// Normalize an event. Text passes through; media goes through `extractor`.
pub async fn normalize(extractor: &dyn MediaExtractor, event: &InboundEvent) -> NormalizedInput {
    if event.kind == MediaKind::Text {
        return NormalizedInput {
            text: event.payload.trim().to_string(),
            billing: None,
            extraction_error: None,
        };
    }

    match extractor
        .extract(event.kind, &event.payload, event.mime_type.as_deref())
        .await
    {
        Ok(Extraction::Transcript(text)) if !text.trim().is_empty() => NormalizedInput {
            text: text.trim().to_string(),
            billing: None,
            extraction_error: None,
        },
        Ok(Extraction::Transcript(_)) => placeholder(event, "empty extraction".into()),
        Ok(Extraction::Bill { text, billing }) => {
            let text = text
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| describe_bill(&billing));
            NormalizedInput {
                text,
                billing: Some(billing),
                extraction_error: None,
            }
        }
        Err(e) => placeholder(event, e.to_string()),
    }
}

fn placeholder(event: &InboundEvent, reason: String) -> NormalizedInput {
    warn!(
        contact = %event.contact_id,
        kind = %event.kind,
        error = %reason,
        "Media extraction failed, using placeholder"
    );
    NormalizedInput {
        text: event.kind.placeholder().to_string(),
        billing: None,
        extraction_error: Some(reason),
    }
}

fn describe_bill(billing: &BillingData) -> String {
    let mut text = format!(
        "[O contato enviou a conta de energia: total R$ {}, CIP R$ {}",
        billing.total_value, billing.cip_fee
    );
    if let Some(conn) = billing.connection_type {
        text.push_str(&format!(", ligação {conn}"));
    }
    text.push(']');
    text
}
