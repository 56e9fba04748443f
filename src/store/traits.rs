//! `LeadStore` trait: the single async interface for lead persistence.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::lead::{Lead, LeadPatch, MessageRecord, Stage};

/// Backend-agnostic lead and message-log storage.
///
/// Writes to a single lead row are assumed to be serialized by the caller
/// (the concurrency gate guarantees one turn per contact).
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Fetch a lead by contact id.
    async fn get_lead(&self, contact_id: &str) -> Result<Option<Lead>, DatabaseError>;

    /// Apply a partial update, creating the lead if it does not exist.
    /// Returns the stored lead after the update.
    async fn upsert_lead(&self, contact_id: &str, patch: &LeadPatch)
    -> Result<Lead, DatabaseError>;

    /// Explicit external reset of a lead's stage (the only way to go back).
    /// Also clears `proposal_sent` so the proposal can fire again.
    async fn reset_stage(&self, contact_id: &str, stage: Stage) -> Result<Lead, DatabaseError>;

    // ── Message log ─────────────────────────────────────────────────

    /// Append a record to the contact's conversation log.
    async fn append_message(&self, record: &MessageRecord) -> Result<(), DatabaseError>;

    /// The most recent `limit` records, oldest first.
    async fn list_messages(
        &self,
        contact_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;
}
