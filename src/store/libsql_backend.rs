//! libSQL backend: async `LeadStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::lead::{CapturedFields, Direction, InterestLevel, Lead, LeadPatch, MessageRecord, Stage};
use crate::pipeline::proposal::BillingData;
use crate::store::migrations;
use crate::store::traits::LeadStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Insert or fully overwrite a lead row.
    async fn write_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        let billing = match lead.billing {
            Some(ref b) => Some(
                serde_json::to_string(b)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let f = &lead.fields;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO leads ({LEAD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                     ON CONFLICT (contact_id) DO UPDATE SET
                        stage = excluded.stage,
                        interest_level = excluded.interest_level,
                        source = excluded.source,
                        name = excluded.name,
                        tax_id = excluded.tax_id,
                        email = excluded.email,
                        street = excluded.street,
                        number = excluded.number,
                        neighborhood = excluded.neighborhood,
                        city = excluded.city,
                        state = excluded.state,
                        zip_code = excluded.zip_code,
                        average_consumption = excluded.average_consumption,
                        summary = excluded.summary,
                        billing = excluded.billing,
                        proposal_sent = excluded.proposal_sent,
                        last_interaction_at = excluded.last_interaction_at,
                        updated_at = excluded.updated_at"
                ),
                params![
                    lead.contact_id.clone(),
                    lead.stage.value() as i64,
                    opt_text(lead.interest_level.map(InterestLevel::as_str)),
                    lead.source.clone(),
                    opt_text(f.name.as_deref()),
                    opt_text(f.tax_id.as_deref()),
                    opt_text(f.email.as_deref()),
                    opt_text(f.street.as_deref()),
                    opt_text(f.number.as_deref()),
                    opt_text(f.neighborhood.as_deref()),
                    opt_text(f.city.as_deref()),
                    opt_text(f.state.as_deref()),
                    opt_text(f.zip_code.as_deref()),
                    opt_text(f.average_consumption.as_deref()),
                    opt_text(lead.summary.as_deref()),
                    opt_text(billing.as_deref()),
                    lead.proposal_sent as i64,
                    opt_text(lead.last_interaction_at.map(|t| t.to_rfc3339()).as_deref()),
                    lead.created_at.to_rfc3339(),
                    lead.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("write_lead: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Nullable text column.
fn opt_col(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

/// Map a libsql Row to a Lead.
///
/// Column order matches LEAD_COLUMNS.
fn row_to_lead(row: &libsql::Row) -> Result<Lead, libsql::Error> {
    let stage: i64 = row.get(1)?;
    let billing = opt_col(row, 15).and_then(|s| serde_json::from_str::<BillingData>(&s).ok());
    let proposal_sent: i64 = row.get(16)?;
    let created_str: String = row.get(18)?;
    let updated_str: String = row.get(19)?;

    Ok(Lead {
        contact_id: row.get(0)?,
        stage: Stage(u32::try_from(stage).unwrap_or(0)),
        interest_level: opt_col(row, 2).and_then(|s| InterestLevel::parse(&s)),
        source: row.get(3)?,
        fields: CapturedFields {
            name: opt_col(row, 4),
            tax_id: opt_col(row, 5),
            email: opt_col(row, 6),
            street: opt_col(row, 7),
            number: opt_col(row, 8),
            neighborhood: opt_col(row, 9),
            city: opt_col(row, 10),
            state: opt_col(row, 11),
            zip_code: opt_col(row, 12),
            average_consumption: opt_col(row, 13),
        },
        summary: opt_col(row, 14),
        billing,
        proposal_sent: proposal_sent != 0,
        last_interaction_at: opt_col(row, 17).map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a MessageRecord.
fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let direction_str: String = row.get(2)?;
    let created_str: String = row.get(4)?;

    Ok(MessageRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        contact_id: row.get(1)?,
        direction: Direction::parse(&direction_str).unwrap_or(Direction::User),
        text: row.get(3)?,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const LEAD_COLUMNS: &str = "contact_id, stage, interest_level, source, name, tax_id, email, street, number, neighborhood, city, state, zip_code, average_consumption, summary, billing, proposal_sent, last_interaction_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, contact_id, direction, text, created_at";

#[async_trait]
impl LeadStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn get_lead(&self, contact_id: &str) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE contact_id = ?1"),
                params![contact_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let lead = row_to_lead(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(lead))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lead: {e}"))),
        }
    }

    async fn upsert_lead(
        &self,
        contact_id: &str,
        patch: &LeadPatch,
    ) -> Result<Lead, DatabaseError> {
        let mut lead = match self.get_lead(contact_id).await? {
            Some(lead) => lead,
            None => {
                debug!(contact = %contact_id, "Creating lead");
                Lead::new(contact_id, patch.source.as_deref())
            }
        };
        lead.apply(patch);
        self.write_lead(&lead).await?;
        Ok(lead)
    }

    async fn reset_stage(&self, contact_id: &str, stage: Stage) -> Result<Lead, DatabaseError> {
        let mut lead =
            self.get_lead(contact_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "lead".into(),
                    id: contact_id.to_string(),
                })?;
        info!(contact = %contact_id, from = %lead.stage, to = %stage, "Resetting lead stage");
        lead.stage = stage;
        lead.proposal_sent = false;
        lead.updated_at = Utc::now();
        self.write_lead(&lead).await?;
        Ok(lead)
    }

    async fn append_message(&self, record: &MessageRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO lead_messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    record.id.to_string(),
                    record.contact_id.clone(),
                    record.direction.as_str(),
                    record.text.clone(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;

        debug!(
            contact = %record.contact_id,
            direction = record.direction.as_str(),
            "Message appended"
        );
        Ok(())
    }

    async fn list_messages(
        &self,
        contact_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM (
                        SELECT seq, {MESSAGE_COLUMNS} FROM lead_messages
                        WHERE contact_id = ?1 ORDER BY seq DESC LIMIT ?2
                     ) ORDER BY seq ASC"
                ),
                params![contact_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => messages.push(
                    row_to_message(&row)
                        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_messages: {e}"))),
            }
        }
        Ok(messages)
    }
}
