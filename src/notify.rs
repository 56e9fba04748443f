//! Admin notification sinks.
//!
//! Delivery is fire-and-forget: [`dispatch`] spawns one task per
//! notification and sink failures are only logged.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::channels::Transport;
use crate::error::ChannelError;
use crate::pipeline::rules::{Notification, NotificationKind};

/// Receives admin alerts.
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), ChannelError>;
}

/// Writes every notification to the log.
pub struct LogNotifier;

#[async_trait]
impl AdminNotifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ChannelError> {
        info!(
            kind = %notification.kind,
            contact = %notification.contact_id,
            payload = %notification.payload,
            "Admin notification"
        );
        Ok(())
    }
}

/// Sends a short alert text to an admin contact over the outbound transport.
pub struct TransportNotifier {
    transport: Arc<dyn Transport>,
    admin_contact: String,
}

impl TransportNotifier {
    pub fn new(transport: Arc<dyn Transport>, admin_contact: impl Into<String>) -> Self {
        Self {
            transport,
            admin_contact: admin_contact.into(),
        }
    }
}

/// Human-readable alert line for a notification.
pub fn format_alert(notification: &Notification) -> String {
    let p = &notification.payload;
    let field = |key: &str| p.get(key).and_then(|v| v.as_str()).unwrap_or("-").to_string();
    let headline = match notification.kind {
        NotificationKind::NewLead => "🆕 Novo lead",
        NotificationKind::QualifiedLead => "✅ Lead qualificado",
        NotificationKind::HighInterest => "🔥 Alto interesse",
        NotificationKind::HumanInterventionRequested => "🙋 Pediu atendimento humano",
        NotificationKind::SystemError => "⚠️ Erro no atendimento",
    };
    match notification.kind {
        NotificationKind::SystemError => format!(
            "{headline}\nContato: {}\nMotivo: {}",
            notification.contact_id,
            field("reason")
        ),
        _ => format!(
            "{headline}\nContato: {}\nNome: {}\nEtapa: {}\nInteresse: {}",
            notification.contact_id,
            field("name"),
            p.get("stage").map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            field("interest_level"),
        ),
    }
}

#[async_trait]
impl AdminNotifier for TransportNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.transport
            .send(&self.admin_contact, &format_alert(notification))
            .await
    }
}

/// Forwards each notification to every inner sink.
///
/// All sinks are tried; the first error is returned.
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn AdminNotifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn AdminNotifier>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AdminNotifier for FanoutNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ChannelError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(notification).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Spawn delivery of each notification. Never blocks, never fails.
pub fn dispatch(notifier: &Arc<dyn AdminNotifier>, notifications: Vec<Notification>) {
    for notification in notifications {
        let notifier = Arc::clone(notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notification).await {
                warn!(
                    kind = %notification.kind,
                    contact = %notification.contact_id,
                    error = %e,
                    "Admin notification failed"
                );
            }
        });
    }
}
