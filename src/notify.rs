//! Fire-and-forget notifications for applied transitions
use crate::request::{AuditEntry, AuditEvent, ServiceRequest};
use crate::types::{ArtisanId, Owner, Principal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Owner(Owner),
    Artisan(ArtisanId),
    /// The platform administrators as a group.
    Admins,
}

/// Delivery collaborator (email, push, ...). Failures are logged by the caller
/// and never fail the transition that produced the notification.
pub trait NotificationDispatcher: Send + Sync {
    fn notify(&self, entry: &AuditEntry, recipients: &[Recipient]) -> anyhow::Result<()>;
}

/// Emits notifications as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDispatcher;

impl NotificationDispatcher for TracingDispatcher {
    fn notify(&self, entry: &AuditEntry, recipients: &[Recipient]) -> anyhow::Result<()> {
        tracing::info!(
            actor = %entry.actor,
            status = %entry.status,
            event = ?entry.event,
            ?recipients,
            "notification"
        );
        Ok(())
    }
}

/// Everyone with a stake in `entry` except the actor that caused it.
pub fn recipients_for(request: &ServiceRequest, entry: &AuditEntry) -> Vec<Recipient> {
    let mut recipients = vec![];
    if !request.owner.is(&entry.actor) {
        recipients.push(Recipient::Owner(request.owner.clone()));
    }
    if let Some(artisan) = &request.assigned_artisan {
        let acted = matches!(&entry.actor, Principal::Artisan(actor) if actor == artisan);
        if !acted {
            recipients.push(Recipient::Artisan(artisan.clone()));
        }
    }
    let needs_admin = matches!(
        entry.event,
        AuditEvent::Submitted
            | AuditEvent::EstimateAccepted { .. }
            | AuditEvent::EstimateRejected { .. }
            | AuditEvent::DisputeRaised { .. }
            | AuditEvent::AssignmentRefused { .. }
    );
    if needs_admin && !entry.actor.is_admin() {
        recipients.push(Recipient::Admins);
    }
    recipients
}
