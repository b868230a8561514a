//! Post-work dual validation and dispute resolution.
//!
//! Each side's stance is a one-way ratchet: once a side validated or disputed,
//! that stance is final. Only the other side (or an admin) can move the request
//! on from there. Functions return `Ok(None)` when the caller's effect is
//! already in place.
use crate::config::WorkflowConfig;
use crate::error::{ValidationError, WorkflowError};
use crate::guard::Operation;
use crate::request::{
    AuditEvent, DisputeOutcome, DisputeResolution, RequestStatus, ServiceRequest, Stance,
};
use crate::types::{Principal, Side, TimeStamp};
use chrono::Utc;

fn non_blank(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_owned()).filter(|t| !t.is_empty())
}

pub fn validate_completion(
    request: &ServiceRequest,
    actor: &Principal,
    side: Side,
    issues: Option<String>,
    now: TimeStamp<Utc>,
) -> Result<Option<ServiceRequest>, WorkflowError> {
    let operation = Operation::ValidateCompletion;
    let issues = non_blank(issues);

    if request.validation.has_validated(side) {
        return Ok(None);
    }
    if request.validation.has_disputed(side) {
        return Err(WorkflowError::invalid(
            operation,
            request.status,
            format!("the {side} already disputed this request"),
        ));
    }

    let status = match request.status {
        RequestStatus::InProgress => RequestStatus::validated_by(side),
        current if current == RequestStatus::validated_by(side.other()) => {
            if issues.is_some() || request.validation.has_issues() {
                RequestStatus::CompletedWithIssues
            } else {
                RequestStatus::Completed
            }
        }
        current => {
            return Err(WorkflowError::invalid(
                operation,
                current,
                "completion can only be validated while work is in progress",
            ));
        }
    };

    let mut next = request.advance(
        status,
        actor,
        AuditEvent::CompletionValidated {
            side,
            issues: issues.clone(),
        },
        now,
    );
    next.validation.set(side, Stance::Validated { at: now, issues });
    Ok(Some(next))
}

pub fn dispute(
    request: &ServiceRequest,
    actor: &Principal,
    side: Side,
    reason: Option<String>,
    now: TimeStamp<Utc>,
    config: &WorkflowConfig,
) -> Result<Option<ServiceRequest>, WorkflowError> {
    let operation = Operation::Dispute;
    let reason = match non_blank(reason) {
        Some(reason) => reason,
        None if config.require_dispute_reason => {
            return Err(ValidationError::MissingReason("dispute reason").into());
        }
        None => String::new(),
    };

    if request.validation.has_disputed(side) {
        return Ok(None);
    }
    if request.validation.has_validated(side) {
        return Err(WorkflowError::invalid(
            operation,
            request.status,
            format!("the {side} already validated completion and cannot dispute it"),
        ));
    }

    let other = side.other();
    let status = match request.status {
        RequestStatus::InProgress => RequestStatus::disputed_by(side),
        current
            if current == RequestStatus::validated_by(other)
                || current == RequestStatus::disputed_by(other) =>
        {
            RequestStatus::DisputedByBoth
        }
        current => {
            return Err(WorkflowError::invalid(
                operation,
                current,
                "a dispute can only be raised while work is in progress or awaiting validation",
            ));
        }
    };

    let mut next = request.advance(
        status,
        actor,
        AuditEvent::DisputeRaised {
            side,
            reason: reason.clone(),
        },
        now,
    );
    next.validation.set(side, Stance::Disputed { at: now, reason });
    Ok(Some(next))
}

pub fn resolve_dispute(
    request: &ServiceRequest,
    actor: &Principal,
    outcome: DisputeOutcome,
    note: Option<String>,
    now: TimeStamp<Utc>,
) -> Result<Option<ServiceRequest>, WorkflowError> {
    let note = non_blank(note);

    if request.status == RequestStatus::Resolved {
        return match &request.resolution {
            Some(resolution) if resolution.outcome == outcome => Ok(None),
            _ => Err(WorkflowError::invalid(
                Operation::ResolveDispute,
                request.status,
                "dispute was already resolved with a different outcome",
            )),
        };
    }
    if !request.status.is_disputed() {
        return Err(WorkflowError::invalid(
            Operation::ResolveDispute,
            request.status,
            "there is no open dispute",
        ));
    }

    let mut next = request.advance(
        RequestStatus::Resolved,
        actor,
        AuditEvent::DisputeResolved {
            outcome,
            note: note.clone(),
        },
        now,
    );
    next.resolution = Some(DisputeResolution {
        outcome,
        note,
        resolved_at: now,
    });
    Ok(Some(next))
}

/// Admin closes a started job that cannot be finished.
pub fn abandon(
    request: &ServiceRequest,
    actor: &Principal,
    reason: Option<String>,
    now: TimeStamp<Utc>,
) -> Result<Option<ServiceRequest>, WorkflowError> {
    let reason = non_blank(reason).ok_or(ValidationError::MissingReason("reason for abandoning"))?;

    match request.status {
        RequestStatus::CouldNotComplete => Ok(None),
        RequestStatus::InProgress
        | RequestStatus::ClientValidated
        | RequestStatus::ArtisanValidated => Ok(Some(request.advance(
            RequestStatus::CouldNotComplete,
            actor,
            AuditEvent::Abandoned { reason },
            now,
        ))),
        current => Err(WorkflowError::invalid(
            Operation::Abandon,
            current,
            "only started work can be abandoned",
        )),
    }
}
