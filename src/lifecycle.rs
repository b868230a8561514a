//! # Request lifecycle state machine
//!
//! ```text
//! AwaitingEstimate ──issue──▶ AwaitingEstimateAcceptance ──accept──▶ AwaitingAssignment
//!        ▲                              │                                   │
//!        └────────────reject────────────┘                          acceptAssignment
//!                                                                           ▼
//!                      ┌──────────── revised estimate ◀──────────────── InProgress
//!                      │                                                    │
//!                      ▼                                  validate / dispute (resolver)
//!            AwaitingEstimateAcceptance                                     ▼
//!                                       ClientValidated | ArtisanValidated | DisputedBy*
//!                                                        │                      │
//!                                   Completed | CompletedWithIssues          Resolved
//! ```
//!
//! `Cancelled` is reachable from every non-terminal state, `CouldNotComplete`
//! from started work. Every handler here is pure: it takes a snapshot and
//! returns the entities to write. Persistence and notification happen in
//! [`crate::service`].
use crate::config::WorkflowConfig;
use crate::error::{ValidationError, WorkflowError};
use crate::estimate::{BillingEstimate, EstimateDecision, EstimateDraft, EstimateRefusal, Responded};
use crate::guard::{Decision, authorize};
use crate::request::{
    AuditEntry, AuditEvent, DisputeOutcome, RequestDetails, RequestStatus, ServiceRequest,
};
use crate::resolver;
use crate::types::{EstimateId, GuestToken, Owner, Principal, RequestId, Side, TimeStamp};
use chrono::Utc;

pub use crate::guard::Operation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `estimate_id` is allocated by the caller so the transition stays deterministic.
    IssueEstimate {
        estimate_id: EstimateId,
        draft: EstimateDraft,
    },
    RespondToEstimate {
        estimate_id: EstimateId,
        decision: EstimateDecision,
    },
    AcceptAssignment,
    RefuseAssignment,
    ValidateCompletion {
        issues: Option<String>,
    },
    Dispute {
        reason: Option<String>,
    },
    ResolveDispute {
        outcome: DisputeOutcome,
        note: Option<String>,
    },
    Cancel {
        reason: Option<String>,
    },
    Abandon {
        reason: Option<String>,
    },
    ReleaseAssignment {
        reason: Option<String>,
    },
    /// A client account takes over a request submitted under `guest_token`.
    ClaimOwnership {
        guest_token: GuestToken,
    },
}

impl Command {
    pub fn operation(&self) -> Operation {
        match self {
            Self::IssueEstimate { .. } => Operation::IssueEstimate,
            Self::RespondToEstimate { .. } => Operation::RespondToEstimate,
            Self::AcceptAssignment => Operation::AcceptAssignment,
            Self::RefuseAssignment => Operation::RefuseAssignment,
            Self::ValidateCompletion { .. } => Operation::ValidateCompletion,
            Self::Dispute { .. } => Operation::Dispute,
            Self::ResolveDispute { .. } => Operation::ResolveDispute,
            Self::Cancel { .. } => Operation::Cancel,
            Self::Abandon { .. } => Operation::Abandon,
            Self::ReleaseAssignment { .. } => Operation::ReleaseAssignment,
            Self::ClaimOwnership { .. } => Operation::ClaimOwnership,
        }
    }

    /// The estimate a snapshot must carry for this command, if any.
    pub fn target_estimate(&self, request: &ServiceRequest) -> Option<EstimateId> {
        match self {
            Self::RespondToEstimate { estimate_id, .. } => Some(estimate_id.clone()),
            Self::IssueEstimate { .. } => request.active_estimate.clone(),
            _ => None,
        }
    }
}

/// The state an operation is computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub request: ServiceRequest,
    pub estimate: Option<BillingEstimate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The caller's effect was already in place; nothing to write.
    Unchanged,
    Applied {
        request: ServiceRequest,
        estimates: Vec<BillingEstimate>,
    },
}

impl Outcome {
    fn request(request: ServiceRequest) -> Self {
        Self::Applied {
            request,
            estimates: vec![],
        }
    }

    fn from_step(step: Option<ServiceRequest>) -> Self {
        step.map_or(Self::Unchanged, Self::request)
    }
}

/// Creates a new request owned by the submitting client or guest.
pub fn submit(
    principal: &Principal,
    id: RequestId,
    details: RequestDetails,
    now: TimeStamp<Utc>,
) -> Result<ServiceRequest, WorkflowError> {
    let decision = authorize(principal, None, Operation::Submit, None);
    let owner = match (decision, Owner::from_principal(principal)) {
        (Decision::Allowed, Some(owner)) => owner,
        (Decision::Denied(reason), _) => {
            return Err(WorkflowError::InvalidTransition {
                operation: Operation::Submit,
                status: None,
                reason: reason.to_string(),
            });
        }
        (Decision::Allowed, None) => {
            return Err(WorkflowError::InvalidTransition {
                operation: Operation::Submit,
                status: None,
                reason: format!("{principal} cannot own a request"),
            });
        }
    };
    if details.service_type.trim().is_empty() {
        return Err(ValidationError::MissingServiceType.into());
    }

    Ok(ServiceRequest::new(id, owner, principal.clone(), details, now))
}

/// Computes the effect of `command` on `snapshot`. The guard runs first; nothing
/// here touches storage.
pub fn apply(
    snapshot: &Snapshot,
    principal: &Principal,
    command: &Command,
    now: TimeStamp<Utc>,
    config: &WorkflowConfig,
) -> Result<Outcome, WorkflowError> {
    let request = &snapshot.request;
    let operation = command.operation();

    if let Decision::Denied(reason) =
        authorize(principal, Some(request), operation, snapshot.estimate.as_ref())
    {
        return Err(WorkflowError::invalid(operation, request.status, reason.to_string()));
    }

    let outcome = match command {
        Command::IssueEstimate { estimate_id, draft } => {
            issue_estimate(snapshot, principal, estimate_id, draft, now, config)?
        }
        Command::RespondToEstimate {
            estimate_id,
            decision,
        } => respond_to_estimate(snapshot, principal, estimate_id, decision, now)?,
        Command::AcceptAssignment => accept_assignment(request, principal, now)?,
        Command::RefuseAssignment => refuse_assignment(request, principal, now)?,
        Command::ValidateCompletion { issues } => {
            let side = party_side(request, principal, operation)?;
            Outcome::from_step(resolver::validate_completion(
                request,
                principal,
                side,
                issues.clone(),
                now,
            )?)
        }
        Command::Dispute { reason } => {
            let side = party_side(request, principal, operation)?;
            Outcome::from_step(resolver::dispute(
                request,
                principal,
                side,
                reason.clone(),
                now,
                config,
            )?)
        }
        Command::ResolveDispute { outcome, note } => Outcome::from_step(
            resolver::resolve_dispute(request, principal, *outcome, note.clone(), now)?,
        ),
        Command::Cancel { reason } => cancel(request, principal, reason, now)?,
        Command::Abandon { reason } => {
            Outcome::from_step(resolver::abandon(request, principal, reason.clone(), now)?)
        }
        Command::ReleaseAssignment { reason } => {
            release_assignment(request, principal, reason, now)?
        }
        Command::ClaimOwnership { guest_token } => {
            claim_ownership(request, principal, guest_token, now)?
        }
    };

    if let Outcome::Applied { request: next, .. } = &outcome {
        debug_assert!(
            !request.status.is_terminal() || next.status == request.status,
            "left terminal state {}",
            request.status
        );
        tracing::debug!(
            request_id = %next.id,
            %operation,
            from = %request.status,
            to = %next.status,
            version = next.version,
            "transition computed"
        );
    }
    Ok(outcome)
}

fn party_side(
    request: &ServiceRequest,
    principal: &Principal,
    operation: Operation,
) -> Result<Side, WorkflowError> {
    request
        .side_of(principal)
        .ok_or_else(|| WorkflowError::invalid(operation, request.status, "caller is not a party"))
}

fn issue_estimate(
    snapshot: &Snapshot,
    principal: &Principal,
    estimate_id: &EstimateId,
    draft: &EstimateDraft,
    now: TimeStamp<Utc>,
    config: &WorkflowConfig,
) -> Result<Outcome, WorkflowError> {
    let operation = Operation::IssueEstimate;
    let request = &snapshot.request;
    let Principal::Admin(admin) = principal else {
        return Err(WorkflowError::invalid(operation, request.status, "only an admin may do this"));
    };
    let finalised = draft.validate_and_finalise(config, now)?;
    let active = snapshot
        .estimate
        .as_ref()
        .filter(|estimate| request.active_estimate.as_ref() == Some(&estimate.id));

    let mut base = request.clone();
    let mut written = vec![];
    let requires_artisan = match request.status {
        RequestStatus::AwaitingEstimate => request.assigned_artisan.is_some(),
        RequestStatus::AwaitingEstimateAcceptance => {
            let Some(active) = active else {
                return Err(WorkflowError::NotFound {
                    kind: "estimate",
                    id: request
                        .active_estimate
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                });
            };
            if active.digest() == finalised.digest
                && active.issued_by == *admin
                && !active.is_expired(now)
            {
                // same quote issued again
                return Ok(Outcome::Unchanged);
            }
            if let Some(expired) = active.expire(now) {
                base.journal.push(AuditEntry {
                    actor: principal.clone(),
                    at: now,
                    event: AuditEvent::EstimateExpired {
                        estimate_id: expired.id.clone(),
                    },
                    status: request.status,
                });
                written.push(expired);
            } else {
                return Err(WorkflowError::invalid(
                    operation,
                    request.status,
                    format!("estimate {} is still {}", active.id, active.status()),
                ));
            }
            request.assigned_artisan.is_some()
        }
        // a revision once work has begun needs both parties to sign off
        RequestStatus::InProgress => true,
        current => {
            return Err(WorkflowError::invalid(
                operation,
                current,
                "an estimate can only be issued before work starts or while it is in progress",
            ));
        }
    };

    let estimate = BillingEstimate::issue(
        estimate_id.clone(),
        request.id.clone(),
        admin.clone(),
        finalised,
        requires_artisan,
        now,
    );
    let mut next = base.advance(
        RequestStatus::AwaitingEstimateAcceptance,
        principal,
        AuditEvent::EstimateIssued {
            estimate_id: estimate.id.clone(),
            price_total: estimate.price_total(),
            digest: estimate.digest().to_owned(),
        },
        now,
    );
    next.active_estimate = Some(estimate.id.clone());
    next.estimate_history.push(estimate.id.clone());
    written.push(estimate);

    Ok(Outcome::Applied {
        request: next,
        estimates: written,
    })
}

fn respond_to_estimate(
    snapshot: &Snapshot,
    principal: &Principal,
    estimate_id: &EstimateId,
    decision: &EstimateDecision,
    now: TimeStamp<Utc>,
) -> Result<Outcome, WorkflowError> {
    let operation = Operation::RespondToEstimate;
    let request = &snapshot.request;
    let estimate = snapshot
        .estimate
        .as_ref()
        .filter(|estimate| estimate.id == *estimate_id)
        .ok_or_else(|| WorkflowError::NotFound {
            kind: "estimate",
            id: estimate_id.to_string(),
        })?;
    let side = party_side(request, principal, operation)?;

    let responded = match estimate.respond(side, decision, now) {
        Ok(responded) => responded,
        Err(EstimateRefusal::Expired(valid_until)) => {
            return Err(WorkflowError::ExpiredEstimate {
                id: estimate.id.to_string(),
                valid_until,
            });
        }
        Err(refusal) => {
            return Err(WorkflowError::invalid(
                operation,
                request.status,
                refusal.to_string(),
            ));
        }
    };
    if matches!(responded, Responded::Unchanged) {
        return Ok(Outcome::Unchanged);
    }
    if request.status != RequestStatus::AwaitingEstimateAcceptance
        || request.active_estimate.as_ref() != Some(&estimate.id)
    {
        return Err(WorkflowError::invalid(
            operation,
            request.status,
            format!("estimate {} is not awaiting acceptance", estimate.id),
        ));
    }

    let accepted = |id: &EstimateId| AuditEvent::EstimateAccepted {
        estimate_id: id.clone(),
        side,
    };
    let (next, estimate) = match responded {
        Responded::Unchanged => return Ok(Outcome::Unchanged),
        Responded::Awaiting(estimate) => (
            request.advance(request.status, principal, accepted(&estimate.id), now),
            estimate,
        ),
        Responded::Accepted(estimate) => {
            let status = if request.assigned_artisan.is_some() {
                RequestStatus::InProgress
            } else {
                RequestStatus::AwaitingAssignment
            };
            (request.advance(status, principal, accepted(&estimate.id), now), estimate)
        }
        Responded::Rejected(estimate) => {
            let reason = estimate.response(side).rejection_reason().map(str::to_owned);
            let mut next = request.advance(
                RequestStatus::AwaitingEstimate,
                principal,
                AuditEvent::EstimateRejected {
                    estimate_id: estimate.id.clone(),
                    side,
                    reason,
                },
                now,
            );
            next.active_estimate = None;
            (next, estimate)
        }
    };

    Ok(Outcome::Applied {
        request: next,
        estimates: vec![estimate],
    })
}

fn accept_assignment(
    request: &ServiceRequest,
    principal: &Principal,
    now: TimeStamp<Utc>,
) -> Result<Outcome, WorkflowError> {
    let operation = Operation::AcceptAssignment;
    let Principal::Artisan(artisan) = principal else {
        return Err(WorkflowError::invalid(
            operation,
            request.status,
            "only an artisan may do this",
        ));
    };

    match (&request.assigned_artisan, request.status) {
        (Some(assigned), _) if assigned == artisan => Ok(Outcome::Unchanged),
        (Some(_), status) => Err(WorkflowError::invalid(
            operation,
            status,
            "request is already assigned to another artisan",
        )),
        (None, RequestStatus::AwaitingAssignment) => {
            let mut next = request.advance(
                RequestStatus::InProgress,
                principal,
                AuditEvent::AssignmentAccepted {
                    artisan: artisan.clone(),
                },
                now,
            );
            next.assigned_artisan = Some(artisan.clone());
            Ok(Outcome::request(next))
        }
        (None, status) => Err(WorkflowError::invalid(
            operation,
            status,
            "request is not open for assignment",
        )),
    }
}

fn refuse_assignment(
    request: &ServiceRequest,
    principal: &Principal,
    now: TimeStamp<Utc>,
) -> Result<Outcome, WorkflowError> {
    let operation = Operation::RefuseAssignment;
    let Principal::Artisan(artisan) = principal else {
        return Err(WorkflowError::invalid(
            operation,
            request.status,
            "only an artisan may do this",
        ));
    };
    if request.status != RequestStatus::AwaitingAssignment {
        return Err(WorkflowError::invalid(
            operation,
            request.status,
            "request is not open for assignment",
        ));
    }
    let already_refused = request.journal.iter().any(|entry| {
        matches!(&entry.event, AuditEvent::AssignmentRefused { artisan: a } if a == artisan)
    });
    if already_refused {
        return Ok(Outcome::Unchanged);
    }

    // status stays put, the request remains open to other artisans
    Ok(Outcome::request(request.advance(
        request.status,
        principal,
        AuditEvent::AssignmentRefused {
            artisan: artisan.clone(),
        },
        now,
    )))
}

fn cancel(
    request: &ServiceRequest,
    principal: &Principal,
    reason: &Option<String>,
    now: TimeStamp<Utc>,
) -> Result<Outcome, WorkflowError> {
    match request.status {
        RequestStatus::Cancelled => Ok(Outcome::Unchanged),
        status if status.is_terminal() => Err(WorkflowError::invalid(
            Operation::Cancel,
            status,
            "request is already closed",
        )),
        _ => Ok(Outcome::request(request.advance(
            RequestStatus::Cancelled,
            principal,
            AuditEvent::Cancelled {
                reason: reason.clone(),
            },
            now,
        ))),
    }
}

fn release_assignment(
    request: &ServiceRequest,
    principal: &Principal,
    reason: &Option<String>,
    now: TimeStamp<Utc>,
) -> Result<Outcome, WorkflowError> {
    let operation = Operation::ReleaseAssignment;
    let reason = reason
        .as_deref()
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .ok_or(ValidationError::MissingReason("reason for releasing the artisan"))?;

    match (request.status, &request.assigned_artisan) {
        (RequestStatus::AwaitingAssignment, None) if was_released(request) => {
            Ok(Outcome::Unchanged)
        }
        (RequestStatus::InProgress, Some(artisan)) => {
            let mut next = request.advance(
                RequestStatus::AwaitingAssignment,
                principal,
                AuditEvent::AssignmentReleased {
                    artisan: artisan.clone(),
                    reason: reason.to_owned(),
                },
                now,
            );
            next.assigned_artisan = None;
            Ok(Outcome::request(next))
        }
        (status, _) => Err(WorkflowError::invalid(
            operation,
            status,
            "an artisan can only be released while work is in progress and unvalidated",
        )),
    }
}

// whether the latest assignment event is a release, i.e. nobody took the job since
fn was_released(request: &ServiceRequest) -> bool {
    request
        .journal
        .iter()
        .rev()
        .find_map(|entry| match entry.event {
            AuditEvent::AssignmentReleased { .. } => Some(true),
            AuditEvent::AssignmentAccepted { .. } => Some(false),
            _ => None,
        })
        .unwrap_or(false)
}

fn claim_ownership(
    request: &ServiceRequest,
    principal: &Principal,
    guest_token: &GuestToken,
    now: TimeStamp<Utc>,
) -> Result<Outcome, WorkflowError> {
    let operation = Operation::ClaimOwnership;
    let Principal::Client(client) = principal else {
        return Err(WorkflowError::invalid(
            operation,
            request.status,
            "only a client account may claim a request",
        ));
    };

    match &request.owner {
        Owner::Client(owner) if owner == client => Ok(Outcome::Unchanged),
        Owner::Guest(token) if token == guest_token => {
            let mut next = request.advance(
                request.status,
                principal,
                AuditEvent::OwnershipClaimed {
                    client: client.clone(),
                },
                now,
            );
            next.owner = Owner::Client(client.clone());
            Ok(Outcome::request(next))
        }
        _ => Err(WorkflowError::invalid(
            operation,
            request.status,
            "guest token does not own this request",
        )),
    }
}
