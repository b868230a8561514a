//! Who may do what: a single pure decision table consulted before every transition
use crate::estimate::BillingEstimate;
use crate::request::{RequestStatus, ServiceRequest};
use crate::types::Principal;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Submit,
    IssueEstimate,
    RespondToEstimate,
    AcceptAssignment,
    RefuseAssignment,
    ValidateCompletion,
    Dispute,
    ResolveDispute,
    Cancel,
    Abandon,
    ReleaseAssignment,
    ClaimOwnership,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submit => "submit",
            Self::IssueEstimate => "issue_estimate",
            Self::RespondToEstimate => "respond_to_estimate",
            Self::AcceptAssignment => "accept_assignment",
            Self::RefuseAssignment => "refuse_assignment",
            Self::ValidateCompletion => "validate_completion",
            Self::Dispute => "dispute",
            Self::ResolveDispute => "resolve_dispute",
            Self::Cancel => "cancel",
            Self::Abandon => "abandon",
            Self::ReleaseAssignment => "release_assignment",
            Self::ClaimOwnership => "claim_ownership",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    AdminOnly,
    ArtisanOnly,
    OwnerOnly,
    ClientAccountOnly,
    /// Only clients and guests submit requests.
    CannotSubmit,
    /// Caller is neither the owner nor the assigned artisan.
    NotAParty,
    /// The artisan's sign-off is not part of this estimate.
    NotAnEstimateParty,
    ForeignEstimate,
    /// Owners may only cancel before an artisan takes the job.
    CancelAfterAssignment,
    MissingRequest,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AdminOnly => "only an admin may do this",
            Self::ArtisanOnly => "only an artisan may do this",
            Self::OwnerOnly => "only the owner of the request may do this",
            Self::ClientAccountOnly => "only a client account may do this",
            Self::CannotSubmit => "only clients and guests submit requests",
            Self::NotAParty => "caller is neither the owner nor the assigned artisan",
            Self::NotAnEstimateParty => "caller is not a party to this estimate",
            Self::ForeignEstimate => "estimate belongs to another request",
            Self::CancelAfterAssignment => "owners may only cancel before an artisan is assigned",
            Self::MissingRequest => "operation needs an existing request",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    fn require(condition: bool, otherwise: DenyReason) -> Self {
        if condition {
            Self::Allowed
        } else {
            Self::Denied(otherwise)
        }
    }
}

/// Decides whether `principal` may attempt `operation`. Status preconditions are
/// left to the state machine; only role rules that depend on status live here.
pub fn authorize(
    principal: &Principal,
    request: Option<&ServiceRequest>,
    operation: Operation,
    estimate: Option<&BillingEstimate>,
) -> Decision {
    let request = match (operation, request) {
        (Operation::Submit, _) => {
            return Decision::require(
                matches!(principal, Principal::Client(_) | Principal::Guest(_)),
                DenyReason::CannotSubmit,
            );
        }
        (_, Some(request)) => request,
        (_, None) => return Decision::Denied(DenyReason::MissingRequest),
    };

    match operation {
        Operation::Submit => Decision::Allowed,
        Operation::IssueEstimate
        | Operation::ResolveDispute
        | Operation::Abandon
        | Operation::ReleaseAssignment => {
            Decision::require(principal.is_admin(), DenyReason::AdminOnly)
        }
        Operation::RespondToEstimate => {
            if estimate.is_some_and(|estimate| estimate.request_id != request.id) {
                return Decision::Denied(DenyReason::ForeignEstimate);
            }
            if request.owner.is(principal) {
                return Decision::Allowed;
            }
            match request.side_of(principal) {
                Some(_) => Decision::require(
                    estimate.is_some_and(|estimate| estimate.requires_artisan),
                    DenyReason::NotAnEstimateParty,
                ),
                None => Decision::Denied(DenyReason::NotAParty),
            }
        }
        Operation::AcceptAssignment | Operation::RefuseAssignment => {
            Decision::require(matches!(principal, Principal::Artisan(_)), DenyReason::ArtisanOnly)
        }
        Operation::ValidateCompletion | Operation::Dispute => {
            Decision::require(request.side_of(principal).is_some(), DenyReason::NotAParty)
        }
        Operation::Cancel => {
            if principal.is_admin() {
                return Decision::Allowed;
            }
            if !request.owner.is(principal) {
                return Decision::Denied(DenyReason::OwnerOnly);
            }
            // a repeat on an already cancelled request reports it unchanged
            if request.status == RequestStatus::Cancelled {
                return Decision::Allowed;
            }
            let before_assignment =
                request.assigned_artisan.is_none() && request.status.is_pre_assignment();
            Decision::require(before_assignment, DenyReason::CancelAfterAssignment)
        }
        // the guest token itself is checked against the owner by the state machine
        Operation::ClaimOwnership => {
            Decision::require(
                matches!(principal, Principal::Client(_)),
                DenyReason::ClientAccountOnly,
            )
        }
    }
}
