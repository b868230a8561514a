//! Service requests, their status model and the append-only audit journal
use crate::types::{ArtisanId, ClientId, EstimateId, Owner, Principal, RequestId, Side, TimeStamp};
use chrono::Utc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum RequestStatus {
    #[n(0)]
    AwaitingEstimate,
    #[n(1)]
    AwaitingEstimateAcceptance,
    #[n(2)]
    AwaitingAssignment,
    #[n(3)]
    InProgress,
    #[n(4)]
    ClientValidated,
    #[n(5)]
    ArtisanValidated,
    #[n(6)]
    Completed,
    #[n(7)]
    CompletedWithIssues,
    #[n(8)]
    CouldNotComplete,
    #[n(9)]
    DisputedByClient,
    #[n(10)]
    DisputedByArtisan,
    #[n(11)]
    DisputedByBoth,
    #[n(12)]
    Resolved,
    #[n(13)]
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 14] = [
        Self::AwaitingEstimate,
        Self::AwaitingEstimateAcceptance,
        Self::AwaitingAssignment,
        Self::InProgress,
        Self::ClientValidated,
        Self::ArtisanValidated,
        Self::Completed,
        Self::CompletedWithIssues,
        Self::CouldNotComplete,
        Self::DisputedByClient,
        Self::DisputedByArtisan,
        Self::DisputedByBoth,
        Self::Resolved,
        Self::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::CompletedWithIssues
                | Self::CouldNotComplete
                | Self::Resolved
                | Self::Cancelled
        )
    }

    pub fn is_disputed(&self) -> bool {
        matches!(
            self,
            Self::DisputedByClient | Self::DisputedByArtisan | Self::DisputedByBoth
        )
    }

    /// States in which no artisan has started work yet.
    pub fn is_pre_assignment(&self) -> bool {
        matches!(
            self,
            Self::AwaitingEstimate | Self::AwaitingEstimateAcceptance | Self::AwaitingAssignment
        )
    }

    /// The single-sided validated state for `side`.
    pub fn validated_by(side: Side) -> Self {
        match side {
            Side::Client => Self::ClientValidated,
            Side::Artisan => Self::ArtisanValidated,
        }
    }

    /// The single-sided dispute state for `side`.
    pub fn disputed_by(side: Side) -> Self {
        match side {
            Side::Client => Self::DisputedByClient,
            Side::Artisan => Self::DisputedByArtisan,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingEstimate => "AWAITING_ESTIMATE",
            Self::AwaitingEstimateAcceptance => "AWAITING_ESTIMATE_ACCEPTANCE",
            Self::AwaitingAssignment => "AWAITING_ASSIGNMENT",
            Self::InProgress => "IN_PROGRESS",
            Self::ClientValidated => "CLIENT_VALIDATED",
            Self::ArtisanValidated => "ARTISAN_VALIDATED",
            Self::Completed => "COMPLETED",
            Self::CompletedWithIssues => "COMPLETED_WITH_ISSUES",
            Self::CouldNotComplete => "COULD_NOT_COMPLETE",
            Self::DisputedByClient => "DISPUTED_BY_CLIENT",
            Self::DisputedByArtisan => "DISPUTED_BY_ARTISAN",
            Self::DisputedByBoth => "DISPUTED_BY_BOTH",
            Self::Resolved => "RESOLVED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Urgency {
    #[n(0)]
    Low,
    #[default]
    #[n(1)]
    Normal,
    #[n(2)]
    High,
    #[n(3)]
    Emergency,
}

/// Descriptive attributes. Nothing in the state machine branches on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct RequestDetails {
    #[n(0)]
    pub service_type: String,
    #[n(1)]
    pub urgency: Urgency,
    #[n(2)]
    pub location: String,
    #[n(3)]
    pub description: String,
    #[n(4)]
    pub photo_urls: Vec<String>, // opaque references into the file store
}

impl RequestDetails {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            ..Self::default()
        }
    }
    pub fn set_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }
    pub fn set_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }
    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
    pub fn add_photo(mut self, url: impl Into<String>) -> Self {
        self.photo_urls.push(url.into());
        self
    }
}

/// One side's standing after work started: validated, disputed, or neither.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Stance {
    #[n(0)]
    Validated {
        #[n(0)]
        at: TimeStamp<Utc>,
        #[n(1)]
        issues: Option<String>,
    },
    #[n(1)]
    Disputed {
        #[n(0)]
        at: TimeStamp<Utc>,
        #[n(1)]
        reason: String,
    },
}

/// Per-side completion stances. Once set, a side's stance never changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ValidationRecord {
    #[n(0)]
    pub client: Option<Stance>,
    #[n(1)]
    pub artisan: Option<Stance>,
}

impl ValidationRecord {
    pub fn stance(&self, side: Side) -> Option<&Stance> {
        match side {
            Side::Client => self.client.as_ref(),
            Side::Artisan => self.artisan.as_ref(),
        }
    }
    pub fn set(&mut self, side: Side, stance: Stance) {
        match side {
            Side::Client => self.client = Some(stance),
            Side::Artisan => self.artisan = Some(stance),
        }
    }
    pub fn has_validated(&self, side: Side) -> bool {
        matches!(self.stance(side), Some(Stance::Validated { .. }))
    }
    pub fn has_disputed(&self, side: Side) -> bool {
        matches!(self.stance(side), Some(Stance::Disputed { .. }))
    }
    /// True when either side validated with reservations.
    pub fn has_issues(&self) -> bool {
        [&self.client, &self.artisan].into_iter().any(|stance| {
            matches!(stance, Some(Stance::Validated { issues: Some(_), .. }))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum DisputeOutcome {
    #[n(0)]
    FavorClient,
    #[n(1)]
    FavorArtisan,
    #[n(2)]
    Split,
    #[n(3)]
    Dismissed,
}

impl fmt::Display for DisputeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FavorClient => "in favor of the client",
            Self::FavorArtisan => "in favor of the artisan",
            Self::Split => "split",
            Self::Dismissed => "dismissed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct DisputeResolution {
    #[n(0)]
    pub outcome: DisputeOutcome,
    #[n(1)]
    pub note: Option<String>,
    #[n(2)]
    pub resolved_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AuditEvent {
    #[n(0)]
    Submitted,
    #[n(1)]
    EstimateIssued {
        #[n(0)]
        estimate_id: EstimateId,
        #[n(1)]
        price_total: i64,
        #[n(2)]
        digest: String,
    },
    #[n(2)]
    EstimateAccepted {
        #[n(0)]
        estimate_id: EstimateId,
        #[n(1)]
        side: Side,
    },
    #[n(3)]
    EstimateRejected {
        #[n(0)]
        estimate_id: EstimateId,
        #[n(1)]
        side: Side,
        #[n(2)]
        reason: Option<String>,
    },
    #[n(4)]
    EstimateExpired {
        #[n(0)]
        estimate_id: EstimateId,
    },
    #[n(5)]
    AssignmentAccepted {
        #[n(0)]
        artisan: ArtisanId,
    },
    #[n(6)]
    AssignmentRefused {
        #[n(0)]
        artisan: ArtisanId,
    },
    #[n(7)]
    AssignmentReleased {
        #[n(0)]
        artisan: ArtisanId,
        #[n(1)]
        reason: String,
    },
    #[n(8)]
    CompletionValidated {
        #[n(0)]
        side: Side,
        #[n(1)]
        issues: Option<String>,
    },
    #[n(9)]
    DisputeRaised {
        #[n(0)]
        side: Side,
        #[n(1)]
        reason: String,
    },
    #[n(10)]
    DisputeResolved {
        #[n(0)]
        outcome: DisputeOutcome,
        #[n(1)]
        note: Option<String>,
    },
    #[n(11)]
    Abandoned {
        #[n(0)]
        reason: String,
    },
    #[n(12)]
    Cancelled {
        #[n(0)]
        reason: Option<String>,
    },
    #[n(13)]
    OwnershipClaimed {
        #[n(0)]
        client: ClientId,
    },
}

/// A journal line: who did what, when, and the status it left the request in.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct AuditEntry {
    #[n(0)]
    pub actor: Principal,
    #[n(1)]
    pub at: TimeStamp<Utc>,
    #[n(2)]
    pub event: AuditEvent,
    #[n(3)]
    pub status: RequestStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ServiceRequest {
    #[n(0)]
    pub id: RequestId,
    #[n(1)]
    pub status: RequestStatus,
    #[n(2)]
    pub owner: Owner,
    #[n(3)]
    pub assigned_artisan: Option<ArtisanId>,
    #[n(4)]
    pub active_estimate: Option<EstimateId>,
    #[n(5)]
    pub estimate_history: Vec<EstimateId>,
    #[n(6)]
    pub details: RequestDetails,
    #[n(7)]
    pub validation: ValidationRecord,
    #[n(8)]
    pub resolution: Option<DisputeResolution>,
    #[n(9)]
    pub journal: Vec<AuditEntry>,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub updated_at: TimeStamp<Utc>,
    #[n(12)]
    pub version: u64,
}

impl ServiceRequest {
    pub fn new(
        id: RequestId,
        owner: Owner,
        submitted_by: Principal,
        details: RequestDetails,
        now: TimeStamp<Utc>,
    ) -> Self {
        let status = RequestStatus::AwaitingEstimate;
        Self {
            id,
            status,
            owner,
            assigned_artisan: None,
            active_estimate: None,
            estimate_history: vec![],
            details,
            validation: ValidationRecord::default(),
            resolution: None,
            journal: vec![AuditEntry {
                actor: submitted_by,
                at: now,
                event: AuditEvent::Submitted,
                status,
            }],
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// The side `principal` acts for on this request, if any.
    pub fn side_of(&self, principal: &Principal) -> Option<Side> {
        if self.owner.is(principal) {
            return Some(Side::Client);
        }
        match (principal, &self.assigned_artisan) {
            (Principal::Artisan(caller), Some(assigned)) if caller == assigned => {
                Some(Side::Artisan)
            }
            _ => None,
        }
    }

    /// Clone for the next version: status set, timestamp refreshed, event journaled.
    pub(crate) fn advance(
        &self,
        status: RequestStatus,
        actor: &Principal,
        event: AuditEvent,
        now: TimeStamp<Utc>,
    ) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.updated_at = now;
        next.version += 1;
        next.journal.push(AuditEntry {
            actor: actor.clone(),
            at: now,
            event,
            status,
        });
        next
    }

    pub fn last_event(&self) -> Option<&AuditEntry> {
        self.journal.last()
    }
}
