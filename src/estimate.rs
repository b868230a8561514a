//! Billing estimates: itemized drafts, issuance and the dual acceptance protocol
use crate::config::WorkflowConfig;
use crate::error::ValidationError;
use crate::types::{AdminId, EstimateId, RequestId, Side, TimeStamp};
use chrono::Utc;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LineItem {
    #[n(0)]
    pub description: String,
    #[n(1)]
    pub quantity: i64,
    #[n(2)]
    pub unit_price: i64, // cents
}

impl LineItem {
    pub fn new(description: impl Into<String>, quantity: i64, unit_price: i64) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum EstimateStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    Rejected,
    #[n(3)]
    Expired,
}

impl fmt::Display for EstimateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A party's answer to an estimate.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum EstimateDecision {
    #[n(0)]
    Accept,
    #[n(1)]
    Reject {
        #[n(0)]
        reason: Option<String>,
    },
}

impl EstimateDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: Some(reason.into()),
        }
    }
    fn same_kind(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Accept, Self::Accept) | (Self::Reject { .. }, Self::Reject { .. })
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct PartyResponse {
    #[n(0)]
    pub decision: Option<EstimateDecision>,
    #[n(1)]
    pub responded_at: Option<TimeStamp<Utc>>,
}

impl PartyResponse {
    pub fn accepted(&self) -> bool {
        matches!(self.decision, Some(EstimateDecision::Accept))
    }
    pub fn rejected(&self) -> bool {
        matches!(self.decision, Some(EstimateDecision::Reject { .. }))
    }
    pub fn rejection_reason(&self) -> Option<&str> {
        match &self.decision {
            Some(EstimateDecision::Reject { reason }) => reason.as_deref(),
            _ => None,
        }
    }
}

/// Line items being assembled by an admin before issuance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EstimateDraft {
    breakdown: Vec<LineItem>,
    valid_until: Option<TimeStamp<Utc>>,
    declared_total: Option<i64>,
}

/// A breakdown that passed validation, with its derived total and fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalisedBreakdown {
    pub breakdown: Vec<LineItem>,
    pub price_total: i64,
    pub digest: String,
    pub valid_until: Option<TimeStamp<Utc>>,
}

impl EstimateDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_line(
        mut self,
        description: impl Into<String>,
        quantity: i64,
        unit_price: i64,
    ) -> Self {
        self.breakdown.push(LineItem::new(description, quantity, unit_price));
        self
    }
    pub fn set_valid_until(mut self, deadline: TimeStamp<Utc>) -> Self {
        self.valid_until = Some(deadline);
        self
    }
    /// A total quoted alongside the items; must agree with them.
    pub fn declare_total(mut self, total: i64) -> Self {
        self.declared_total = Some(total);
        self
    }
    pub fn breakdown(&self) -> &[LineItem] {
        &self.breakdown
    }

    // Checks fields, derives the total and fingerprints the breakdown. The
    // configured default validity applies when no deadline was set.
    pub fn validate_and_finalise(
        &self,
        config: &WorkflowConfig,
        now: TimeStamp<Utc>,
    ) -> Result<FinalisedBreakdown, ValidationError> {
        if self.breakdown.is_empty() {
            return Err(ValidationError::EmptyBreakdown);
        }
        if self.breakdown.len() > config.max_line_items {
            return Err(ValidationError::TooManyLineItems {
                count: self.breakdown.len(),
                max: config.max_line_items,
            });
        }
        for (index, item) in self.breakdown.iter().enumerate() {
            if item.description.trim().is_empty() {
                return Err(ValidationError::EmptyDescription { index });
            }
            if item.quantity <= 0 {
                return Err(ValidationError::NonPositiveQuantity {
                    index,
                    quantity: item.quantity,
                });
            }
            if item.unit_price < 0 {
                return Err(ValidationError::NegativeUnitPrice {
                    index,
                    unit_price: item.unit_price,
                });
            }
        }

        let price_total = compute_total(&self.breakdown)?;
        match self.declared_total {
            Some(declared) if declared != price_total => {
                return Err(ValidationError::TotalMismatch {
                    declared,
                    computed: price_total,
                });
            }
            _ => {}
        }

        let valid_until = match (self.valid_until, config.estimate_validity) {
            (Some(deadline), _) if deadline <= now => return Err(ValidationError::DeadlineInPast),
            (Some(deadline), _) => Some(deadline),
            (None, Some(validity)) => Some(
                now.checked_plus(validity)
                    .ok_or(ValidationError::DeadlineOutOfRange)?,
            ),
            (None, None) => None,
        };
        // the ledger stores instants as i64 nanoseconds
        if valid_until.is_some_and(|deadline| !deadline.is_encodable()) {
            return Err(ValidationError::DeadlineOutOfRange);
        }

        Ok(FinalisedBreakdown {
            digest: breakdown_digest(&self.breakdown),
            breakdown: self.breakdown.clone(),
            price_total,
            valid_until,
        })
    }
}

/// Sum of `quantity * unit_price`, with overflow reported rather than wrapped.
pub fn compute_total(breakdown: &[LineItem]) -> Result<i64, ValidationError> {
    breakdown
        .iter()
        .enumerate()
        .try_fold(0i64, |total, (index, item)| {
            item.quantity
                .checked_mul(item.unit_price)
                .and_then(|line| total.checked_add(line))
                .ok_or(ValidationError::TotalOverflow { index })
        })
}

fn breakdown_digest(breakdown: &[LineItem]) -> String {
    // encoding into a Vec cannot fail
    let cbor = minicbor::to_vec(breakdown).unwrap_or_default();
    sha256::digest(&cbor)
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct BillingEstimate {
    #[n(0)]
    pub id: EstimateId,
    #[n(1)]
    pub request_id: RequestId,
    #[n(2)]
    pub issued_by: AdminId,
    #[n(3)]
    pub issued_at: TimeStamp<Utc>,
    #[n(4)]
    breakdown: Vec<LineItem>,
    #[n(5)]
    price_total: i64,
    #[n(6)]
    digest: String,
    #[n(7)]
    pub valid_until: Option<TimeStamp<Utc>>,
    #[n(8)]
    status: EstimateStatus,
    #[n(9)]
    pub requires_artisan: bool,
    #[n(10)]
    client: PartyResponse,
    #[n(11)]
    artisan: PartyResponse,
    #[n(12)]
    pub version: u64,
}

/// Why a party's response could not be recorded.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EstimateRefusal {
    #[error("estimate expired at {0}")]
    Expired(TimeStamp<Utc>),
    #[error("estimate is already {0}")]
    AlreadyDecided(EstimateStatus),
    #[error("the {0} already answered this estimate differently")]
    ChangedMind(Side),
    #[error("the {0} is not a party to this estimate")]
    NotRequired(Side),
}

/// Result of recording a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Responded {
    /// The same answer was already on record.
    Unchanged,
    /// Recorded, the other party still has to answer.
    Awaiting(BillingEstimate),
    Accepted(BillingEstimate),
    Rejected(BillingEstimate),
}

impl BillingEstimate {
    pub fn issue(
        id: EstimateId,
        request_id: RequestId,
        issued_by: AdminId,
        finalised: FinalisedBreakdown,
        requires_artisan: bool,
        now: TimeStamp<Utc>,
    ) -> Self {
        Self {
            id,
            request_id,
            issued_by,
            issued_at: now,
            breakdown: finalised.breakdown,
            price_total: finalised.price_total,
            digest: finalised.digest,
            valid_until: finalised.valid_until,
            status: EstimateStatus::Pending,
            requires_artisan,
            client: PartyResponse::default(),
            artisan: PartyResponse::default(),
            version: 1,
        }
    }

    pub fn breakdown(&self) -> &[LineItem] {
        &self.breakdown
    }
    pub fn price_total(&self) -> i64 {
        self.price_total
    }
    pub fn digest(&self) -> &str {
        &self.digest
    }
    /// The stored status. Use [`BillingEstimate::effective_status`] for reads.
    pub fn status(&self) -> EstimateStatus {
        self.status
    }
    pub fn response(&self, side: Side) -> &PartyResponse {
        match side {
            Side::Client => &self.client,
            Side::Artisan => &self.artisan,
        }
    }

    pub fn is_expired(&self, now: TimeStamp<Utc>) -> bool {
        self.status == EstimateStatus::Pending
            && self.valid_until.is_some_and(|deadline| now > deadline)
    }

    /// Status as observed at `now`, with lazy expiry applied.
    pub fn effective_status(&self, now: TimeStamp<Utc>) -> EstimateStatus {
        if self.is_expired(now) {
            EstimateStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_accepted_by_all(&self) -> bool {
        self.client.accepted() && (!self.requires_artisan || self.artisan.accepted())
    }

    /// Checks the derived total and the status/acceptance invariants before a write.
    pub fn verify(&self) -> Result<(), ValidationError> {
        if self.breakdown.is_empty() {
            return Err(ValidationError::EmptyBreakdown);
        }
        let computed = compute_total(&self.breakdown)?;
        if computed != self.price_total {
            return Err(ValidationError::TotalMismatch {
                declared: self.price_total,
                computed,
            });
        }
        let rejected = self.client.rejected() || self.artisan.rejected();
        let consistent = match self.status {
            EstimateStatus::Accepted => self.is_accepted_by_all() && !rejected,
            EstimateStatus::Rejected => rejected,
            EstimateStatus::Pending | EstimateStatus::Expired => {
                !rejected && !self.is_accepted_by_all()
            }
        };
        if !consistent {
            return Err(ValidationError::InconsistentEstimate {
                status: self.status,
            });
        }
        Ok(())
    }

    /// Records `side`'s answer. First rejection is terminal for this estimate.
    pub fn respond(
        &self,
        side: Side,
        decision: &EstimateDecision,
        now: TimeStamp<Utc>,
    ) -> Result<Responded, EstimateRefusal> {
        if let (true, Some(deadline)) = (self.is_expired(now), self.valid_until) {
            return Err(EstimateRefusal::Expired(deadline));
        }
        if side == Side::Artisan && !self.requires_artisan {
            return Err(EstimateRefusal::NotRequired(side));
        }

        match &self.response(side).decision {
            Some(previous) if previous.same_kind(decision) => return Ok(Responded::Unchanged),
            Some(_) => return Err(EstimateRefusal::ChangedMind(side)),
            None => {}
        }
        if self.status != EstimateStatus::Pending {
            return Err(EstimateRefusal::AlreadyDecided(self.status));
        }

        let mut next = self.clone();
        let answer = PartyResponse {
            decision: Some(decision.clone()),
            responded_at: Some(now),
        };
        match side {
            Side::Client => next.client = answer,
            Side::Artisan => next.artisan = answer,
        }
        next.version += 1;

        Ok(match decision {
            EstimateDecision::Reject { .. } => {
                next.status = EstimateStatus::Rejected;
                Responded::Rejected(next)
            }
            EstimateDecision::Accept if next.is_accepted_by_all() => {
                next.status = EstimateStatus::Accepted;
                Responded::Accepted(next)
            }
            EstimateDecision::Accept => Responded::Awaiting(next),
        })
    }

    /// Persists lazy expiry once the estimate is superseded by a new one.
    pub fn expire(&self, now: TimeStamp<Utc>) -> Option<Self> {
        if !self.is_expired(now) {
            return None;
        }
        let mut next = self.clone();
        next.status = EstimateStatus::Expired;
        next.version += 1;
        Some(next)
    }
}
