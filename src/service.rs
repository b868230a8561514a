//! Service layer API for request workflow operations
use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::estimate::{BillingEstimate, EstimateDecision, EstimateDraft, EstimateStatus};
use crate::lifecycle::{self, Command, Outcome, Snapshot};
use crate::notify::{NotificationDispatcher, TracingDispatcher, recipients_for};
use crate::request::{AuditEntry, DisputeOutcome, RequestDetails, ServiceRequest};
use crate::store::{LedgerStore, LedgerWrite, SledLedger};
use crate::types::{Clock, EstimateId, GuestToken, Principal, RequestId, SystemClock};
use std::sync::Arc;

/// A request together with the estimate currently governing its price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestView {
    pub request: ServiceRequest,
    pub estimate: Option<BillingEstimate>,
    /// Status of `estimate` with lazy expiry applied at read time.
    pub estimate_status: Option<EstimateStatus>,
}

pub struct WorkflowService<L: LedgerStore = SledLedger> {
    ledger: L,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    config: WorkflowConfig,
}

impl WorkflowService<SledLedger> {
    /// Opens the sled ledger at `config.db_path`.
    pub fn open(config: WorkflowConfig) -> Result<Self, WorkflowError> {
        let ledger = SledLedger::open(&config)?;
        Ok(Self::new(ledger, config))
    }
}

impl<L: LedgerStore> WorkflowService<L> {
    pub fn new(ledger: L, config: WorkflowConfig) -> Self {
        Self {
            ledger,
            dispatcher: Arc::new(TracingDispatcher),
            clock: Arc::new(SystemClock),
            config,
        }
    }
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Submit a new request on behalf of a client or guest
    pub fn submit(
        &self,
        principal: &Principal,
        details: RequestDetails,
    ) -> Result<ServiceRequest, WorkflowError> {
        let id = RequestId::generate().map_err(|e| WorkflowError::Codec(e.to_string()))?;
        let request = lifecycle::submit(principal, id, details, self.clock.now())?;

        self.ledger.insert_request(&request)?;
        tracing::info!(request_id = %request.id, owner = %principal, "request submitted");
        self.dispatch(&request, &request.journal);

        Ok(request)
    }

    pub fn request(&self, request_id: &RequestId) -> Result<ServiceRequest, WorkflowError> {
        self.ledger.load_request(request_id)
    }

    /// Load a request and its active estimate
    pub fn view(&self, request_id: &RequestId) -> Result<RequestView, WorkflowError> {
        let request = self.ledger.load_request(request_id)?;
        self.view_of(request, &[])
    }

    /// Every estimate ever issued for the request, oldest first
    pub fn estimate_history(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<BillingEstimate>, WorkflowError> {
        let request = self.ledger.load_request(request_id)?;
        request
            .estimate_history
            .iter()
            .map(|id| self.ledger.load_estimate(id))
            .collect()
    }

    /// Run one command as a single read-compute-write step. A lost race surfaces
    /// as [`WorkflowError::ConcurrencyConflict`]; retrying is the caller's call.
    pub fn execute(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        command: Command,
    ) -> Result<RequestView, WorkflowError> {
        let request = self.ledger.load_request(request_id)?;
        let estimate = match command.target_estimate(&request) {
            Some(estimate_id) => Some(self.ledger.load_estimate(&estimate_id)?),
            None => None,
        };
        let snapshot = Snapshot { request, estimate };
        let operation = command.operation();

        match lifecycle::apply(&snapshot, principal, &command, self.clock.now(), &self.config)? {
            Outcome::Unchanged => {
                tracing::debug!(%request_id, %operation, "already applied, nothing to write");
                self.view_of(snapshot.request, snapshot.estimate.as_slice())
            }
            Outcome::Applied { request, estimates } => {
                let write = LedgerWrite::update(
                    &snapshot.request,
                    snapshot.estimate.as_ref(),
                    request,
                    estimates,
                );
                self.ledger.compare_and_swap(&write)?;
                tracing::info!(
                    %request_id,
                    %operation,
                    status = %write.request.status,
                    version = write.request.version,
                    "transition committed"
                );

                let fresh = &write.request.journal[snapshot.request.journal.len()..];
                self.dispatch(&write.request, fresh);

                let written: Vec<BillingEstimate> =
                    write.estimates.into_iter().map(|row| row.estimate).collect();
                self.view_of(write.request, &written)
            }
        }
    }

    /// Issue a priced estimate (admin)
    pub fn issue_estimate(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        draft: EstimateDraft,
    ) -> Result<RequestView, WorkflowError> {
        let estimate_id = EstimateId::generate().map_err(|e| WorkflowError::Codec(e.to_string()))?;
        self.execute(
            principal,
            request_id,
            Command::IssueEstimate { estimate_id, draft },
        )
    }

    pub fn respond_to_estimate(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        estimate_id: &EstimateId,
        decision: EstimateDecision,
    ) -> Result<RequestView, WorkflowError> {
        self.execute(
            principal,
            request_id,
            Command::RespondToEstimate {
                estimate_id: estimate_id.clone(),
                decision,
            },
        )
    }

    pub fn accept_assignment(
        &self,
        principal: &Principal,
        request_id: &RequestId,
    ) -> Result<RequestView, WorkflowError> {
        self.execute(principal, request_id, Command::AcceptAssignment)
    }

    pub fn refuse_assignment(
        &self,
        principal: &Principal,
        request_id: &RequestId,
    ) -> Result<RequestView, WorkflowError> {
        self.execute(principal, request_id, Command::RefuseAssignment)
    }

    pub fn validate_completion(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        issues: Option<String>,
    ) -> Result<RequestView, WorkflowError> {
        self.execute(principal, request_id, Command::ValidateCompletion { issues })
    }

    /// Raise a dispute (also known as reporting an issue)
    pub fn dispute(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        reason: impl Into<String>,
    ) -> Result<RequestView, WorkflowError> {
        self.execute(
            principal,
            request_id,
            Command::Dispute {
                reason: Some(reason.into()),
            },
        )
    }

    pub fn resolve_dispute(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        outcome: DisputeOutcome,
        note: Option<String>,
    ) -> Result<RequestView, WorkflowError> {
        self.execute(principal, request_id, Command::ResolveDispute { outcome, note })
    }

    pub fn cancel(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        reason: Option<String>,
    ) -> Result<RequestView, WorkflowError> {
        self.execute(principal, request_id, Command::Cancel { reason })
    }

    pub fn abandon(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        reason: impl Into<String>,
    ) -> Result<RequestView, WorkflowError> {
        self.execute(
            principal,
            request_id,
            Command::Abandon {
                reason: Some(reason.into()),
            },
        )
    }

    pub fn release_assignment(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        reason: impl Into<String>,
    ) -> Result<RequestView, WorkflowError> {
        self.execute(
            principal,
            request_id,
            Command::ReleaseAssignment {
                reason: Some(reason.into()),
            },
        )
    }

    pub fn claim_ownership(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        guest_token: &GuestToken,
    ) -> Result<RequestView, WorkflowError> {
        self.execute(
            principal,
            request_id,
            Command::ClaimOwnership {
                guest_token: guest_token.clone(),
            },
        )
    }

    // `known` holds estimates already in hand so the active one is not re-read
    fn view_of(
        &self,
        request: ServiceRequest,
        known: &[BillingEstimate],
    ) -> Result<RequestView, WorkflowError> {
        let estimate = match &request.active_estimate {
            Some(id) => match known.iter().find(|estimate| estimate.id == *id) {
                Some(estimate) => Some(estimate.clone()),
                None => Some(self.ledger.load_estimate(id)?),
            },
            None => None,
        };
        let now = self.clock.now();
        let estimate_status = estimate.as_ref().map(|estimate| estimate.effective_status(now));

        Ok(RequestView {
            request,
            estimate,
            estimate_status,
        })
    }

    fn dispatch(&self, request: &ServiceRequest, entries: &[AuditEntry]) {
        for entry in entries {
            let recipients = recipients_for(request, entry);
            if recipients.is_empty() {
                continue;
            }
            if let Err(err) = self.dispatcher.notify(entry, &recipients) {
                tracing::warn!(
                    request_id = %request.id,
                    error = %err,
                    "notification dispatch failed"
                );
            }
        }
    }
}
