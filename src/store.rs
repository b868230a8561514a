//! Ledger storage with optimistic concurrency
use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::estimate::BillingEstimate;
use crate::request::ServiceRequest;
use crate::types::{EstimateId, RequestId};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, TransactionalTree,
};
use std::sync::Arc;

/// Records carrying the version counter compared on write.
pub trait Versioned {
    fn version(&self) -> u64;
}

impl Versioned for ServiceRequest {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for BillingEstimate {
    fn version(&self) -> u64 {
        self.version
    }
}

/// An estimate to write and the version it must still have in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimateWrite {
    pub estimate: BillingEstimate,
    /// `None` when the estimate is new.
    pub expected_version: Option<u64>,
}

/// Everything one transition writes. Applied atomically or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerWrite {
    pub request: ServiceRequest,
    /// `None` when the request is new.
    pub expected_version: Option<u64>,
    pub estimates: Vec<EstimateWrite>,
}

impl LedgerWrite {
    pub fn insert(request: ServiceRequest) -> Self {
        Self {
            request,
            expected_version: None,
            estimates: vec![],
        }
    }

    /// A write of `request` and `estimates` over the versions read into the snapshot.
    pub fn update(
        read: &ServiceRequest,
        read_estimate: Option<&BillingEstimate>,
        request: ServiceRequest,
        estimates: Vec<BillingEstimate>,
    ) -> Self {
        let estimates = estimates
            .into_iter()
            .map(|estimate| EstimateWrite {
                expected_version: read_estimate
                    .filter(|read| read.id == estimate.id)
                    .map(|read| read.version),
                estimate,
            })
            .collect();
        Self {
            request,
            expected_version: Some(read.version),
            estimates,
        }
    }
}

/// The persistence collaborator. Implementations must apply a [`LedgerWrite`]
/// atomically and reject it if any expected version is stale.
pub trait LedgerStore: Send + Sync {
    fn load_request(&self, id: &RequestId) -> Result<ServiceRequest, WorkflowError>;
    fn load_estimate(&self, id: &EstimateId) -> Result<BillingEstimate, WorkflowError>;
    fn compare_and_swap(&self, write: &LedgerWrite) -> Result<(), WorkflowError>;

    /// Writes a brand new request; fails if the id is already taken.
    fn insert_request(&self, request: &ServiceRequest) -> Result<(), WorkflowError> {
        self.compare_and_swap(&LedgerWrite::insert(request.clone()))
    }
}

fn request_key(id: &RequestId) -> String {
    format!("request/{id}")
}

fn estimate_key(id: &EstimateId) -> String {
    format!("estimate/{id}")
}

/// CBOR records in a sled database, one key per entity.
pub struct SledLedger {
    instance: Arc<sled::Db>,
}

impl SledLedger {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn open(config: &WorkflowConfig) -> Result<Self, WorkflowError> {
        let db = sled::open(&config.db_path)?;
        tracing::info!(path = %config.db_path.display(), "ledger opened");
        Ok(Self::new(Arc::new(db)))
    }

    fn load<T>(&self, kind: &'static str, key: &str, id: &str) -> Result<T, WorkflowError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.instance.get(key.as_bytes())? {
            Some(bytes) => Ok(minicbor::decode(&bytes)?),
            None => Err(WorkflowError::NotFound {
                kind,
                id: id.to_owned(),
            }),
        }
    }
}

fn abort(err: WorkflowError) -> ConflictableTransactionError<WorkflowError> {
    ConflictableTransactionError::Abort(err)
}

fn check_version<T>(
    tx: &TransactionalTree,
    key: &str,
    id: &str,
    expected: Option<u64>,
) -> ConflictableTransactionResult<(), WorkflowError>
where
    T: Versioned + for<'b> minicbor::Decode<'b, ()>,
{
    let found = match tx.get(key.as_bytes())? {
        Some(bytes) => Some(
            minicbor::decode::<T>(&bytes)
                .map_err(|e| abort(e.into()))?
                .version(),
        ),
        None => None,
    };
    if found != expected {
        return Err(abort(WorkflowError::ConcurrencyConflict {
            id: id.to_owned(),
            expected,
            found,
        }));
    }
    Ok(())
}

impl LedgerStore for SledLedger {
    fn load_request(&self, id: &RequestId) -> Result<ServiceRequest, WorkflowError> {
        self.load("request", &request_key(id), id.as_str())
    }

    fn load_estimate(&self, id: &EstimateId) -> Result<BillingEstimate, WorkflowError> {
        self.load("estimate", &estimate_key(id), id.as_str())
    }

    fn compare_and_swap(&self, write: &LedgerWrite) -> Result<(), WorkflowError> {
        // encode and check derived totals before entering the transaction
        let request_row = (
            request_key(&write.request.id),
            minicbor::to_vec(&write.request)?,
        );
        let mut estimate_rows = Vec::with_capacity(write.estimates.len());
        for row in &write.estimates {
            row.estimate.verify()?;
            estimate_rows.push((
                estimate_key(&row.estimate.id),
                row.estimate.id.to_string(),
                minicbor::to_vec(&row.estimate)?,
                row.expected_version,
            ));
        }

        let result: TransactionResult<(), WorkflowError> = self.instance.transaction(|tx| {
            check_version::<ServiceRequest>(
                tx,
                &request_row.0,
                write.request.id.as_str(),
                write.expected_version,
            )?;
            for (key, id, _, expected) in &estimate_rows {
                check_version::<BillingEstimate>(tx, key, id, *expected)?;
            }

            tx.insert(request_row.0.as_bytes(), request_row.1.clone())?;
            for (key, _, bytes, _) in &estimate_rows {
                tx.insert(key.as_bytes(), bytes.clone())?;
            }
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(err)) => {
                if err.is_retryable() {
                    tracing::warn!(
                        request_id = %write.request.id,
                        %err,
                        "ledger write lost a race"
                    );
                }
                Err(err)
            }
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }
}
