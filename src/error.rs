use crate::importers::ImportError;
use crate::prices::PriceError;
use crate::reconcile::ReconcileError;
use crate::snapshot::SnapshotError;
use crate::tax::fifo::FifoError;

/// Exit codes promised by the CLI contract.
pub const EXIT_INPUT: i32 = 2;
pub const EXIT_MISSING_PRICE: i32 = 3;
pub const EXIT_INVARIANT: i32 = 4;

/// Top-level error for a pipeline run. Per-row problems never reach this
/// type; they are recovered locally and recorded in the audit trail.
#[derive(Debug, thiserror::Error)]
pub enum QntropyError {
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Price(#[from] PriceError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Fifo(#[from] FifoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QntropyError {
    pub fn exit_code(&self) -> i32 {
        match self {
            QntropyError::Import(_) | QntropyError::Snapshot(_) => EXIT_INPUT,
            QntropyError::Price(_) => EXIT_MISSING_PRICE,
            QntropyError::Reconcile(err) => match err {
                ReconcileError::Fatal(_) => EXIT_INVARIANT,
                ReconcileError::SnapshotBeforeLastTx { .. } => EXIT_INPUT,
            },
            QntropyError::Fifo(_) => EXIT_INVARIANT,
            QntropyError::Io(_) => 1,
        }
    }
}
