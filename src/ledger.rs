//! Ledger service boundary.

use std::future::Future;

use crate::error::Result;
use crate::types::{LedgerId, LedgerMetadata};

/// Client of a service hosting append-only, quorum-replicated log segments.
///
/// Entries are numbered from zero in append order. An append returns only
/// after the ack quorum confirmed it.
pub trait LedgerService: Send + Sync + 'static {
    /// Create an open ledger. Fails with
    /// [`Error::InsufficientEnsemble`](crate::Error::InsufficientEnsemble)
    /// when fewer than `ensemble_size` storage nodes are available.
    fn create(
        &self,
        ensemble_size: usize,
        write_quorum: usize,
        ack_quorum: usize,
        digest: &[u8],
    ) -> impl Future<Output = Result<LedgerId>> + Send;

    /// Append one record to an open ledger, returning its entry number.
    fn append(&self, id: LedgerId, record: Vec<u8>) -> impl Future<Output = Result<u64>> + Send;

    /// Open an existing ledger for reading.
    fn open(&self, id: LedgerId, digest: &[u8])
        -> impl Future<Output = Result<LedgerMetadata>> + Send;

    /// Confirmed entries starting at entry number `from`, in append order.
    fn read(&self, id: LedgerId, from: u64) -> impl Future<Output = Result<Vec<Vec<u8>>>> + Send;

    /// Seal the ledger; no further appends are accepted.
    fn close(&self, id: LedgerId) -> impl Future<Output = Result<()>> + Send;

    fn delete(&self, id: LedgerId) -> impl Future<Output = Result<()>> + Send;
}
