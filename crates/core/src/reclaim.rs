//! Deferred reclamation of a removed member's storage claim.
//!
//! A claim is only deleted once an earlier step has stamped it with a
//! non-empty defer-delete marker. A missing claim or marker is expected
//! transient state and is reported as a [`SkipReason`], never as an error.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::{claim_name, ClaimRecord, Ordinal, SkipReason, DEFAULT_DEFER_DELETE_ANNOTATION};

/// Read/delete access to storage claims of one namespace.
///
/// Lookups may lag behind recent writes; `Ok(None)` is not authoritative.
#[async_trait::async_trait]
pub trait ClaimBackend: Send + Sync {
    async fn get_claim(&self, name: &str) -> anyhow::Result<Option<ClaimRecord>>;
    async fn delete_claim(&self, name: &str) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<B: ClaimBackend + ?Sized> ClaimBackend for std::sync::Arc<B> {
    async fn get_claim(&self, name: &str) -> anyhow::Result<Option<ClaimRecord>> {
        (**self).get_claim(name).await
    }

    async fn delete_claim(&self, name: &str) -> anyhow::Result<()> {
        (**self).delete_claim(name).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReclaimError {
    #[error("looking up claim {claim}")]
    Lookup {
        claim: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("deleting claim {claim}")]
    Delete {
        claim: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ReclaimError {
    pub fn claim(&self) -> &str {
        match self {
            ReclaimError::Lookup { claim, .. } | ReclaimError::Delete { claim, .. } => claim,
        }
    }
}

/// Why `record` must not be deleted yet, or `None` when it may be.
pub fn skip_reason(record: Option<&ClaimRecord>, marker_key: &str) -> Option<SkipReason> {
    let record = match record {
        Some(r) => r,
        None => return Some(SkipReason::ClaimNotFound),
    };
    // An empty map falls through to MarkerEmpty.
    let annotations = match record.annotations.as_ref() {
        Some(a) => a,
        None => return Some(SkipReason::MarkerAbsent),
    };
    match annotations.get(marker_key) {
        Some(v) if !v.is_empty() => None,
        _ => Some(SkipReason::MarkerEmpty),
    }
}

pub struct DeferredStorageGuard<B> {
    backend: B,
    marker_key: String,
}

impl<B: ClaimBackend> DeferredStorageGuard<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, marker_key: DEFAULT_DEFER_DELETE_ANNOTATION.to_string() }
    }

    /// Use a different annotation key as the defer-delete marker.
    pub fn with_marker_key(mut self, key: impl Into<String>) -> Self {
        self.marker_key = key.into();
        self
    }

    pub fn marker_key(&self) -> &str {
        &self.marker_key
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Delete the claim of `ordinal` if its removal has been recorded.
    ///
    /// `Ok(Some(_))` means nothing was deleted this pass; `Ok(None)` means the
    /// claim was deleted.
    pub async fn reclaim(&self, group_name: &str, member_kind: &str, ordinal: Ordinal) -> Result<Option<SkipReason>, ReclaimError> {
        let claim = claim_name(member_kind, group_name, ordinal);
        let record = self
            .backend
            .get_claim(&claim)
            .await
            .map_err(|source| ReclaimError::Lookup { claim: claim.clone(), source })?;

        if let Some(reason) = skip_reason(record.as_ref(), &self.marker_key) {
            debug!(group = %group_name, ordinal, claim = %claim, reason = %reason, "claim reclamation skipped");
            return Ok(Some(reason));
        }

        match self.backend.delete_claim(&claim).await {
            Ok(()) => {
                info!(group = %group_name, ordinal, claim = %claim, "deleted deferred claim");
                Ok(None)
            }
            Err(source) => {
                warn!(group = %group_name, ordinal, claim = %claim, error = %source, "deleting deferred claim failed");
                Err(ReclaimError::Delete { claim, source })
            }
        }
    }

    /// [`reclaim`](Self::reclaim) for several ordinals, ascending. Only skipped
    /// ordinals appear in the result; the first hard error aborts the batch.
    pub async fn reclaim_many(
        &self,
        group_name: &str,
        member_kind: &str,
        ordinals: impl IntoIterator<Item = Ordinal>,
    ) -> Result<BTreeMap<Ordinal, SkipReason>, ReclaimError> {
        let mut ordered: Vec<Ordinal> = ordinals.into_iter().collect();
        ordered.sort_unstable();
        ordered.dedup();
        let mut skipped = BTreeMap::new();
        for ordinal in ordered {
            if let Some(reason) = self.reclaim(group_name, member_kind, ordinal).await? {
                skipped.insert(ordinal, reason);
            }
        }
        Ok(skipped)
    }
}
