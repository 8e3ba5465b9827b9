//! Cross-check committed metadata against stored content.

use crate::content::{ContentError, ContentStore};
use crate::meta::{MetaError, MetaStore};

/// Outcome of one audit pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuditReport {
    /// Objects whose content verified.
    pub checked: usize,
    /// Oids with no stored content.
    pub missing: Vec<String>,
    /// Oids whose stored content fails the size or hash check.
    pub corrupt: Vec<String>,
    pub errors: usize,
    pub unsupported: usize,
}

impl AuditReport {
    pub fn is_healthy(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }
}

/// Verify the content of every committed object.
pub async fn run(
    meta: &dyn MetaStore,
    content: &dyn ContentStore,
) -> Result<AuditReport, MetaError> {
    let objects = meta.objects().await?;
    tracing::info!(objects = objects.len(), "Starting audit");

    let mut report = AuditReport::default();
    for object in &objects {
        match content.verify(object).await {
            Ok(()) => report.checked += 1,
            Err(ContentError::NotFound(_)) => {
                tracing::warn!(oid = %object.oid, "Content missing");
                report.missing.push(object.oid.clone());
            }
            Err(e) if e.is_integrity() => {
                tracing::error!(oid = %object.oid, error = %e, "Content corrupt");
                report.corrupt.push(object.oid.clone());
            }
            Err(ContentError::Unsupported(_)) => report.unsupported += 1,
            Err(e) => {
                tracing::warn!(oid = %object.oid, error = %e, "Verification failed");
                report.errors += 1;
            }
        }
    }

    tracing::info!(
        checked = report.checked,
        missing = report.missing.len(),
        corrupt = report.corrupt.len(),
        errors = report.errors,
        unsupported = report.unsupported,
        "Audit complete"
    );
    Ok(report)
}
