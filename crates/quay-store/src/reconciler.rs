//! Anti-entropy between the relational store and the document mirror.
//!
//! Mirror writes are best-effort, so the two stores can drift: a crash
//! between the relational commit and the document write, a failed document
//! write, or a delete whose document removal failed. The reconciler walks a
//! collection in both stores, reports drift, and can repair it by
//! re-mirroring relational rows and deleting orphaned documents.
//!
//! Documents may carry fields the relational row does not have (the mirror
//! merges, the relational upsert replaces). That is not drift; only fields
//! present in the row are compared.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use quay_core::{EntityKind, Record, RecordId};
use serde::{Deserialize, Serialize};

use crate::document::DocumentStore;
use crate::error::Result;
use crate::metrics::record_reconcile_issues;
use crate::relational::{list_all, ListQuery, RelationalStore};

// ============================================================================
// Reconciliation Report
// ============================================================================

/// Report from a reconciliation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    /// Collection that was checked.
    pub collection: String,

    /// When the check was performed.
    pub checked_at: DateTime<Utc>,

    /// Rows in the relational store.
    pub relational_count: usize,

    /// Documents in the document store.
    pub document_count: usize,

    /// Issues found during reconciliation.
    pub issues: Vec<ReconciliationIssue>,
}

impl ReconciliationReport {
    /// Returns true if any issues were found.
    #[must_use]
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    /// Returns issues of a specific type.
    #[must_use]
    pub fn issues_of_type(&self, issue_type: IssueType) -> Vec<&ReconciliationIssue> {
        self.issues
            .iter()
            .filter(|i| i.issue_type == issue_type)
            .collect()
    }
}

/// A specific reconciliation issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationIssue {
    /// Type of issue.
    pub issue_type: IssueType,

    /// Affected record id.
    pub id: String,

    /// Human-readable description.
    pub description: String,

    /// Whether this issue is auto-repairable.
    pub repairable: bool,
}

/// Type of reconciliation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    /// A row has no document.
    MissingDocument,
    /// A document disagrees with its row on a field the row has.
    DivergentDocument,
    /// A document has no row.
    OrphanedDocument,
}

/// Result of a repair pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairResult {
    /// Collection that was repaired.
    pub collection: String,

    /// When the repair finished.
    pub repaired_at: DateTime<Utc>,

    /// Issues fixed.
    pub repaired_count: usize,

    /// Issues not attempted.
    pub skipped_count: usize,

    /// Issues whose fix failed.
    pub failed_count: usize,
}

// ============================================================================
// Reconciler
// ============================================================================

/// Anti-entropy reconciler over both stores.
#[derive(Clone)]
pub struct Reconciler {
    relational: Arc<dyn RelationalStore>,
    documents: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(relational: Arc<dyn RelationalStore>, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            relational,
            documents,
        }
    }

    /// Checks a collection for drift.
    ///
    /// # Errors
    ///
    /// Returns an error if either store cannot be read.
    pub async fn check(&self, kind: EntityKind) -> Result<ReconciliationReport> {
        tracing::info!(collection = kind.collection(), "starting reconciliation check");

        let rows = list_all(self.relational.as_ref(), kind, ListQuery::new()).await?;
        let document_ids: BTreeSet<String> =
            self.documents.list_ids(kind).await?.into_iter().collect();

        let mut report = ReconciliationReport {
            collection: kind.collection().to_string(),
            checked_at: Utc::now(),
            relational_count: rows.len(),
            document_count: document_ids.len(),
            issues: Vec::new(),
        };

        let mut row_ids = BTreeSet::new();
        for row in &rows {
            row_ids.insert(row.id.clone());
            let id = RecordId::new(row.id.clone())?;
            let Some(document) = self.documents.get(kind, &id).await? else {
                report.issues.push(ReconciliationIssue {
                    issue_type: IssueType::MissingDocument,
                    id: row.id.clone(),
                    description: "relational row has no document".to_string(),
                    repairable: true,
                });
                continue;
            };

            let differing: Vec<&str> = row
                .body
                .iter()
                .filter(|(key, value)| document.get(key.as_str()) != Some(*value))
                .map(|(key, _)| key.as_str())
                .collect();
            if !differing.is_empty() {
                report.issues.push(ReconciliationIssue {
                    issue_type: IssueType::DivergentDocument,
                    id: row.id.clone(),
                    description: format!("document differs on: {}", differing.join(", ")),
                    repairable: true,
                });
            }
        }

        for orphan in document_ids.difference(&row_ids) {
            report.issues.push(ReconciliationIssue {
                issue_type: IssueType::OrphanedDocument,
                id: orphan.clone(),
                description: "document has no relational row".to_string(),
                repairable: true,
            });
        }

        record_reconcile_issues(kind.collection(), report.issues.len());
        tracing::info!(
            collection = kind.collection(),
            relational = report.relational_count,
            documents = report.document_count,
            issues = report.issues.len(),
            "reconciliation check complete"
        );
        Ok(report)
    }

    /// Repairs issues found in a reconciliation report.
    ///
    /// Rows are re-read at repair time so a repair never resurrects a row
    /// deleted since the check.
    ///
    /// # Errors
    ///
    /// Returns an error if the report names an unknown collection.
    pub async fn repair(&self, report: &ReconciliationReport) -> Result<RepairResult> {
        let kind = EntityKind::from_collection(&report.collection).ok_or_else(|| {
            quay_core::Error::UnknownEntity {
                name: report.collection.clone(),
            }
        })?;

        let mut result = RepairResult {
            collection: report.collection.clone(),
            repaired_at: Utc::now(),
            repaired_count: 0,
            skipped_count: 0,
            failed_count: 0,
        };

        for issue in &report.issues {
            if !issue.repairable {
                result.skipped_count += 1;
                continue;
            }

            match self.repair_issue(kind, issue).await {
                Ok(true) => result.repaired_count += 1,
                Ok(false) => result.skipped_count += 1,
                Err(e) => {
                    tracing::error!(
                        collection = kind.collection(),
                        id = %issue.id,
                        error = %e,
                        "failed to repair drift"
                    );
                    result.failed_count += 1;
                }
            }
        }

        result.repaired_at = Utc::now();
        tracing::info!(
            collection = kind.collection(),
            repaired = result.repaired_count,
            skipped = result.skipped_count,
            failed = result.failed_count,
            "reconciliation repair complete"
        );
        Ok(result)
    }

    async fn repair_issue(&self, kind: EntityKind, issue: &ReconciliationIssue) -> Result<bool> {
        let id = RecordId::new(issue.id.clone())?;
        match issue.issue_type {
            IssueType::MissingDocument | IssueType::DivergentDocument => {
                let Some(row) = self.relational.get(kind, &id).await? else {
                    return Ok(false);
                };
                let record = Record::with_id(id, row.body);
                self.documents
                    .merge_upsert(kind, record.id(), record.body())
                    .await?;
                Ok(true)
            }
            IssueType::OrphanedDocument => {
                if self.relational.get(kind, &id).await?.is_some() {
                    return Ok(false);
                }
                self.documents.delete(kind, &id).await?;
                Ok(true)
            }
        }
    }
}
