// cms_importer/src/report.rs
// Outcome tally shared by the record tasks of one job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ImporterError, Result};
use crate::upsert::UpsertOutcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize,)]
pub struct CollectionCounts {
    /// In a dry-run: records that would be created.
    pub created: usize,
    pub found:   usize,
    pub failed:  usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize,)]
pub struct RecordFailure {
    pub collection: String,
    /// Natural key, or the record's position when it has none.
    pub record:     String,
    pub error:      String,
}

#[derive(Debug, Clone, Serialize,)]
pub struct ImportReport {
    pub run_id:        Uuid,
    pub entity:        String,
    pub collection:    String,
    pub source:        PathBuf,
    pub dry_run:       bool,
    pub total_records: usize,
    /// Top-level records only.
    pub totals:        CollectionCounts,
    /// Every collection touched, nested children included.
    pub collections:   BTreeMap<String, CollectionCounts,>,
    pub skipped:       usize,
    pub cancelled:     bool,
    pub failures:      Vec<RecordFailure,>,
    pub warnings:      Vec<String,>,
}

impl ImportReport {
    pub fn new(entity: &str, collection: &str, source: &Path, dry_run: bool,) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            entity: entity.to_string(),
            collection: collection.to_string(),
            source: source.to_path_buf(),
            dry_run,
            total_records: 0,
            totals: CollectionCounts::default(),
            collections: BTreeMap::new(),
            skipped: 0,
            cancelled: false,
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn has_failures(&self,) -> bool {
        !self.failures.is_empty()
    }

    pub fn summary_line(&self,) -> String {
        let created = if self.dry_run { "would create" } else { "created" };
        let mut line = format!(
            "{}: {} {}, {} found, {} failed",
            self.collection, self.totals.created, created, self.totals.found, self.totals.failed
        );
        if self.skipped > 0 {
            line.push_str(&format!(", {} skipped", self.skipped),);
        }
        if self.cancelled {
            line.push_str(" (cancelled)",);
        }
        line
    }

    pub fn log_summary(&self,) {
        info!("{}", self.summary_line());
        if self.collections.len() > 1 {
            for (collection, counts,) in &self.collections {
                info!(
                    "  {}: {} created, {} found, {} failed",
                    collection, counts.created, counts.found, counts.failed
                );
            }
        }
        if !self.warnings.is_empty() {
            warn!("{} warnings during import of {}", self.warnings.len(), self.source.display());
        }
    }

    pub fn save(&self, path: &Path,) -> Result<(),> {
        let json = serde_json::to_string_pretty(self,).map_err(|e| {
            ImporterError::Other(format!("Failed to serialize import report: {}", e),)
        },)?;
        std::fs::write(path, json,).map_err(|e| {
            ImporterError::Other(format!("Failed to write {}: {}", path.display(), e),)
        },)?;
        info!("Import report saved to {}", path.display());
        Ok((),)
    }
}

pub struct ProcessingRegistry {
    report: Mutex<ImportReport,>,
}

impl ProcessingRegistry {
    pub fn new(report: ImportReport,) -> Self {
        Self {
            report: Mutex::new(report,),
        }
    }

    fn with<R,>(&self, f: impl FnOnce(&mut ImportReport,) -> R,) -> R {
        let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner,);
        f(&mut report,)
    }

    pub fn set_total(&self, total: usize,) {
        self.with(|r| r.total_records = total,);
    }

    pub fn record_outcome(&self, collection: &str, outcome: UpsertOutcome, top_level: bool,) {
        self.with(|r| {
            let counts = r.collections.entry(collection.to_string(),).or_default();
            bump(counts, outcome,);
            if top_level {
                bump(&mut r.totals, outcome,);
            }
        },);
    }

    pub fn record_failure(&self, collection: &str, record: &str, err: &ImporterError, top_level: bool,) {
        error!("Failed {} '{}': {}", collection, record, err);
        self.with(|r| {
            r.collections.entry(collection.to_string(),).or_default().failed += 1;
            if top_level {
                r.totals.failed += 1;
            }
            r.failures.push(RecordFailure {
                collection: collection.to_string(),
                record:     record.to_string(),
                error:      err.to_string(),
            },);
        },);
    }

    pub fn record_warning(&self, message: String,) {
        self.with(|r| r.warnings.push(message,),);
    }

    pub fn record_skipped(&self, count: usize,) {
        self.with(|r| {
            r.skipped += count;
            r.cancelled = true;
        },);
    }

    pub fn snapshot(&self,) -> ImportReport {
        self.with(|r| r.clone(),)
    }
}

fn bump(counts: &mut CollectionCounts, outcome: UpsertOutcome,) {
    match outcome {
        UpsertOutcome::Found => counts.found += 1,
        UpsertOutcome::Created | UpsertOutcome::WouldCreate => counts.created += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dry_run: bool,) -> ProcessingRegistry {
        ProcessingRegistry::new(ImportReport::new(
            "country",
            "countries",
            Path::new("countries.json",),
            dry_run,
        ),)
    }

    #[test]
    fn nested_outcomes_do_not_count_towards_totals() {
        let registry = registry(false,);
        registry.record_outcome("countries", UpsertOutcome::Created, true,);
        registry.record_outcome("provinces", UpsertOutcome::Created, false,);
        registry.record_outcome("provinces", UpsertOutcome::Found, false,);
        registry.record_failure(
            "provinces",
            "11",
            &ImporterError::MissingNaturalKey("ProvinceId".to_string(),),
            false,
        );

        let report = registry.snapshot();
        assert_eq!(report.totals, CollectionCounts { created: 1, found: 0, failed: 0 });
        assert_eq!(report.collections["provinces"], CollectionCounts { created: 1, found: 1, failed: 1 });
        assert_eq!(report.failures[0].record, "11");
    }

    #[test]
    fn dry_run_summary_says_would_create() {
        let registry = registry(true,);
        registry.record_outcome("countries", UpsertOutcome::WouldCreate, true,);
        registry.record_skipped(2,);
        let line = registry.snapshot().summary_line();
        assert_eq!(line, "countries: 1 would create, 0 found, 0 failed, 2 skipped (cancelled)");
    }

    #[test]
    fn report_serializes_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("import_report.json",);
        let registry = registry(false,);
        registry.record_warning("missing location 9".to_string(),);
        registry.snapshot().save(&path,).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path,).unwrap(),).unwrap();
        assert_eq!(written["collection"], "countries");
        assert_eq!(written["warnings"][0], "missing location 9");
    }
}
