// cms_importer/src/runner.rs
// Runs one import job: read, dispatch records, upsert, link, tally.

use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::entity::{ChildSpec, EntitySpec, canonical_key, is_blank};
use crate::error::{ImporterError, Result};
use crate::linker::{LinkOutcome, Linker};
use crate::reader::{SourceRecord, as_record, read_records};
use crate::report::{ImportReport, ProcessingRegistry};
use crate::retry::RetryPolicy;
use crate::store::{Entity, EntityStore, Fields};
use crate::upsert::{UpsertEngine, UpsertOutcome};

#[derive(Debug, Clone,)]
pub struct JobOptions {
    pub dry_run:     bool,
    /// Records processed at once; 0 means no bound.
    pub concurrency: usize,
    /// Import only a random subset of this many records.
    pub sample:      Option<usize,>,
    pub seed:        Option<u64,>,
    pub retry:       RetryPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            dry_run:     false,
            concurrency: crate::DEFAULT_CONCURRENCY,
            sample:      None,
            seed:        None,
            retry:       RetryPolicy::default(),
        }
    }
}

/// One file imported into one collection.
#[derive(Debug, Clone,)]
pub struct ImportJob {
    pub path:    PathBuf,
    pub spec:    EntitySpec,
    pub options: JobOptions,
}

/// Stops a running job from dispatching further records.
#[derive(Debug, Clone, Default,)]
pub struct CancelFlag(Arc<AtomicBool,>,);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self,) {
        self.0.store(true, Ordering::SeqCst,);
    }

    pub fn is_cancelled(&self,) -> bool {
        self.0.load(Ordering::SeqCst,)
    }

    /// Cancels on the first `interrupt`, then waits for a second one.
    /// Returns `true` on that second interrupt, `false` if the signal source
    /// fails.
    pub async fn watch_interrupts<S, F,>(&self, mut interrupt: S,) -> bool
    where
        S: FnMut() -> F,
        F: Future<Output = std::io::Result<(),>,>,
    {
        if interrupt().await.is_err() {
            return false;
        }
        warn!("Interrupted, finishing records in flight (interrupt again to exit now)");
        self.cancel();
        interrupt().await.is_ok()
    }
}

pub struct BatchRunner {
    store:  Arc<dyn EntityStore,>,
    cancel: CancelFlag,
}

impl BatchRunner {
    pub fn new(store: Arc<dyn EntityStore,>,) -> Self {
        Self {
            store,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag,) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs `job` to completion. Only job-level failures (unreadable or
    /// malformed file) are returned as errors; record failures land in the
    /// report.
    pub async fn run(&self, job: &ImportJob,) -> Result<ImportReport,> {
        let options = &job.options;
        info!(
            "Importing {} from {}{}",
            job.spec.collection,
            job.path.display(),
            if options.dry_run { " (dry run)" } else { "" }
        );

        let records = read_records(&job.path,).await?;
        let registry = Arc::new(ProcessingRegistry::new(ImportReport::new(
            &job.spec.name,
            &job.spec.collection,
            &job.path,
            options.dry_run,
        ),),);
        registry.set_total(records.len(),);

        let selected = sample_records(records, options.sample, options.seed,);
        let permits = if options.concurrency == 0 {
            Semaphore::MAX_PERMITS
        } else {
            options.concurrency
        };
        info!(
            "Processing {} records with concurrency {}",
            selected.len(),
            if options.concurrency == 0 { "unbounded".to_string() } else { permits.to_string() }
        );

        let processor = Arc::new(RecordProcessor {
            engine:   UpsertEngine::new(Arc::clone(&self.store,), options.dry_run, options.retry,),
            linker:   Linker::new(Arc::clone(&self.store,), options.dry_run, options.retry,),
            registry: Arc::clone(&registry,),
        },);
        let spec = Arc::new(job.spec.clone(),);
        let semaphore = Arc::new(Semaphore::new(permits,),);
        let mut join_set = JoinSet::new();
        let mut pending = selected.into_iter();

        while let Some((index, value,),) = pending.next() {
            if self.cancel.is_cancelled() {
                registry.record_skipped(1 + pending.len(),);
                break;
            }
            let permit = Arc::clone(&semaphore,)
                .acquire_owned()
                .await
                .map_err(|e| ImporterError::Other(format!("Worker pool closed: {}", e),),)?;
            if self.cancel.is_cancelled() {
                registry.record_skipped(1 + pending.len(),);
                break;
            }

            let processor = Arc::clone(&processor,);
            let spec = Arc::clone(&spec,);
            join_set.spawn(async move {
                let _permit = permit; // Hold permit until the record is done
                let position = format!("#{}", index);
                let run = AssertUnwindSafe(processor.process(&spec, &value, position.clone(), true,),)
                    .catch_unwind()
                    .await;
                if run.is_err() {
                    processor.registry.record_failure(
                        &spec.collection,
                        &position,
                        &ImporterError::Other("record task panicked".to_string(),),
                        true,
                    );
                }
            },);
        }

        while let Some(res,) = join_set.join_next().await {
            if let Err(e,) = res {
                error!("Record task failed: {}", e);
            }
        }

        let report = registry.snapshot();
        report.log_summary();
        Ok(report,)
    }
}

/// Picks `sample` records at random without replacement, keeping source
/// order. Without a sample size every record is returned.
pub fn sample_records(
    records: Vec<Value,>,
    sample: Option<usize,>,
    seed: Option<u64,>,
) -> Vec<(usize, Value,),> {
    let total = records.len();
    let indexed = records.into_iter().enumerate();
    let Some(amount,) = sample.filter(|n| *n < total,) else {
        return indexed.collect();
    };

    let mut rng = match seed {
        Some(seed,) => StdRng::seed_from_u64(seed,),
        None => StdRng::from_entropy(),
    };
    let picked: HashSet<usize,> = rand::seq::index::sample(&mut rng, total, amount,)
        .into_iter()
        .collect();
    info!("Sampling {} of {} records", amount, total);
    indexed.filter(|(i, _,)| picked.contains(i,),).collect()
}

struct RecordError {
    record: String,
    error:  ImporterError,
}

struct RecordProcessor {
    engine:   UpsertEngine,
    linker:   Linker,
    registry: Arc<ProcessingRegistry,>,
}

impl RecordProcessor {
    /// Resolves one record and its nested children, tallying the outcome.
    /// On failure returns the label the record is reported under.
    fn process<'a,>(
        &'a self,
        spec: &'a EntitySpec,
        value: &'a Value,
        position: String,
        top_level: bool,
    ) -> BoxFuture<'a, std::result::Result<Entity, String,>,> {
        async move {
            match self.resolve(spec, value, &position,).await {
                Ok((entity, outcome,),) => {
                    self.registry.record_outcome(&spec.collection, outcome, top_level,);
                    Ok(entity,)
                },
                Err(RecordError { record, error, },) => {
                    self.registry.record_failure(&spec.collection, &record, &error, top_level,);
                    Err(record,)
                },
            }
        }
        .boxed()
    }

    async fn resolve(
        &self,
        spec: &EntitySpec,
        value: &Value,
        position: &str,
    ) -> std::result::Result<(Entity, UpsertOutcome,), RecordError,> {
        let record = as_record(value,).map_err(|error| RecordError {
            record: position.to_string(),
            error,
        },)?;
        let key = spec.natural_key(record,).map_err(|error| RecordError {
            record: position.to_string(),
            error,
        },)?;
        let fail = |error: ImporterError| RecordError {
            record: key.clone(),
            error,
        };

        let references = self.resolve_references(spec, record, &key,).await.map_err(fail,)?;
        let mut fields = spec.creation_fields(record, &key,);
        fields.extend(references.clone(),);

        let (mut entity, outcome,) = self
            .engine
            .upsert(&spec.collection, &spec.key_target, &key, fields,)
            .await
            .map_err(fail,)?;

        if outcome == UpsertOutcome::Found && !entity.is_placeholder() {
            let mut backfill = spec.backfill_fields(record, &entity.fields,);
            for (field, relation,) in references {
                if entity.get(&field,).is_none_or(is_blank,) {
                    backfill.insert(field, relation,);
                }
            }
            if let Some(updated,) = self
                .engine
                .backfill(&spec.collection, &entity, backfill,)
                .await
                .map_err(fail,)?
            {
                entity = updated;
            }
        }

        for child in &spec.children {
            self.resolve_children(spec, child, record, &key, &entity,)
                .await
                .map_err(fail,)?;
        }

        Ok((entity, outcome,),)
    }

    /// Relation values for lookup-only references that already exist.
    async fn resolve_references(
        &self,
        spec: &EntitySpec,
        record: &SourceRecord,
        key: &str,
    ) -> Result<Fields,> {
        let mut fields = Fields::new();
        for reference in &spec.references {
            let Some(ref_key,) = record.get(&reference.source_field,).and_then(canonical_key,) else {
                continue;
            };
            match self
                .engine
                .find(&reference.collection, &reference.key_field, &ref_key,)
                .await?
            {
                Some(Entity { id: Some(id,), .. },) => {
                    fields.insert(reference.relation_field.clone(), Value::from(id.0,),);
                },
                _ => {
                    let message = format!(
                        "{} '{}': {} '{}' not found, import it first",
                        spec.collection, key, reference.collection, ref_key
                    );
                    warn!("{}", message);
                    self.registry.record_warning(message,);
                },
            }
        }
        Ok(fields,)
    }

    /// Resolves every child in `child.source_field`, then links the ones that
    /// resolved to `parent`.
    async fn resolve_children(
        &self,
        spec: &EntitySpec,
        child: &ChildSpec,
        record: &SourceRecord,
        key: &str,
        parent: &Entity,
    ) -> Result<(),> {
        let items = match record.get(&child.source_field,) {
            None | Some(Value::Null,) => return Ok((),),
            Some(Value::Array(items,),) => items,
            Some(_,) => {
                let message = format!(
                    "{} '{}': field '{}' is not an array, children skipped",
                    spec.collection, key, child.source_field
                );
                warn!("{}", message);
                self.registry.record_warning(message,);
                return Ok((),);
            },
        };

        let mut resolved = Vec::with_capacity(items.len(),);
        let mut missing = Vec::new();
        for (i, item,) in items.iter().enumerate() {
            let position = format!("{}[{}] of {} '{}'", child.source_field, i, spec.collection, key);
            match self.process(&child.entity, item, position, false,).await {
                Ok(entity,) => resolved.push(entity,),
                Err(record,) => missing.push(record,),
            }
        }

        if resolved.is_empty() && !missing.is_empty() {
            let message = format!(
                "{} '{}': no {} resolved, '{}' left untouched",
                spec.collection, key, child.entity.collection, child.relation_field
            );
            warn!("{}", message);
            self.registry.record_warning(message,);
            return Ok((),);
        }
        if !missing.is_empty() {
            self.registry.record_warning(format!(
                "{} '{}' linked without {} {}",
                spec.collection,
                key,
                child.entity.collection,
                missing.join(", ")
            ),);
        }

        let outcome = self
            .linker
            .link(&spec.collection, parent, &child.relation_field, &resolved, &missing,)
            .await?;
        if let LinkOutcome::Linked(n,) = outcome {
            debug!("{} '{}' linked to {} {}", spec.collection, key, n, child.relation_field);
        }
        Ok((),)
    }
}
