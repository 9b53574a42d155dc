//! Background jobs: "ingest file" and "promote batch", each on its own thread
//! with a cancel flag and live counters.

use crate::error::{PipelineError, Result};
use crate::services::ingestion::{IngestRequest, IngestionWorker};
use crate::services::promotion::PromotionDispatcher;
use crate::types::{IngestSummary, PromotionSummary};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Summary type a job reports; stored as three counters while running.
pub trait JobProgress: Copy + Send + 'static {
    fn to_counters(&self) -> [u64; 3];
    fn from_counters(counters: [u64; 3]) -> Self;
}

impl JobProgress for IngestSummary {
    fn to_counters(&self) -> [u64; 3] {
        [self.processed, self.created, 0]
    }

    fn from_counters(c: [u64; 3]) -> Self {
        IngestSummary {
            processed: c[0],
            created: c[1],
        }
    }
}

impl JobProgress for PromotionSummary {
    fn to_counters(&self) -> [u64; 3] {
        [self.promoted, self.failed, self.skipped]
    }

    fn from_counters(c: [u64; 3]) -> Self {
        PromotionSummary {
            promoted: c[0],
            failed: c[1],
            skipped: c[2],
        }
    }
}

/// State shared between a job thread and its handle.
#[derive(Debug, Default)]
pub struct JobControl {
    stop_flag: AtomicBool,
    counters: [AtomicU64; 3],
}

impl JobControl {
    pub fn cancel(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    fn publish<T: JobProgress>(&self, progress: &T) {
        for (slot, value) in self.counters.iter().zip(progress.to_counters()) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    fn snapshot<T: JobProgress>(&self) -> T {
        T::from_counters([
            self.counters[0].load(Ordering::Relaxed),
            self.counters[1].load(Ordering::Relaxed),
            self.counters[2].load(Ordering::Relaxed),
        ])
    }

    /// Record `progress`; `false` once the job should stop.
    fn tick<T: JobProgress>(&self, progress: &T) -> bool {
        self.publish(progress);
        !self.is_cancelled()
    }
}

pub struct JobHandle<T: JobProgress> {
    batch_id: i64,
    control: Arc<JobControl>,
    thread: JoinHandle<Result<T>>,
}

impl<T: JobProgress> JobHandle<T> {
    pub fn batch_id(&self) -> i64 {
        self.batch_id
    }

    /// Ask the job to stop after the current row or item.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Counters as of the last processed row or item.
    pub fn progress(&self) -> T {
        self.control.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the job and return its final summary.
    pub fn join(self) -> Result<T> {
        let result = self
            .thread
            .join()
            .map_err(|_| PipelineError::Internal(format!("job thread for batch {} panicked", self.batch_id)))?;
        if let Ok(summary) = &result {
            self.control.publish(summary);
        }
        result
    }
}

/// Start an ingestion job. The batch is resolved before the thread starts,
/// so the returned handle already knows its id.
pub fn spawn_ingest(worker: Arc<IngestionWorker>, request: IngestRequest) -> Result<JobHandle<IngestSummary>> {
    spawn_ingest_with(worker, request, Arc::new(JobControl::default()))
}

fn spawn_ingest_with(
    worker: Arc<IngestionWorker>,
    request: IngestRequest,
    control: Arc<JobControl>,
) -> Result<JobHandle<IngestSummary>> {
    let batch_id = worker.prepare_batch(&request)?;
    let job_control = Arc::clone(&control);
    let thread = thread::Builder::new()
        .name(format!("ingest-{}", batch_id))
        .spawn(move || {
            worker
                .ingest_batch_with(batch_id, &request, |s| job_control.tick(s))
                .map(|report| report.summary)
        })?;
    tracing::debug!(batch_id, "ingest job started");
    Ok(JobHandle {
        batch_id,
        control,
        thread,
    })
}

/// Start a promotion job. Cancelling stops after the current item; the
/// summary then covers only the items seen.
pub fn spawn_promote(
    dispatcher: Arc<PromotionDispatcher>,
    tenant_id: impl Into<String>,
    batch_id: i64,
) -> Result<JobHandle<PromotionSummary>> {
    let tenant_id = tenant_id.into();
    let control = Arc::new(JobControl::default());
    let job_control = Arc::clone(&control);
    let thread = thread::Builder::new()
        .name(format!("promote-{}", batch_id))
        .spawn(move || dispatcher.promote_batch_with(&tenant_id, batch_id, |s| job_control.tick(s)))?;
    tracing::debug!(batch_id, "promote job started");
    Ok(JobHandle {
        batch_id,
        control,
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MappingCache;
    use crate::db::Db;
    use crate::models::DocType;
    use crate::services::classifier::DocumentClassifier;
    use crate::services::learner::MappingLearner;
    use crate::services::mapping_suggester::MappingSuggester;
    use crate::services::smart_router::SmartRouter;
    use crate::types::BatchStatus;
    use std::time::Duration;

    fn worker(db: Arc<Db>) -> Arc<IngestionWorker> {
        let router = SmartRouter::new(
            Arc::new(DocumentClassifier::new()),
            Arc::new(
                MappingSuggester::new(Arc::new(MappingCache::new(Duration::from_secs(60))))
                    .with_defaults("EC", "USD"),
            ),
            Arc::new(MappingLearner::in_memory()),
        );
        Arc::new(IngestionWorker::new(db, Arc::new(router)).with_batch_size(3))
    }

    fn products_file(dir: &tempfile::TempDir, rows: usize) -> std::path::PathBuf {
        let mut body = String::from("SKU,Nombre,Precio\n");
        for i in 0..rows {
            body.push_str(&format!("P-{},Producto {},{}.50\n", i, i, i + 1));
        }
        let path = dir.path().join("catalogo.csv");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn ingest_then_promote_in_background() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let request = IngestRequest::new("t1", products_file(&dir, 7)).with_doc_type(DocType::Product);

        let job = spawn_ingest(worker(db.clone()), request).unwrap();
        let batch_id = job.batch_id();
        let summary = job.join().unwrap();
        assert_eq!(summary, IngestSummary { processed: 7, created: 7 });

        let promote = spawn_promote(Arc::new(PromotionDispatcher::new(db.clone())), "t1", batch_id).unwrap();
        let promoted = promote.join().unwrap();
        assert_eq!(promoted.promoted, 7);
        assert_eq!(promoted.failed, 0);
        assert_eq!(db.count_destination_rows("products", "t1").unwrap(), 7);
        assert_eq!(db.get_batch("t1", batch_id).unwrap().status, BatchStatus::Promoted);
    }

    #[test]
    fn cancelled_ingest_reports_cancelled() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let request = IngestRequest::new("t1", products_file(&dir, 10)).with_doc_type(DocType::Product);
        let control = Arc::new(JobControl::default());
        control.cancel();

        let job = spawn_ingest_with(worker(db.clone()), request, control).unwrap();
        let batch_id = job.batch_id();
        assert!(matches!(job.join(), Err(PipelineError::Cancelled)));
        assert_eq!(db.get_batch("t1", batch_id).unwrap().status, BatchStatus::Failed);
        assert!(db.list_items("t1", batch_id, None).unwrap().is_empty());
    }

    #[test]
    fn counters_round_trip_through_control() {
        let control = JobControl::default();
        let summary = PromotionSummary {
            promoted: 4,
            failed: 1,
            skipped: 2,
        };
        assert!(control.tick(&summary));
        assert_eq!(control.snapshot::<PromotionSummary>(), summary);
        control.cancel();
        assert!(!control.tick(&summary));
    }
}
