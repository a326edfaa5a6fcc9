// Queue module - 后台任务队列
// 进程内通道 + 信号量限制并发的 worker 池

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::engine::{AnalysisMode, ScanEngine};
use crate::error::{CoreError, Result};
use crate::model::{ScanId, ScanStatus, ScanUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    Scan { scan_id: ScanId },
    Analyze { scan_id: ScanId, overwrite: bool },
}

pub type JobReceiver = mpsc::UnboundedReceiver<Job>;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    pub fn channel() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|e| CoreError::Queue(format!("job queue is closed, dropped {:?}", e.0)))?;
        tracing::debug!(?job, "Job enqueued");
        Ok(())
    }
}

/// What startup recovery found in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    pub requeued: usize,
    pub interrupted: usize,
}

pub const INTERRUPTED_MESSAGE: &str = "interrupted by worker restart";

/// Drains the job queue with at most `concurrency` jobs in flight.
pub struct WorkerPool {
    engine: Arc<ScanEngine>,
    queue: JobQueue,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(engine: Arc<ScanEngine>, queue: JobQueue, concurrency: usize) -> Self {
        Self {
            engine,
            queue,
            concurrency: concurrency.max(1),
        }
    }

    /// Re-enqueues pending scans and fails scans a previous process left running.
    pub async fn recover(&self) -> Result<Recovery> {
        let store = self.engine.store();
        let mut recovery = Recovery::default();

        for scan in store.list_scans_by_status(ScanStatus::Running).await? {
            store
                .update_scan(
                    scan.id,
                    ScanUpdate {
                        status: Some(ScanStatus::Failed),
                        completed_at: Some(Utc::now()),
                        error_message: Some(INTERRUPTED_MESSAGE.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            recovery.interrupted += 1;
        }

        for scan in store.list_scans_by_status(ScanStatus::Pending).await? {
            self.queue.enqueue(Job::Scan { scan_id: scan.id })?;
            recovery.requeued += 1;
        }

        tracing::info!(
            requeued = recovery.requeued,
            interrupted = recovery.interrupted,
            "Recovered scan queue"
        );
        Ok(recovery)
    }

    pub fn spawn(self, rx: JobReceiver) -> WorkerHandle {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(self.run(rx, async move {
            let _ = stopped.await;
        }));
        WorkerHandle { stop, task }
    }

    /// Pulls jobs until `shutdown` resolves or the channel closes, then waits
    /// for in-flight jobs. Jobs still queued stay in the store as pending and
    /// are picked up again by [`WorkerPool::recover`].
    pub async fn run<F>(self, mut rx: JobReceiver, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        tokio::pin!(shutdown);

        tracing::info!(concurrency = self.concurrency, "Worker pool started");

        loop {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let job = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!(in_flight = in_flight.len(), "Worker pool shutting down");
                    break;
                }
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let engine = self.engine.clone();
            let queue = self.queue.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                handle_job(engine, queue, job).await;
            });

            while let Some(done) = in_flight.try_join_next() {
                if let Err(e) = done {
                    tracing::error!(error = %e, "Worker task aborted");
                }
            }
        }

        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                tracing::error!(error = %e, "Worker task aborted");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

/// Handle on a spawned [`WorkerPool`]. Dropping it stops the pool the same
/// way [`WorkerHandle::shutdown`] does, without waiting.
pub struct WorkerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stops taking jobs and waits up to `grace` for in-flight jobs.
    ///
    /// Returns `false` when the grace period ran out. The pool task is then
    /// aborted, and scans it left running are failed by the next startup
    /// recovery.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let WorkerHandle { stop, mut task } = self;
        let _ = stop.send(());

        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Worker pool task failed");
                true
            }
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "Worker pool did not drain in time, aborting");
                task.abort();
                false
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn handle_job(engine: Arc<ScanEngine>, queue: JobQueue, job: Job) {
    match job {
        Job::Scan { scan_id } => {
            let runner = engine.clone();
            match tokio::spawn(async move { runner.execute(scan_id).await }).await {
                Ok(summary) => {
                    tracing::info!(
                        scan_id,
                        success = summary.success,
                        total = summary.total_vulnerabilities,
                        "Scan job finished"
                    );
                    if summary.success && engine.analysis_mode() == AnalysisMode::Deferred {
                        if let Err(e) = queue.enqueue(Job::Analyze {
                            scan_id,
                            overwrite: false,
                        }) {
                            tracing::error!(scan_id, error = %e, "Could not enqueue analysis");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(scan_id, error = %e, "Scan execution crashed");
                    mark_crashed(&engine, scan_id, &e.to_string()).await;
                }
            }
        }
        Job::Analyze { scan_id, overwrite } => match engine.analyze_scan_results(scan_id, overwrite).await {
            Ok(count) => tracing::info!(scan_id, count, "Analysis job finished"),
            Err(e) => tracing::warn!(scan_id, error = %e, "Analysis job failed"),
        },
    }
}

async fn mark_crashed(engine: &ScanEngine, scan_id: ScanId, error: &str) {
    let store = engine.store();
    match store.get_scan(scan_id).await {
        Ok(Some(scan)) if scan.status == ScanStatus::Running => {
            let update = ScanUpdate {
                status: Some(ScanStatus::Failed),
                completed_at: Some(Utc::now()),
                error_message: Some(format!("Scan execution crashed: {}", error)),
                ..Default::default()
            };
            if let Err(e) = store.update_scan(scan_id, update).await {
                tracing::error!(scan_id, error = %e, "Could not record crash");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::error!(scan_id, error = %e, "Could not load crashed scan"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::dispatcher::Dispatcher;
    use crate::model::{NewScan, ScanType};
    use crate::store::{MemoryStore, ScanStore};
    use crate::tools::{OutcomeKind, ParsedSummary, RawOutput, ToolKind, ToolOutcome, ToolRunner};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Quiet(ToolKind);

    struct Slow(Duration);

    #[async_trait]
    impl ToolRunner for Slow {
        fn kind(&self) -> ToolKind {
            ToolKind::Nikto
        }

        async fn run(&self, target: &str) -> ToolOutcome {
            tokio::time::sleep(self.0).await;
            Quiet(ToolKind::Nikto).run(target).await
        }
    }

    #[async_trait]
    impl ToolRunner for Quiet {
        fn kind(&self) -> ToolKind {
            self.0
        }

        async fn run(&self, _target: &str) -> ToolOutcome {
            let mut raw = RawOutput::failure(self.0.name().into(), OutcomeKind::Success, String::new());
            raw.error = None;
            raw.summary = Some(ParsedSummary::Injection { matches: vec![] });
            ToolOutcome {
                tool: self.0,
                kind: OutcomeKind::Success,
                raw_output: raw,
                tool_version: None,
                duration: Duration::from_millis(5),
            }
        }
    }

    fn engine(store: Arc<MemoryStore>, mode: AnalysisMode) -> Arc<ScanEngine> {
        let mut dispatcher = Dispatcher::new(store.clone());
        dispatcher.register_runner(Quiet(ToolKind::Sqlmap));
        dispatcher.register_runner(Quiet(ToolKind::Nmap));
        Arc::new(ScanEngine::new(store, dispatcher, Analyzer::heuristic_only(), mode))
    }

    async fn wait_for_analysis(store: &MemoryStore, scan_id: ScanId) -> bool {
        for _ in 0..100 {
            let results = store.list_tool_results(scan_id).await.unwrap();
            if !results.is_empty() && results.iter().all(|r| r.ai_analysis.is_some()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn deferred_mode_enqueues_analysis_after_scan() {
        let store = Arc::new(MemoryStore::new());
        let (queue, rx) = JobQueue::channel();
        let pool = WorkerPool::new(engine(store.clone(), AnalysisMode::Deferred), queue.clone(), 2);
        let handle = pool.spawn(rx);

        let scan = store
            .create_scan(NewScan::new(1, "https://example.com", ScanType::Full))
            .await
            .unwrap();
        queue.enqueue(Job::Scan { scan_id: scan.id }).unwrap();

        assert!(wait_for_analysis(&store, scan.id).await);
        let stored = store.get_scan(scan.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScanStatus::Completed);
        assert_eq!(stored.progress, 100);

        handle.abort();
    }

    #[tokio::test]
    async fn recovery_requeues_pending_and_fails_orphans() {
        let store = Arc::new(MemoryStore::new());
        let orphan = store
            .create_scan(NewScan::new(1, "https://a.example", ScanType::Full))
            .await
            .unwrap();
        store.try_start_scan(orphan.id, Utc::now(), 10).await.unwrap();
        let pending = store
            .create_scan(NewScan::new(1, "https://b.example", ScanType::Quick))
            .await
            .unwrap();

        let (queue, mut rx) = JobQueue::channel();
        let pool = WorkerPool::new(engine(store.clone(), AnalysisMode::Inline), queue, 1);
        let recovery = pool.recover().await.unwrap();

        assert_eq!(recovery, Recovery { requeued: 1, interrupted: 1 });
        assert_eq!(rx.recv().await, Some(Job::Scan { scan_id: pending.id }));

        let orphan = store.get_scan(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, ScanStatus::Failed);
        assert_eq!(orphan.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(orphan.completed_at.is_some());
    }

    #[tokio::test]
    async fn pool_drains_queued_scans() {
        let store = Arc::new(MemoryStore::new());
        let (queue, rx) = JobQueue::channel();
        let pool = WorkerPool::new(engine(store.clone(), AnalysisMode::Inline), queue.clone(), 1);

        let mut ids = Vec::new();
        for i in 0..3 {
            let scan = store
                .create_scan(NewScan::new(1, format!("https://{}.example", i), ScanType::Full))
                .await
                .unwrap();
            queue.enqueue(Job::Scan { scan_id: scan.id }).unwrap();
            ids.push(scan.id);
        }

        let handle = pool.spawn(rx);
        for id in &ids {
            assert!(wait_for_analysis(&store, *id).await);
        }
        handle.abort();

        for id in ids {
            let scan = store.get_scan(id).await.unwrap().unwrap();
            assert_eq!(scan.status, ScanStatus::Completed);
        }
    }

    #[tokio::test]
    async fn shutdown_lets_running_scans_finish() {
        let store = Arc::new(MemoryStore::new());
        let mut dispatcher = Dispatcher::new(store.clone());
        dispatcher.register_runner(Slow(Duration::from_millis(300)));
        let engine = Arc::new(ScanEngine::new(
            store.clone(),
            dispatcher,
            Analyzer::heuristic_only(),
            AnalysisMode::Inline,
        ));

        let (queue, rx) = JobQueue::channel();
        let handle = WorkerPool::new(engine, queue.clone(), 1).spawn(rx);

        let running = store
            .create_scan(NewScan::new(1, "https://a.example", ScanType::Full))
            .await
            .unwrap();
        let queued = store
            .create_scan(NewScan::new(1, "https://b.example", ScanType::Full))
            .await
            .unwrap();
        queue.enqueue(Job::Scan { scan_id: running.id }).unwrap();
        queue.enqueue(Job::Scan { scan_id: queued.id }).unwrap();

        for _ in 0..100 {
            let scan = store.get_scan(running.id).await.unwrap().unwrap();
            if scan.status == ScanStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(handle.shutdown(Duration::from_secs(5)).await);

        let finished = store.get_scan(running.id).await.unwrap().unwrap();
        assert_eq!(finished.status, ScanStatus::Completed);
        let left = store.get_scan(queued.id).await.unwrap().unwrap();
        assert_eq!(left.status, ScanStatus::Pending);
    }

    #[tokio::test]
    async fn shutdown_aborts_after_grace_period() {
        let store = Arc::new(MemoryStore::new());
        let mut dispatcher = Dispatcher::new(store.clone());
        dispatcher.register_runner(Slow(Duration::from_secs(30)));
        let engine = Arc::new(ScanEngine::new(
            store.clone(),
            dispatcher,
            Analyzer::heuristic_only(),
            AnalysisMode::Inline,
        ));

        let (queue, rx) = JobQueue::channel();
        let handle = WorkerPool::new(engine, queue.clone(), 1).spawn(rx);
        let scan = store
            .create_scan(NewScan::new(1, "https://a.example", ScanType::Full))
            .await
            .unwrap();
        queue.enqueue(Job::Scan { scan_id: scan.id }).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!handle.shutdown(Duration::from_millis(200)).await);
        let scan = store.get_scan(scan.id).await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Running);
    }
}
