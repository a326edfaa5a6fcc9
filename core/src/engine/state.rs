use chrono::Utc;
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::model::{ScanId, ScanStatus, ScanUpdate, PROGRESS_DONE, PROGRESS_STARTED};
use crate::store::ScanStore;

/// Aggregate counters written on completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeverityCounts {
    pub total: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
}

/// Owner of one scan's lifecycle after the lease was won.
///
/// Only a holder of the lease can exist, so every write here comes from the
/// single worker executing the scan. Progress never goes backwards and
/// nothing is written once a terminal status has been recorded.
pub struct ScanStateMachine {
    store: Arc<dyn ScanStore>,
    scan_id: ScanId,
    status: ScanStatus,
    progress: u8,
}

impl ScanStateMachine {
    /// `pending -> running`. Returns `None` when another execution owns the scan
    /// or the scan is no longer pending.
    pub async fn acquire(store: Arc<dyn ScanStore>, scan_id: ScanId) -> Result<Option<Self>> {
        if !store.try_start_scan(scan_id, Utc::now(), PROGRESS_STARTED).await? {
            return Ok(None);
        }
        tracing::info!(scan_id, "Scan lease acquired");
        Ok(Some(Self {
            store,
            scan_id,
            status: ScanStatus::Running,
            progress: PROGRESS_STARTED,
        }))
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    pub fn status(&self) -> ScanStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    fn ensure_running(&self, action: &str) -> Result<()> {
        if self.status != ScanStatus::Running {
            return Err(CoreError::InvalidTransition(format!(
                "cannot {} scan {} in status {}",
                action, self.scan_id, self.status
            )));
        }
        Ok(())
    }

    /// Records a progress checkpoint. Checkpoints at or below the current value are skipped.
    pub async fn advance(&mut self, progress: u8) -> Result<()> {
        self.ensure_running("advance")?;
        if progress >= PROGRESS_DONE {
            return Err(CoreError::InvalidTransition(format!(
                "progress {} is reserved for completion",
                progress
            )));
        }
        if progress <= self.progress {
            return Ok(());
        }

        self.store
            .update_scan(self.scan_id, ScanUpdate::progress(progress))
            .await?;
        self.progress = progress;
        tracing::debug!(scan_id = self.scan_id, progress, "Scan progress");
        Ok(())
    }

    /// `running -> completed` with progress forced to 100.
    pub async fn complete(&mut self, counts: SeverityCounts) -> Result<()> {
        self.ensure_running("complete")?;
        self.store
            .update_scan(
                self.scan_id,
                ScanUpdate {
                    status: Some(ScanStatus::Completed),
                    progress: Some(PROGRESS_DONE),
                    completed_at: Some(Utc::now()),
                    total_vulnerabilities: Some(counts.total),
                    high_severity_count: Some(counts.high),
                    medium_severity_count: Some(counts.medium),
                    low_severity_count: Some(counts.low),
                    ..Default::default()
                },
            )
            .await?;

        self.status = ScanStatus::Completed;
        self.progress = PROGRESS_DONE;
        tracing::info!(scan_id = self.scan_id, total = counts.total, "Scan completed");
        Ok(())
    }

    /// `running -> failed`. Progress stays at its last recorded value.
    pub async fn fail(&mut self, message: &str) -> Result<()> {
        self.ensure_running("fail")?;
        self.store
            .update_scan(
                self.scan_id,
                ScanUpdate {
                    status: Some(ScanStatus::Failed),
                    completed_at: Some(Utc::now()),
                    error_message: Some(message.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        self.status = ScanStatus::Failed;
        tracing::warn!(scan_id = self.scan_id, error = message, "Scan failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewScan, ScanType, PROGRESS_DISPATCHED, PROGRESS_DISPATCHING};
    use crate::store::MemoryStore;

    async fn acquired() -> (Arc<MemoryStore>, ScanStateMachine) {
        let store = Arc::new(MemoryStore::new());
        let scan = store
            .create_scan(NewScan::new(1, "https://example.com", ScanType::Full))
            .await
            .unwrap();
        let machine = ScanStateMachine::acquire(store.clone(), scan.id)
            .await
            .unwrap()
            .unwrap();
        (store, machine)
    }

    #[tokio::test]
    async fn second_acquire_loses_the_lease() {
        let (store, machine) = acquired().await;
        let again = ScanStateMachine::acquire(store.clone(), machine.scan_id()).await.unwrap();
        assert!(again.is_none());
        assert!(ScanStateMachine::acquire(store, 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_never_regresses() {
        let (store, mut machine) = acquired().await;
        machine.advance(PROGRESS_DISPATCHED).await.unwrap();
        machine.advance(PROGRESS_DISPATCHING).await.unwrap();

        let scan = store.get_scan(machine.scan_id()).await.unwrap().unwrap();
        assert_eq!(scan.progress, PROGRESS_DISPATCHED);
        assert!(machine.advance(PROGRESS_DONE).await.is_err());
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let (store, mut machine) = acquired().await;
        machine.advance(PROGRESS_DISPATCHING).await.unwrap();
        machine.fail("tool crashed").await.unwrap();

        let err = machine.complete(SeverityCounts::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
        assert!(machine.advance(50).await.is_err());

        let scan = store.get_scan(machine.scan_id()).await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Failed);
        assert_eq!(scan.progress, PROGRESS_DISPATCHING);
        assert_eq!(scan.error_message.as_deref(), Some("tool crashed"));
        assert!(scan.completed_at.is_some());
    }

    #[tokio::test]
    async fn completion_sets_counts_and_full_progress() {
        let (store, mut machine) = acquired().await;
        let counts = SeverityCounts {
            total: 4,
            high: 2,
            medium: 2,
            low: 0,
        };
        machine.complete(counts).await.unwrap();

        let scan = store.get_scan(machine.scan_id()).await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Completed);
        assert_eq!(scan.progress, 100);
        assert_eq!(scan.total_vulnerabilities, 4);
        assert_eq!(scan.high_severity_count, 2);
        assert!(scan.completed_at.is_some());
    }
}
