//! Session Registry — single explicitly-passed owner of every running
//! scan/ping task and its cancellation handle. No hidden statics: callers
//! hold an `Arc<SessionRegistry>` and pass it wherever a task needs to be
//! looked up or cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::types::{PingTask, ProbeResult, ScanTask, TaskStatus};

struct ScanEntry {
    task: ScanTask,
    cancel: CancellationToken,
}

struct PingEntry {
    task: PingTask,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct SessionRegistry {
    scans: RwLock<HashMap<String, ScanEntry>>,
    pings: RwLock<HashMap<String, PingEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register_scan(&self, task: ScanTask) -> CancellationToken {
        let cancel = CancellationToken::new();
        let id = task.id.clone();
        self.scans.write().await.insert(
            id,
            ScanEntry {
                task,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub async fn register_ping(&self, task: PingTask) -> CancellationToken {
        let cancel = CancellationToken::new();
        let id = task.id.clone();
        self.pings.write().await.insert(
            id,
            PingEntry {
                task,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub async fn update_scan<F: FnOnce(&mut ScanTask)>(&self, id: &str, f: F) {
        if let Some(entry) = self.scans.write().await.get_mut(id) {
            f(&mut entry.task);
        }
    }

    pub async fn update_ping<F: FnOnce(&mut PingTask)>(&self, id: &str, f: F) {
        if let Some(entry) = self.pings.write().await.get_mut(id) {
            f(&mut entry.task);
        }
    }

    pub async fn push_scan_result(&self, id: &str, result: ProbeResult) {
        if let Some(entry) = self.scans.write().await.get_mut(id) {
            let opened = result.status == crate::types::ScanStatus::Open;
            entry.task.results.push(result);
            entry.task.scanned += 1;
            if opened {
                entry.task.found += 1;
            }
        }
    }

    pub async fn get_scan(&self, id: &str) -> Option<ScanTask> {
        self.scans.read().await.get(id).map(|e| e.task.clone())
    }

    pub async fn get_ping(&self, id: &str) -> Option<PingTask> {
        self.pings.read().await.get(id).map(|e| e.task.clone())
    }

    pub async fn cancel_scan(&self, id: &str) -> bool {
        let guard = self.scans.read().await;
        if let Some(entry) = guard.get(id) {
            entry.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub async fn cancel_ping(&self, id: &str) -> bool {
        let guard = self.pings.read().await;
        if let Some(entry) = guard.get(id) {
            entry.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub async fn remove_scan(&self, id: &str) {
        self.scans.write().await.remove(id);
    }

    pub async fn remove_ping(&self, id: &str) {
        self.pings.write().await.remove(id);
    }

    /// Snapshot of every scan task currently tracked, newest-registration
    /// order not guaranteed.
    pub async fn list_scan_tasks(&self) -> Vec<ScanTask> {
        self.scans.read().await.values().map(|e| e.task.clone()).collect()
    }

    pub async fn list_ping_tasks(&self) -> Vec<PingTask> {
        self.pings.read().await.values().map(|e| e.task.clone()).collect()
    }

    pub async fn set_scan_status(&self, id: &str, status: TaskStatus) {
        self.update_scan(id, |t| t.status = status).await;
    }

    pub async fn set_ping_status(&self, id: &str, status: TaskStatus) {
        self.update_ping(id, |t| t.status = status).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    #[tokio::test]
    async fn register_and_fetch_scan_task() {
        let registry = SessionRegistry::new();
        let task = ScanTask::new(vec!["127.0.0.1".into()], vec![80], Protocol::Tcp);
        let id = task.id.clone();
        registry.register_scan(task).await;

        let fetched = registry.get_scan(&id).await.unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_scan_fires_the_token() {
        let registry = SessionRegistry::new();
        let task = ScanTask::new(vec!["127.0.0.1".into()], vec![80], Protocol::Tcp);
        let id = task.id.clone();
        let cancel = registry.register_scan(task).await;

        assert!(registry.cancel_scan(&id).await);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_unknown_scan_returns_false() {
        let registry = SessionRegistry::new();
        assert!(!registry.cancel_scan("missing").await);
    }

    #[tokio::test]
    async fn push_scan_result_updates_counters() {
        let registry = SessionRegistry::new();
        let task = ScanTask::new(vec!["127.0.0.1".into()], vec![80, 443], Protocol::Tcp);
        let id = task.id.clone();
        registry.register_scan(task).await;

        registry
            .push_scan_result(&id, ProbeResult::open("127.0.0.1", 80, Protocol::Tcp, 1.0, None, None))
            .await;
        registry
            .push_scan_result(
                &id,
                ProbeResult::non_open("127.0.0.1", 443, Protocol::Tcp, crate::types::ScanStatus::Closed, None),
            )
            .await;

        let fetched = registry.get_scan(&id).await.unwrap();
        assert_eq!(fetched.scanned, 2);
        assert_eq!(fetched.found, 1);
    }
}
