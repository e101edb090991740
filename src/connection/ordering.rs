//! Per ordering key sequential execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

type Task = BoxFuture<'static, ()>;
type Workers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Task>>>>;

/// Runs tasks that share a key one after another, in submission order.
///
/// Tasks with different keys run concurrently. A worker task exists per key only while
/// that key has queued work.
#[derive(Default)]
pub(crate) struct OrderedExecutor {
    workers: Workers,
}

fn lock(workers: &Workers) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Task>>> {
    workers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OrderedExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue `task` behind every earlier task with the same key.
    pub(crate) fn submit(&self, key: &str, task: Task) {
        let mut workers = lock(&self.workers);
        let task = match workers.get(key) {
            Some(sender) => match sender.send(task) {
                Ok(()) => return,
                Err(mpsc::error::SendError(task)) => task,
            },
            None => task,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        // The receiver is alive until the worker below exits, so this cannot fail.
        let _ = sender.send(task);
        workers.insert(key.to_string(), sender);
        drop(workers);

        tokio::spawn(run_worker(self.workers.clone(), key.to_string(), receiver));
    }

    #[cfg(test)]
    fn active_keys(&self) -> usize {
        lock(&self.workers).len()
    }
}

async fn run_worker(workers: Workers, key: String, mut receiver: mpsc::UnboundedReceiver<Task>) {
    loop {
        let next = {
            // Submitters send while holding this lock, so an empty queue seen here stays
            // empty until the key is removed.
            let mut guard = lock(&workers);
            match receiver.try_recv() {
                Ok(task) => Some(task),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    guard.remove(&key);
                    None
                }
            }
        };
        match next {
            Some(task) => task.await,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn test_same_key_runs_in_order() {
        let executor = OrderedExecutor::new();
        let seen = Arc::new(AsyncMutex::new(Vec::new()));

        for i in 0..5u64 {
            let seen = seen.clone();
            executor.submit(
                "key",
                Box::pin(async move {
                    // Earlier tasks sleep longer; order must still hold.
                    tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                    seen.lock().await.push(i);
                }),
            );
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*seen.lock().await, vec![0, 1, 2, 3, 4]);
        assert_eq!(executor.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let executor = OrderedExecutor::new();
        let (blocked_tx, blocked_rx) = tokio::sync::oneshot::channel::<()>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        executor.submit(
            "slow",
            Box::pin(async move {
                let _ = blocked_rx.await;
            }),
        );
        executor.submit(
            "fast",
            Box::pin(async move {
                let _ = done_tx.send(());
            }),
        );

        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .expect("fast key should not wait for slow key")
            .unwrap();
        let _ = blocked_tx.send(());
    }
}
