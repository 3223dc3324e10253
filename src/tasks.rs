//! Single-flight coalescer and conversion worker pool.
//!
//! For any fingerprint at most one build runs at a time; every concurrent
//! requester observes the same outcome. The registry entry lives from the
//! first arrival until that first requester removes it after the
//! completion signal fires — waiters never delete.

use crate::transform::ConvertError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

/// Pending-build buffer; submitters block once it fills, bounding memory
/// growth under pathological fan-out.
const QUEUE_DEPTH: usize = 10;

type BuildFn = Box<dyn FnOnce() -> Result<(), ConvertError> + Send + 'static>;

struct Task {
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    error: Mutex<Option<ConvertError>>,
}

struct Job {
    build: BuildFn,
    task: Arc<Task>,
}

/// Process-wide build registry plus the worker pool draining the queue.
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct TaskManager {
    tasks: Arc<Mutex<HashMap<String, Arc<Task>>>>,
    queue: mpsc::Sender<Job>,
}

impl TaskManager {
    /// Spawns `workers` conversion workers on the current runtime.
    pub fn new(workers: usize) -> Self {
        let (queue, receiver) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let receiver = Arc::new(AsyncMutex::new(receiver));

        for _ in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                loop {
                    let job = { receiver.lock().await.recv().await };
                    let Some(job) = job else { break };

                    // The build does blocking decode/encode work; a panic
                    // inside it surfaces as a join error so the signal
                    // below still fires and waiters cannot deadlock.
                    let outcome = match tokio::task::spawn_blocking(job.build).await {
                        Ok(result) => result,
                        Err(join_error) => Err(ConvertError::Internal(format!(
                            "conversion panicked: {join_error}"
                        ))),
                    };
                    if let Err(err) = outcome {
                        tracing::warn!(error = %err, "derivative build failed");
                        *job.task.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
                    }
                    let _ = job.task.done_tx.send(true);
                }
            });
        }

        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            queue,
        }
    }

    /// Runs `build` for `fingerprint` unless a build for it is already in
    /// flight, in which case the call waits for that build and returns its
    /// outcome. On success the cache file written by the build exists
    /// before this returns.
    pub async fn run<F>(&self, fingerprint: &str, build: F) -> Result<(), ConvertError>
    where
        F: FnOnce() -> Result<(), ConvertError> + Send + 'static,
    {
        let (task, leader) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            match tasks.get(fingerprint) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let (done_tx, done_rx) = watch::channel(false);
                    let task = Arc::new(Task {
                        done_tx,
                        done_rx,
                        error: Mutex::new(None),
                    });
                    tasks.insert(fingerprint.to_string(), Arc::clone(&task));
                    (task, true)
                }
            }
        };

        if leader {
            let job = Job {
                build: Box::new(build),
                task: Arc::clone(&task),
            };
            if self.queue.send(job).await.is_err() {
                self.remove(fingerprint);
                return Err(ConvertError::Internal("conversion queue closed".to_string()));
            }
        }

        let mut done = task.done_rx.clone();
        let wait_failed = done.wait_for(|finished| *finished).await.is_err();

        if leader {
            self.remove(fingerprint);
        }

        if wait_failed {
            return Err(ConvertError::Internal(
                "conversion worker dropped".to_string(),
            ));
        }
        let result = match &*task.error.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        };
        result
    }

    fn remove(&self, fingerprint: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.remove(fingerprint);
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requesters_share_one_build() {
        let manager = TaskManager::new(4);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                manager
                    .run("fp", move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_waiter_observes_the_build_error() {
        let manager = TaskManager::new(2);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .run("fp", || {
                        std::thread::sleep(Duration::from_millis(50));
                        Err(ConvertError::NotFound)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(ConvertError::NotFound)));
        }
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_panicking_build_releases_waiters_with_an_error() {
        let manager = TaskManager::new(1);
        let result = manager
            .run("fp", || panic!("boom"))
            .await;
        match result {
            Err(ConvertError::Internal(message)) => assert!(message.contains("panicked")),
            other => panic!("expected an internal error, got {other:?}"),
        }
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fingerprints_are_reusable_after_completion() {
        let manager = TaskManager::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            manager
                .run("fp", move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_fingerprints_build_independently() {
        let manager = TaskManager::new(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for fingerprint in ["a", "b", "c"] {
            let manager = manager.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                manager
                    .run(fingerprint, move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
