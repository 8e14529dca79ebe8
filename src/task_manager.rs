//! Lifecycle of the agent's long-running tasks.
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Handles = Vec<(&'static str, JoinHandle<()>)>;

/// Spawns named tasks, hands out the shared shutdown receiver, and joins (or
/// aborts) everything it spawned.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<Handles>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskManager {
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_rx,
        }
    }

    /// Spawns `future` on the runtime and tracks it under `name`.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task_name = name, "Spawning task");
        let handle = tokio::spawn(future);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, handle));
    }

    pub fn get_shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Number of tasks spawned and not yet joined or aborted.
    pub fn len(&self) -> usize {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_handles(&self) -> Handles {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Waits for every managed task to finish. Tasks are expected to have
    /// observed the shutdown signal.
    pub async fn shutdown(self) {
        let handles = self.take_handles();
        info!(
            "TaskManager shutting down. Waiting for {} tasks to complete...",
            handles.len()
        );

        let task_names: Vec<&'static str> = handles.iter().map(|(name, _)| *name).collect();
        debug!(tasks = ?task_names, "Awaiting all tasks.");

        let results = join_all(handles.into_iter().map(|(_, handle)| handle)).await;

        let mut panicked = Vec::new();
        for (task_name, result) in task_names.iter().zip(results) {
            match result {
                Ok(()) => debug!(task_name, "Task shut down gracefully."),
                Err(e) if e.is_cancelled() => debug!(task_name, "Task was cancelled."),
                Err(_) => {
                    error!(task_name, "Task panicked.");
                    panicked.push(*task_name);
                }
            }
        }

        if panicked.is_empty() {
            info!("All tasks shut down gracefully.");
        } else {
            error!("{} tasks panicked: {:?}", panicked.len(), panicked);
        }
    }

    /// Cancels every managed task without waiting for it to notice a
    /// shutdown signal.
    pub async fn abort_all(self) {
        let handles = self.take_handles();
        warn!("Aborting {} tasks.", handles.len());
        for (_, handle) in &handles {
            handle.abort();
        }
        join_all(handles.into_iter().map(|(_, handle)| handle)).await;
    }
}
