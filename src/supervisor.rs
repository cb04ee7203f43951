//! Ownership of every background task the node spawns.
//!
//! Each task races its future against a shared shutdown flag. The flag is a
//! `watch` channel rather than a broadcast so that tasks spawned after the
//! signal still observe it. [TaskSupervisor::shutdown] raises the flag, waits
//! for the tasks to wind down and aborts whatever is left after the grace
//! period.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::watch, task::JoinSet};

use crate::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKey {
    ProposalListener,
    Watcher(Hash),
    UpdateHandler(Hash),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("task {0:?} is already running")]
    Duplicate(TaskKey),
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

#[derive(Default)]
struct Tasks {
    set: JoinSet<()>,
    /// Live tasks with the serial of the spawn that owns the key.
    live: HashMap<TaskKey, u64>,
    spawned: HashMap<TaskKey, usize>,
    next_serial: u64,
}

pub struct TaskSupervisor {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
}

impl TaskSupervisor {
    pub fn new() -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(TaskSupervisor {
            shutdown,
            tasks: Mutex::new(Tasks::default()),
        })
    }

    /// Spawns `fut` as the only live task for `key`.
    pub fn spawn<F>(self: &Arc<Self>, key: TaskKey, fut: F) -> Result<(), SpawnError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        if self.is_shutting_down() {
            return Err(SpawnError::ShuttingDown);
        }
        if tasks.live.contains_key(&key) {
            return Err(SpawnError::Duplicate(key));
        }
        while tasks.set.try_join_next().is_some() {}

        let serial = tasks.next_serial;
        tasks.next_serial += 1;
        tasks.live.insert(key, serial);
        *tasks.spawned.entry(key).or_default() += 1;

        let mut shutdown = self.shutdown.subscribe();
        let supervisor: Weak<Self> = Arc::downgrade(self);
        tasks.set.spawn(async move {
            tokio::select! {
                // Also ends the task if the supervisor itself is dropped.
                _ = shutdown.wait_for(|stop| *stop) => {}
                _ = fut => {}
            }
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.finished(key, serial);
            }
        });
        Ok(())
    }

    fn finished(&self, key: TaskKey, serial: u64) {
        let mut tasks = self.lock();
        if tasks.live.get(&key) == Some(&serial) {
            tasks.live.remove(&key);
        }
    }

    pub fn is_live(&self, key: &TaskKey) -> bool {
        self.lock().live.contains_key(key)
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// How many tasks were ever spawned for `key`.
    pub fn spawned(&self, key: &TaskKey) -> usize {
        self.lock().spawned.get(key).copied().unwrap_or(0)
    }

    /// Drops the spawn count of `key`. A live task for it keeps running.
    pub fn forget(&self, key: &TaskKey) {
        self.lock().spawned.remove(key);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops every task. Returns the number of tasks that had to be aborted
    /// because they did not finish within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.shutdown.send_replace(true);
        let mut set = std::mem::take(&mut self.lock().set);

        let drained = tokio::time::timeout(grace, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        let aborted = match drained {
            Ok(()) => 0,
            Err(_) => {
                let left = set.len();
                set.abort_all();
                while set.join_next().await.is_some() {}
                left
            }
        };
        self.lock().live.clear();
        aborted
    }

    fn lock(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
