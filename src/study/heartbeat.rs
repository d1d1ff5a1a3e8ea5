use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::storage::Storage;

/// Records heartbeats for one running trial until dropped.
pub(crate) struct Heartbeat {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Starts beating if the store tracks liveness. Returns `None` otherwise,
    /// or if the thread cannot be spawned.
    pub(crate) fn start(storage: &Arc<dyn Storage>, trial_id: u64) -> Option<Self> {
        let policy = storage.heartbeat_policy()?;
        let (stop, stopped) = mpsc::channel::<()>();
        let storage = Arc::clone(storage);
        let handle = thread::Builder::new()
            .name(format!("heartbeat-{trial_id}"))
            .spawn(move || loop {
                if let Err(e) = storage.record_heartbeat(trial_id) {
                    trace_warn!(trial_id, error = %e, "heartbeat not recorded");
                    #[cfg(not(feature = "tracing"))]
                    drop(e);
                }
                match stopped.recv_timeout(policy.interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .ok()?;
        Some(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::{HeartbeatPolicy, MemoryStorage, NewTrial, SqliteStorage};
    use crate::types::Direction;

    #[test]
    fn stores_without_policy_do_not_beat() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        assert!(Heartbeat::start(&storage, 0).is_none());
    }

    #[test]
    fn beats_until_dropped() {
        let path = std::env::temp_dir().join(format!("hpd_beat_{}.db", uuid::Uuid::new_v4()));
        let policy = HeartbeatPolicy {
            interval: Duration::from_millis(10),
            grace_period: Duration::from_secs(1),
        };
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&path, Some(policy)).unwrap());
        let study = storage.create_study("s", &[Direction::Minimize]).unwrap();
        let trial = storage.create_trial(study.id, NewTrial::running()).unwrap();

        let beat = Heartbeat::start(&storage, trial.id).unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(beat);
        assert!(storage.trial(trial.id).unwrap().heartbeat.is_some());
        std::fs::remove_file(&path).ok();
    }
}
