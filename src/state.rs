use crate::sync::engine::{run_sync_client, SyncCollaborators};
use crate::sync::types::SyncConfig;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct SyncTaskHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

/// Owns the background sync task. `connect` and `disconnect` are idempotent.
pub struct SyncClient {
    config: SyncConfig,
    collaborators: SyncCollaborators,
    task: Mutex<Option<SyncTaskHandle>>,
}

impl SyncClient {
    pub fn new(config: SyncConfig, collaborators: SyncCollaborators) -> Self {
        Self {
            config,
            collaborators,
            task: Mutex::new(None),
        }
    }

    /// Starts the sync task unless one is already running. Returns whether a task was spawned.
    pub async fn connect(&self) -> bool {
        let mut task_slot = self.task.lock().await;
        if task_slot
            .as_ref()
            .is_some_and(|handle| !handle.join_handle.is_finished())
        {
            return false;
        }

        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let runtime_config = self.config.clone();
        let collaborators = self.collaborators.clone();

        let join_handle = tokio::spawn(async move {
            run_sync_client(runtime_config, collaborators, task_token).await;
        });

        *task_slot = Some(SyncTaskHandle {
            cancellation_token,
            join_handle,
        });
        true
    }

    /// Stops the sync task and waits for its teardown. Returns whether a task was running.
    pub async fn disconnect(&self) -> bool {
        let existing_handle = {
            let mut task_slot = self.task.lock().await;
            task_slot.take()
        };

        if let Some(handle) = existing_handle {
            handle.cancellation_token.cancel();
            let _ = handle.join_handle.await;
            true
        } else {
            false
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.join_handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::refresh::testing::CannedRefreshSource;
    use crate::sync::sink::testing::RecordingStore;
    use crate::sync::transport::testing::ChannelTransport;
    use crate::sync::transport::StaticToken;
    use crate::sync::types::ConnectionState;
    use std::sync::Arc;
    use std::time::Duration;

    fn client() -> (SyncClient, ChannelTransport, Arc<RecordingStore>) {
        let transport = ChannelTransport::default();
        let store = Arc::new(RecordingStore::default());
        let collaborators = SyncCollaborators {
            sink: store.clone(),
            transport: Arc::new(transport.clone()),
            tokens: Arc::new(StaticToken(Some("token".to_string()))),
            refresh: Arc::new(CannedRefreshSource::default()),
        };
        (
            SyncClient::new(SyncConfig::default(), collaborators),
            transport,
            store,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn connect_twice_spawns_one_task() {
        let (client, transport, _store) = client();

        assert!(client.connect().await);
        assert!(!client.connect().await);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(transport.state.lock().subscribe_calls, 1);
        assert!(client.is_running().await);
        assert!(client.disconnect().await);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_tears_down_and_is_idempotent() {
        let (client, transport, store) = client();
        client.connect().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(client.disconnect().await);
        assert!(!client.disconnect().await);

        assert!(!client.is_running().await);
        assert_eq!(transport.state.lock().disposed, 1);
        assert_eq!(store.store.connection_state(), ConnectionState::Disconnected);
    }
}
