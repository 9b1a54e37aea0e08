//! Outbound delivery dispatcher
//!
//! Split into two halves: a cloneable handle producers enqueue on, and an
//! exclusive consumption loop that performs the actual sends. This is the
//! only bridge between the blocking broker side and the connection tasks;
//! broker code never touches a connection directly.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use super::message::Outbound;
use super::registry::ClientRegistry;

/// Cloneable producer half of the dispatch queue.
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::Sender<Outbound>,
    shutdown_tx: mpsc::Sender<()>,
}

/// Exclusive consumer half; drains the queue and writes to connections.
pub struct DispatcherLoop {
    receiver: mpsc::Receiver<Outbound>,
    registry: Arc<ClientRegistry>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Create the dispatch queue with the given bound.
pub fn create_dispatcher(
    registry: Arc<ClientRegistry>,
    capacity: usize,
) -> (DispatcherHandle, DispatcherLoop) {
    let (sender, receiver) = mpsc::channel(capacity);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    let handle = DispatcherHandle {
        sender,
        shutdown_tx,
    };
    let dispatch_loop = DispatcherLoop {
        receiver,
        registry,
        shutdown_rx,
    };

    (handle, dispatch_loop)
}

impl DispatcherHandle {
    /// Enqueue from an async context, waiting for queue space.
    pub async fn send(&self, outbound: Outbound) -> Result<()> {
        self.sender
            .send(outbound)
            .await
            .map_err(|_| anyhow::anyhow!("dispatch queue closed"))?;
        Ok(())
    }

    /// Enqueue from the synchronous broker side without blocking.
    ///
    /// A full queue drops the newest entry with a warning; notifications are
    /// best effort, and ingestion must never stall on slow clients.
    pub fn enqueue(&self, outbound: Outbound) {
        if let Err(err) = self.sender.try_send(outbound) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!("dispatch queue full, dropping outbound entry");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::warn!("dispatch queue closed, dropping outbound entry");
                }
            }
        }
    }

    /// Ask the consumption loop to stop. In-flight entries may be dropped.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl DispatcherLoop {
    /// Run until the queue closes or shutdown is signalled.
    pub async fn run(mut self) {
        tracing::info!("delivery dispatcher running");

        loop {
            tokio::select! {
                entry = self.receiver.recv() => {
                    match entry {
                        Some(outbound) => self.deliver(outbound).await,
                        None => {
                            tracing::info!("dispatch queue closed");
                            break;
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("dispatcher received shutdown signal");
                    break;
                }
            }
        }

        tracing::info!("delivery dispatcher stopped");
    }

    async fn deliver(&self, outbound: Outbound) {
        match outbound {
            Outbound::Broadcast { payload } => {
                // Snapshot senders before awaiting; locks are never held
                // across a send.
                let targets = self.registry.broadcast_targets();
                for (connection, tx) in targets {
                    if tx.send(payload.clone()).await.is_err() {
                        tracing::debug!(%connection, "connection gone, removing from registry");
                        self.registry.unregister(connection);
                    }
                }
            }
            Outbound::Targeted { payload, targets } => {
                for user_id in targets {
                    let Some(tx) = self.registry.lookup(&user_id) else {
                        tracing::trace!(user_id, "no connection for targeted delivery");
                        continue;
                    };
                    if tx.send(payload.clone()).await.is_err() {
                        if let Some(connection) = self.registry.connection_of(&user_id) {
                            tracing::debug!(
                                %connection,
                                user_id,
                                "targeted send failed, removing connection"
                            );
                            self.registry.unregister(connection);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let registry = Arc::new(ClientRegistry::new());
        let (handle, dispatch_loop) = create_dispatcher(registry.clone(), 16);

        let (_id1, mut rx1) = registry.add_connection();
        let (_id2, mut rx2) = registry.add_connection();

        let loop_handle = tokio::spawn(dispatch_loop.run());

        handle
            .send(Outbound::Broadcast {
                payload: "hola".to_string(),
            })
            .await
            .unwrap();

        let got1 = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap();
        let got2 = timeout(Duration::from_secs(1), rx2.recv()).await.unwrap();
        assert_eq!(got1.as_deref(), Some("hola"));
        assert_eq!(got2.as_deref(), Some("hola"));

        loop_handle.abort();
    }

    #[tokio::test]
    async fn targeted_delivery_skips_unknown_users() {
        let registry = Arc::new(ClientRegistry::new());
        let (handle, dispatch_loop) = create_dispatcher(registry.clone(), 16);

        let (conn, mut rx) = registry.add_connection();
        registry.register("8", conn);

        let loop_handle = tokio::spawn(dispatch_loop.run());

        handle
            .send(Outbound::Targeted {
                payload: "alerta".to_string(),
                targets: vec!["8".to_string(), "99".to_string()],
            })
            .await
            .unwrap();

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("alerta"));

        loop_handle.abort();
    }

    #[tokio::test]
    async fn dead_connection_is_unregistered_on_send_failure() {
        let registry = Arc::new(ClientRegistry::new());
        let (handle, dispatch_loop) = create_dispatcher(registry.clone(), 16);

        let (conn, rx) = registry.add_connection();
        registry.register("8", conn);
        drop(rx); // simulate a disconnected client

        let loop_handle = tokio::spawn(dispatch_loop.run());

        handle
            .send(Outbound::Targeted {
                payload: "alerta".to_string(),
                targets: vec!["8".to_string()],
            })
            .await
            .unwrap();

        // Give the loop a moment to process the failure.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.lookup("8").is_none());

        loop_handle.abort();
    }

    #[tokio::test]
    async fn enqueue_drops_newest_when_full() {
        let registry = Arc::new(ClientRegistry::new());
        // Capacity 1, no consumer running: second enqueue must not block.
        let (handle, _dispatch_loop) = create_dispatcher(registry, 1);

        handle.enqueue(Outbound::Broadcast {
            payload: "one".to_string(),
        });
        handle.enqueue(Outbound::Broadcast {
            payload: "two".to_string(),
        });
        // Reaching this line at all is the assertion.
    }
}
