//! Lifecycle coordinator
//!
//! Startup order:
//! 1. persistence (fatal on failure)
//! 2. supervisory tag store and sinks
//! 3. listener bind (fatal on failure, with a port-conflict diagnostic)
//!
//! Shutdown stops accepting, closes the registry to new admissions,
//! terminates every session (which kills its decoder), closes the tag store and flushes persistence, all within the
//! configured grace period. Calling it twice is harmless.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::router::CommandRouter;
use crate::server::handle_connection;
use crate::session::SessionRegistry;
use crate::sinks::{Broadcaster, DeviceStore, PersistenceSink, TagStore};

/// Shared state reachable from every connection task
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub registry: SessionRegistry,
    pub broadcaster: Arc<Broadcaster>,
    pub tags: Arc<TagStore>,
    pub store: DeviceStore,
    pub router: CommandRouter,
}

/// A started gateway
pub struct Gateway {
    ctx: Arc<GatewayContext>,
    persistence: Arc<PersistenceSink>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shut_down: AtomicBool,
}

impl Gateway {
    /// Initialize sinks and bind the listener
    pub async fn start(config: GatewayConfig) -> Result<Self, GatewayError> {
        let store = DeviceStore::connect(&config.persistence.database_url)
            .await
            .map_err(GatewayError::PersistenceInit)?;

        let tags = Arc::new(TagStore::new(config.supervisory.root_folder.clone()));
        let persistence = Arc::new(PersistenceSink::spawn(
            store.clone(),
            config.persistence.queue_capacity,
        ));

        let broadcaster = Arc::new(Broadcaster::new(config.dashboard_buffer));
        broadcaster.add_sink(tags.clone());
        broadcaster.add_sink(persistence.clone());

        let addr = config.listen_addr;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                GatewayError::PortInUse { addr }
            } else {
                GatewayError::Bind { addr, source: e }
            }
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind { addr, source: e })?;
        info!("Listening on ws://{}", local_addr);

        let registry = SessionRegistry::new();
        let router = CommandRouter::new(registry.clone(), broadcaster.clone());

        Ok(Self {
            ctx: Arc::new(GatewayContext {
                config,
                registry,
                broadcaster,
                tags,
                store,
                router,
            }),
            persistence,
            listener: Mutex::new(Some(listener)),
            local_addr,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    /// Accept connections until `signal` completes, then shut down
    pub async fn run_until<F>(&self, signal: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.listener.lock().take();
        let Some(listener) = listener else {
            debug!("Gateway already ran");
            return Ok(());
        };

        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let ctx = self.ctx.clone();
                        tokio::spawn(handle_connection(ctx, stream, peer));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }

        drop(listener);
        info!("Stopped accepting connections");
        self.shutdown().await;
        Ok(())
    }

    /// Drain sessions and close sinks; later calls return immediately
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.listener.lock().take());

        let grace = self.ctx.config.shutdown_grace;
        let registry = &self.ctx.registry;

        let sessions = registry.close();
        info!("Shutting down, terminating {} session(s)", sessions);

        let drained = tokio::time::timeout(grace, async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} session(s) still closing after {:?}",
                registry.len(),
                grace
            );
        }

        self.ctx.tags.close();
        self.persistence.close(grace).await;
        self.ctx.store.close().await;
        info!("Gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig::default()
            .with_listen_addr("127.0.0.1:0".parse().unwrap())
            .with_database_url("sqlite::memory:")
            .with_shutdown_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_port_conflict_is_fatal() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap();

        match Gateway::start(config().with_listen_addr(addr)).await {
            Err(e @ GatewayError::PortInUse { .. }) => {
                assert!(e.is_fatal());
                assert!(e.to_string().contains(&addr.port().to_string()));
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("bind should fail"),
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let result = Gateway::start(
            config().with_database_url("sqlite:///nonexistent-dir/for/csms/test.db"),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::PersistenceInit(_))));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let gateway = Gateway::start(config()).await.unwrap();
        assert_ne!(gateway.local_addr().port(), 0);

        gateway.run_until(async {}).await.unwrap();
        gateway.shutdown().await;
        // Running again after shutdown is a no-op
        gateway.run_until(std::future::pending()).await.unwrap();

        assert!(gateway.context().tags.bind("CP1").is_err());
        assert!(matches!(
            gateway.context().registry.admit("CP1"),
            Err(GatewayError::ShuttingDown)
        ));
    }
}
