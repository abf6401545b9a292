//! Application Startup
//!
//! Wires the database, the bus, the hub and the HTTP server together and
//! tears them down in order on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::services::{run_reconciler, MessageService, MessageServiceImpl};
use crate::config::{BusBackend, KafkaSettings, Settings};
use crate::infrastructure::database;
use crate::infrastructure::messaging::{BusConnector, Consumer, MemoryBus, Producer};
use crate::infrastructure::repositories::{PgChatRepository, PgMessageRepository};
use crate::presentation::http::{create_router, handlers::health};
use crate::presentation::websocket::{Hub, HubHandle};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub hub: HubHandle,
    pub messages: Arc<dyn MessageService>,
    pub consumer: Arc<Consumer>,
    pub settings: Arc<Settings>,
}

/// Application instance
pub struct Application {
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    producer: Arc<Producer>,
    consumer: Arc<Consumer>,
    background: Vec<JoinHandle<()>>,
}

/// Broker connector for the configured backend.
pub fn connect_bus(settings: &KafkaSettings) -> Result<Arc<dyn BusConnector>> {
    match settings.backend {
        BusBackend::Memory => {
            tracing::warn!("Using the in-process bus; messages do not survive a restart");
            Ok(Arc::new(MemoryBus::new()))
        }
        #[cfg(feature = "kafka")]
        BusBackend::Kafka => Ok(Arc::new(
            crate::infrastructure::messaging::KafkaConnector::new(),
        )),
        #[cfg(not(feature = "kafka"))]
        BusBackend::Kafka => {
            anyhow::bail!("kafka backend selected but the `kafka` feature is not compiled in")
        }
    }
}

impl Application {
    /// Build the application from settings
    pub async fn build(settings: Settings) -> Result<Self> {
        health::init_server_start();

        let db = database::create_pool(&settings.database).await?;
        database::run_migrations(&db).await?;
        tracing::info!("Database connection pool created");

        let shutdown = CancellationToken::new();
        let mut background = Vec::new();

        let ws = &settings.websocket;
        if ws.health_check_interval().is_some() && ws.max_inactivity() < ws.ping_period() {
            tracing::warn!(
                max_inactivity = ?ws.max_inactivity(),
                ping_period = ?ws.ping_period(),
                "Inactivity limit is shorter than the ping period; idle clients will be swept"
            );
        }
        let (hub, hub_handle) = Hub::new(ws);
        background.push(tokio::spawn(hub.run(shutdown.clone())));

        let connector = connect_bus(&settings.kafka)?;
        let producer = Arc::new(Producer::new(connector.clone(), &settings.kafka)?);

        let service = Arc::new(MessageServiceImpl::new(
            Arc::new(PgMessageRepository::new(db.clone())),
            Arc::new(PgChatRepository::new(db.clone())),
            producer.clone(),
            hub_handle.clone(),
            settings.kafka.publish_attempts,
        ));

        let consumer = Arc::new(Consumer::new(
            connector.as_ref(),
            &settings.kafka,
            service.clone(),
        )?);
        consumer.start(&shutdown).await;

        if settings.kafka.reconcile_interval_secs > 0 {
            background.push(tokio::spawn(run_reconciler(
                service.clone(),
                std::time::Duration::from_secs(settings.kafka.reconcile_interval_secs),
                std::time::Duration::from_secs(settings.kafka.reconcile_after_secs),
                shutdown.clone(),
            )));
        }

        let addr: SocketAddr = settings.server_addr().parse()?;
        let state = AppState {
            db,
            hub: hub_handle,
            messages: service,
            consumer: consumer.clone(),
            settings: Arc::new(settings),
        };
        let router = create_router(state);

        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on {}", addr);

        Ok(Self {
            listener,
            router,
            shutdown,
            producer,
            consumer,
            background,
        })
    }

    /// Serve until SIGINT/SIGTERM, then stop the consumer, flush the
    /// producer and close every client.
    pub async fn run_until_stopped(self) -> Result<()> {
        let signal = self.shutdown.clone();
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => {}
                    _ = signal.cancelled() => {}
                }
            })
            .await?;

        tracing::info!("HTTP server stopped, shutting down pipeline");

        if let Err(e) = self.consumer.close().await {
            tracing::error!(error = %e, "Failed to close bus consumer");
        }
        self.shutdown.cancel();
        if let Err(e) = self.producer.close().await {
            tracing::error!(error = %e, "Failed to close bus producer");
        }
        for task in self.background {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task failed");
            }
        }

        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => tracing::error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                tracing::info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
