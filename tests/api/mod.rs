mod message_tests;
mod websocket_tests;

use std::sync::Arc;

use axum_test::{TestServer, TestServerBuilder};

use messenger::config::Settings;
use messenger::infrastructure::database;
use messenger::presentation::http::create_router;
use messenger::startup::AppState;

use crate::common::harness::Pipeline;

/// Router over a running in-process pipeline. The database pool is lazy and
/// points nowhere; handlers that only use the service never touch it.
pub struct TestApp {
    pub server: TestServer,
    pub pipeline: Pipeline,
}

impl TestApp {
    pub async fn new(settings: Settings) -> Self {
        Self::build(settings, TestServer::builder()).await
    }

    /// Served over a real socket, as WebSocket upgrades require.
    pub async fn with_http_transport(settings: Settings) -> Self {
        Self::build(settings, TestServer::builder().http_transport()).await
    }

    async fn build(settings: Settings, builder: TestServerBuilder) -> Self {
        let pipeline = Pipeline::start(settings.clone()).await;
        let state = AppState {
            db: database::create_lazy_pool(&settings.database).unwrap(),
            hub: pipeline.hub.clone(),
            messages: pipeline.service.clone(),
            consumer: pipeline.consumer.clone(),
            settings: Arc::new(settings),
        };
        let server = builder.build(create_router(state)).unwrap();
        Self { server, pipeline }
    }
}
