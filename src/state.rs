use std::sync::Arc;

use crate::config::IngestConfig;
use crate::orchestrator::Orchestrator;
use crate::processor::HlsSettings;
use crate::shutdown::Shutdown;
use crate::stream::{hls_allocator, StatefulStreamGlobal, StreamAllocator};
use crate::web::HlsRouter;
use crate::webrtc::IngestApi;

/// Application-wide state shared across handlers
///
/// Owned by `main` from startup to shutdown. The ingest slot, the HLS routes
/// and the legacy orchestrator all hang off the process [`Shutdown`].
pub struct AppState {
    /// Shared WebRTC API (media engine, ICE UDP mux)
    pub api: IngestApi,
    /// The one active WHIP stream
    pub streams: Arc<StatefulStreamGlobal>,
    /// Target of the HLS egress routes
    pub hls_router: Arc<HlsRouter>,
    /// Legacy `/api/consumer/whip` path
    pub orchestrator: Arc<Orchestrator>,
    /// Process shutdown registry
    pub shutdown: Arc<Shutdown>,
    /// Settings for processors created by the legacy path
    pub hls_settings: HlsSettings,
    pub broadcaster_id: Option<String>,
}

impl AppState {
    /// Wire the ingest services from the runtime configuration
    pub fn new(config: &IngestConfig, api: IngestApi, shutdown: Arc<Shutdown>) -> Arc<Self> {
        let hls_router = Arc::new(HlsRouter::new());
        let allocator = hls_allocator(config.hls_settings(), hls_router.clone());
        Self::with_allocator(config, api, shutdown, hls_router, allocator)
    }

    /// Same as [`AppState::new`] with a custom stream allocator
    pub fn with_allocator(
        config: &IngestConfig,
        api: IngestApi,
        shutdown: Arc<Shutdown>,
        hls_router: Arc<HlsRouter>,
        allocator: StreamAllocator,
    ) -> Arc<Self> {
        let streams = Arc::new(StatefulStreamGlobal::new(
            allocator,
            shutdown.clone(),
            config.fail_fast,
        ));

        let name = config
            .broadcaster_id
            .clone()
            .unwrap_or_else(|| "ingest".to_string());
        let orchestrator = Arc::new(Orchestrator::new(name, hls_router.clone()));
        {
            let orchestrator = orchestrator.clone();
            shutdown.add_task(move || orchestrator.stop());
        }

        Arc::new(Self {
            api,
            streams,
            hls_router,
            orchestrator,
            shutdown,
            hls_settings: config.hls_settings(),
            broadcaster_id: config.broadcaster_id.clone(),
        })
    }
}
