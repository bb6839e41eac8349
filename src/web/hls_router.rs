//! Runtime-switchable target of the HLS egress routes
//!
//! The axum routes are registered once at startup; what they serve is swapped
//! in and out as ingest sessions start and stop.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use uuid::Uuid;

use crate::processor::{HlsOutput, MediaProcessor};

/// Handle returned by [`HlsRouter::register`]
pub type RouteId = Uuid;

struct HlsRoute {
    id: RouteId,
    processor: Arc<dyn MediaProcessor>,
}

#[derive(Default)]
pub struct HlsRouter {
    active: ArcSwapOption<HlsRoute>,
}

impl HlsRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the HLS routes at `processor`, replacing any previous registration
    pub fn register(&self, processor: Arc<dyn MediaProcessor>) -> RouteId {
        let id = Uuid::new_v4();
        let previous = self.active.swap(Some(Arc::new(HlsRoute { id, processor })));
        if let Some(previous) = previous {
            tracing::debug!("HLS routes {} replaced by {}", previous.id, id);
        }
        tracing::info!("HLS routes registered ({})", id);
        id
    }

    /// Remove the registration `id`. A newer registration is left untouched.
    pub fn unregister(&self, id: RouteId) -> bool {
        let previous = self.active.rcu(|current| match current {
            Some(route) if route.id == id => None,
            other => other.clone(),
        });
        let removed = previous.is_some_and(|route| route.id == id);
        if removed {
            tracing::info!("HLS routes unregistered ({})", id);
        }
        removed
    }

    pub fn is_active(&self) -> bool {
        self.active.load().is_some()
    }

    /// Output of the registered processor, once it is producing files
    pub fn output(&self) -> Option<HlsOutput> {
        self.active
            .load()
            .as_ref()
            .and_then(|route| route.processor.hls_output())
    }
}
