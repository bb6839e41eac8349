pub mod handlers;
pub mod hls_router;
mod routes;

pub use hls_router::HlsRouter;
pub use routes::create_router;
