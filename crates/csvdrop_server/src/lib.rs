mod app;

pub use app::{build_router, AppState, ServerConfig, SseUpdate, UploadResponse};
