pub mod event;
pub mod model;
pub mod recording;
pub mod signature;

pub use event::{normalize, MalformedPayload, Normalized, NormalizedEvent};
pub use model::*;
pub use recording::{
    CorrelationId, Direction, EventType, RecordedEvent, RecordingLogger, RecordingMiddleware,
    Sanitizer, CORRELATION_ID_HEADER,
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Version string reported by `/health`: the packaged git hash when one was
/// provided at build time, otherwise the crate version.
pub fn get_version() -> String {
    match option_env!("PREQUEL_GIT_HASH") {
        Some(git_hash) if git_hash.len() >= 8 => git_hash[..8].to_string(),
        Some(git_hash) if !git_hash.is_empty() => git_hash.to_string(),
        _ => built_info::PKG_VERSION.to_string(),
    }
}
