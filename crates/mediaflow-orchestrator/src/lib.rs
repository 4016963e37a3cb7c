pub mod classify;
pub mod model;
pub mod payload;
pub mod reducer;

pub use classify::{classify, classify_text, ClassifiedError, Severity};
pub use model::TaskEvent;
pub use payload::{ExecutionPath, MediaKind, Orientation, RequestPayload};
pub use reducer::{events_from_stream_message, normalize_progress, reduce, Reduction};
