pub mod error;
pub mod form;
pub mod guard;
pub mod persist;
pub mod pipeline;
pub mod progress;
pub mod sniff;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{ErrorKind, UploadError};
pub use form::{parse_form, UploadRequest};
pub use guard::{BoxError, GuardError, SizeGuard};
pub use persist::{extension_of, Destination, Persister, StoredFile};
pub use pipeline::{UploadPipeline, UploadStage, DEFAULT_UPLOAD_DIR, FILE_FIELD, MAX_UPLOAD_SIZE};
pub use progress::{
    NoopObserver, ProgressEvent, ProgressObserver, ProgressState, ProgressTee, TracingObserver,
};
