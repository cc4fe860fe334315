use std::{fmt, path::PathBuf};

use bytes::Bytes;
use futures::Stream;
use tracing::{debug, info, warn};

use crate::{
    error::UploadError,
    form::parse_form,
    guard::{BoxError, SizeGuard},
    persist::{Persister, StoredFile},
    progress::ProgressObserver,
    sniff,
};

pub const MAX_UPLOAD_SIZE: u64 = 1024 * 1024;
pub const FILE_FIELD: &str = "file";
pub const DEFAULT_UPLOAD_DIR: &str = "./uploads";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Start,
    SizeEnforced,
    FormParsed,
    FieldExtracted,
    TypeValidated,
    Rewound,
    DirectoryEnsured,
    FileCreated,
    Copied,
    Done,
}

impl UploadStage {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStage::Start => "start",
            UploadStage::SizeEnforced => "size_enforced",
            UploadStage::FormParsed => "form_parsed",
            UploadStage::FieldExtracted => "field_extracted",
            UploadStage::TypeValidated => "type_validated",
            UploadStage::Rewound => "rewound",
            UploadStage::DirectoryEnsured => "directory_ensured",
            UploadStage::FileCreated => "file_created",
            UploadStage::Copied => "copied",
            UploadStage::Done => "done",
        }
    }
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct UploadPipeline {
    persister: Persister,
}

impl Default for UploadPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_UPLOAD_DIR)
    }
}

impl UploadPipeline {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            persister: Persister::new(upload_dir),
        }
    }

    pub async fn handle_upload<S, E, O>(
        &self,
        content_type: Option<&str>,
        body: S,
        observer: &mut O,
    ) -> Result<StoredFile, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
        E: Into<BoxError> + 'static,
        O: ProgressObserver + ?Sized,
    {
        let mut stage = UploadStage::Start;
        let result = self.run(content_type, body, observer, &mut stage).await;

        match &result {
            Ok(stored) => info!(
                file_name = %stored.file_name,
                size = stored.size,
                "upload stored"
            ),
            Err(err) => warn!(
                reached = %stage,
                kind = err.kind().as_str(),
                error = %err,
                "upload failed"
            ),
        }
        result
    }

    async fn run<S, E, O>(
        &self,
        content_type: Option<&str>,
        body: S,
        observer: &mut O,
        stage: &mut UploadStage,
    ) -> Result<StoredFile, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
        E: Into<BoxError> + 'static,
        O: ProgressObserver + ?Sized,
    {
        let guarded = SizeGuard::new(body, MAX_UPLOAD_SIZE);
        advance(stage, UploadStage::SizeEnforced);

        let parsed = parse_form(content_type, guarded, FILE_FIELD, MAX_UPLOAD_SIZE).await?;
        advance(stage, UploadStage::FormParsed);

        let mut request = parsed.ok_or(UploadError::MissingFileField(FILE_FIELD))?;
        advance(stage, UploadStage::FieldExtracted);

        sniff::probe(request.payload_mut()).await?;
        sniff::check_declared_type(request.content_type(), mime::TEXT_CSV.essence_str())?;
        advance(stage, UploadStage::TypeValidated);

        sniff::rewind(request.payload_mut()).await?;
        advance(stage, UploadStage::Rewound);

        self.persister.ensure_dir().await?;
        advance(stage, UploadStage::DirectoryEnsured);

        let destination = self
            .persister
            .create_destination(request.file_name())
            .await?;
        advance(stage, UploadStage::FileCreated);

        let total_size = request.size();
        let stored = self
            .persister
            .write_through(destination, request.payload_mut(), total_size, observer)
            .await?;
        advance(stage, UploadStage::Copied);

        advance(stage, UploadStage::Done);
        Ok(stored)
    }
}

fn advance(stage: &mut UploadStage, next: UploadStage) {
    debug!(from = %stage, to = %next, "upload stage");
    *stage = next;
}

#[cfg(test)]
mod tests {
    use std::{io, path::Path};

    use bytes::Bytes;
    use futures::stream;

    use super::{UploadPipeline, UploadStage, MAX_UPLOAD_SIZE};
    use crate::{
        error::ErrorKind,
        progress::{NoopObserver, ProgressEvent},
        testing::MultipartBody,
    };

    fn body_stream(
        body: Vec<u8>,
    ) -> impl futures::Stream<Item = Result<Bytes, io::Error>> + Send + Unpin + 'static {
        let chunks: Vec<Result<Bytes, io::Error>> = body
            .chunks(16 * 1024)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        stream::iter(chunks)
    }

    fn stored_names(dir: &Path) -> Vec<String> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
                .collect(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => panic!("read_dir failed: {err}"),
        }
    }

    #[tokio::test]
    async fn stores_a_valid_csv_upload() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let upload_dir = scratch.path().join("uploads");
        let pipeline = UploadPipeline::new(&upload_dir);

        let form = MultipartBody::new().file("file", "data.csv", "text/csv", b"a,b\n1,2\n\n");
        let mut events = Vec::new();
        let mut observer = |event: ProgressEvent| events.push(event);

        let stored = pipeline
            .handle_upload(Some(&form.content_type()), body_stream(form.finish()), &mut observer)
            .await
            .expect("upload succeeds");

        assert!(stored.file_name.ends_with(".csv"));
        assert_eq!(stored.size, 9);
        assert_eq!(stored.path, upload_dir.join(&stored.file_name));
        assert_eq!(std::fs::read(&stored.path).expect("read back"), b"a,b\n1,2\n\n");
        assert_eq!(stored_names(&upload_dir), vec![stored.file_name.clone()]);

        assert_eq!(events, vec![ProgressEvent::Completed { total_size: 9 }]);
    }

    #[tokio::test]
    async fn rejects_non_csv_declared_types_without_writing() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let upload_dir = scratch.path().join("uploads");
        let pipeline = UploadPipeline::new(&upload_dir);

        let form =
            MultipartBody::new().file("file", "data.csv", "application/json", b"a,b\n1,2\n\n");
        let err = pipeline
            .handle_upload(Some(&form.content_type()), body_stream(form.finish()), &mut NoopObserver)
            .await
            .expect_err("wrong type");

        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
        assert_eq!(err.rejected_content_type(), Some("application/json"));
        assert!(stored_names(&upload_dir).is_empty());
    }

    #[tokio::test]
    async fn rejects_untyped_parts() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let pipeline = UploadPipeline::new(scratch.path().join("uploads"));

        let form = MultipartBody::new().untyped_file("file", "data.csv", b"a,b\n");
        let err = pipeline
            .handle_upload(Some(&form.content_type()), body_stream(form.finish()), &mut NoopObserver)
            .await
            .expect_err("no declared type");
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
    }

    #[tokio::test]
    async fn rejects_oversized_bodies_before_creating_files() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let upload_dir = scratch.path().join("uploads");
        let pipeline = UploadPipeline::new(&upload_dir);

        let csv = "1,2,3,4,5,6,7,8\n".repeat((2 * MAX_UPLOAD_SIZE as usize) / 16);
        let form = MultipartBody::new().file("file", "big.csv", "text/csv", csv.as_bytes());
        let err = pipeline
            .handle_upload(Some(&form.content_type()), body_stream(form.finish()), &mut NoopObserver)
            .await
            .expect_err("too large");

        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
        assert!(!upload_dir.exists());
    }

    #[tokio::test]
    async fn reports_missing_file_field() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let upload_dir = scratch.path().join("uploads");
        let pipeline = UploadPipeline::new(&upload_dir);

        let form = MultipartBody::new()
            .text("comment", "no file here")
            .file("attachment", "data.csv", "text/csv", b"a,b\n");
        let err = pipeline
            .handle_upload(Some(&form.content_type()), body_stream(form.finish()), &mut NoopObserver)
            .await
            .expect_err("missing field");

        assert_eq!(err.kind(), ErrorKind::MissingFileField);
        assert!(!upload_dir.exists());
    }

    #[tokio::test]
    async fn failures_record_the_last_stage_reached() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let pipeline = UploadPipeline::new(scratch.path().join("uploads"));

        let form = MultipartBody::new().text("comment", "no file here");
        let mut stage = UploadStage::Start;
        let err = pipeline
            .run(Some(&form.content_type()), body_stream(form.finish()), &mut NoopObserver, &mut stage)
            .await
            .expect_err("missing field");
        assert_eq!(err.kind(), ErrorKind::MissingFileField);
        assert_eq!(stage, UploadStage::FormParsed);

        let mut stage = UploadStage::Start;
        let err = pipeline
            .run(
                Some("multipart/form-data; boundary=abc"),
                body_stream(b"not multipart at all".to_vec()),
                &mut NoopObserver,
                &mut stage,
            )
            .await
            .expect_err("broken framing");
        assert_eq!(err.kind(), ErrorKind::MalformedOrOversizedForm);
        assert_eq!(stage, UploadStage::SizeEnforced);

        let form = MultipartBody::new().file("file", "data.csv", "text/plain", b"a,b\n");
        let mut stage = UploadStage::Start;
        let err = pipeline
            .run(Some(&form.content_type()), body_stream(form.finish()), &mut NoopObserver, &mut stage)
            .await
            .expect_err("wrong type");
        assert_eq!(err.kind(), ErrorKind::UnsupportedFileType);
        assert_eq!(stage, UploadStage::FieldExtracted);
    }

    #[tokio::test]
    async fn progress_accounts_for_every_byte() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let pipeline = UploadPipeline::new(scratch.path());

        let csv = "id,name\n".repeat(10_000);
        let form = MultipartBody::new().file("file", "rows.csv", "text/csv", csv.as_bytes());
        let mut last_read = 0u64;
        let mut completions = 0usize;
        let mut observer = |event: ProgressEvent| match event {
            ProgressEvent::Advanced { bytes_read, .. } => {
                assert!(bytes_read > last_read);
                last_read = bytes_read;
            }
            ProgressEvent::Completed { total_size } => {
                assert_eq!(total_size, csv.len() as u64);
                completions += 1;
            }
        };

        let stored = pipeline
            .handle_upload(Some(&form.content_type()), body_stream(form.finish()), &mut observer)
            .await
            .expect("upload succeeds");

        assert_eq!(completions, 1);
        assert!(last_read < csv.len() as u64);
        assert_eq!(stored.size, csv.len() as u64);
    }

    #[tokio::test]
    async fn consecutive_uploads_get_distinct_names() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let pipeline = UploadPipeline::new(scratch.path());

        let mut names = Vec::new();
        for _ in 0..2 {
            let form = MultipartBody::new().file("file", "data.csv", "text/csv", b"a,b\n");
            let stored = pipeline
                .handle_upload(Some(&form.content_type()), body_stream(form.finish()), &mut NoopObserver)
                .await
                .expect("upload succeeds");
            names.push(stored.file_name);
        }

        assert_ne!(names[0], names[1]);
        assert_eq!(stored_names(scratch.path()).len(), 2);
    }

    #[test]
    fn accepted_type_is_plain_csv() {
        assert_eq!(mime::TEXT_CSV.essence_str(), "text/csv");
    }
}
