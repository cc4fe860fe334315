use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use http::header::CONTENT_TYPE;
use multer::{Constraints, Multipart, SizeLimit};
use tracing::debug;

use crate::{
    error::UploadError,
    guard::{BoxError, GuardError},
};

#[derive(Debug)]
pub struct UploadRequest<R = Cursor<Bytes>> {
    file_name: Option<String>,
    content_type: Option<String>,
    size: u64,
    payload: R,
}

impl<R> UploadRequest<R> {
    pub fn new(file_name: Option<String>, content_type: Option<String>, size: u64, payload: R) -> Self {
        Self {
            file_name,
            content_type,
            size,
            payload,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn payload_mut(&mut self) -> &mut R {
        &mut self.payload
    }
}

pub async fn parse_form<S, E>(
    content_type: Option<&str>,
    body: S,
    field_name: &'static str,
    memory_limit: u64,
) -> Result<Option<UploadRequest>, UploadError>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    let content_type = content_type.ok_or_else(|| {
        UploadError::MalformedOrOversizedForm("request has no content type".to_string())
    })?;
    let boundary = multer::parse_boundary(content_type).map_err(|err| {
        UploadError::MalformedOrOversizedForm(format!("invalid multipart content type: {err}"))
    })?;

    let constraints = Constraints::new().size_limit(
        SizeLimit::new()
            .whole_stream(memory_limit)
            .per_field(memory_limit),
    );
    let mut multipart = Multipart::with_constraints(body, boundary, constraints);

    // Later parts are still drained so an oversized trailer trips the guard.
    let mut found: Option<UploadRequest> = None;
    while let Some(mut field) = multipart.next_field().await.map_err(classify)? {
        if found.is_some() || field.name() != Some(field_name) {
            debug!(field = ?field.name(), "skipping multipart field");
            continue;
        }

        let file_name = field.file_name().map(str::to_owned);
        let declared_type = field
            .headers()
            .get(CONTENT_TYPE)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

        let mut spooled = BytesMut::new();
        while let Some(chunk) = field.chunk().await.map_err(classify)? {
            if (spooled.len() + chunk.len()) as u64 > memory_limit {
                return Err(UploadError::MalformedOrOversizedForm(format!(
                    "field `{field_name}` exceeds the {memory_limit} byte form limit"
                )));
            }
            spooled.extend_from_slice(&chunk);
        }

        if spooled.is_empty() {
            return Err(UploadError::MalformedOrOversizedForm(format!(
                "field `{field_name}` is empty"
            )));
        }

        let size = spooled.len() as u64;
        found = Some(UploadRequest::new(
            file_name,
            declared_type,
            size,
            Cursor::new(spooled.freeze()),
        ));
    }

    Ok(found)
}

fn classify(err: multer::Error) -> UploadError {
    if let multer::Error::StreamReadFailed(source) = &err {
        if let Some(GuardError::PayloadTooLarge { limit }) = source.downcast_ref::<GuardError>() {
            return UploadError::PayloadTooLarge { limit: *limit };
        }
    }
    UploadError::MalformedOrOversizedForm(err.to_string())
}
