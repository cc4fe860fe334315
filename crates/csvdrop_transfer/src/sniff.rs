use std::io::SeekFrom;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tracing::{debug, warn};

use crate::error::UploadError;

pub const PROBE_LEN: usize = 512;

/// Reads up to [`PROBE_LEN`] leading bytes of the payload.
///
/// The bytes are not used for the acceptance decision; only the declared
/// content type is. The payload must be rewound afterwards.
pub async fn probe<R>(payload: &mut R) -> Result<Vec<u8>, UploadError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; PROBE_LEN];
    let read = payload.read(&mut buffer).await.map_err(|err| {
        UploadError::MalformedOrOversizedForm(format!("failed to read file part: {err}"))
    })?;
    buffer.truncate(read);
    debug!(probed = read, "probed upload payload");
    Ok(buffer)
}

pub fn check_declared_type(declared: Option<&str>, accepted: &str) -> Result<(), UploadError> {
    match declared {
        Some(value) if value == accepted => Ok(()),
        other => {
            let declared = other.unwrap_or_default().to_string();
            warn!(declared = %declared, accepted = %accepted, "rejected upload content type");
            Err(UploadError::UnsupportedFileType { declared })
        }
    }
}

pub async fn rewind<R>(payload: &mut R) -> Result<(), UploadError>
where
    R: AsyncSeek + Unpin,
{
    let position = payload
        .seek(SeekFrom::Start(0))
        .await
        .map_err(UploadError::StreamNotSeekable)?;
    if position != 0 {
        return Err(UploadError::StreamNotSeekable(std::io::Error::other(format!(
            "stream reported position {position} after rewind"
        ))));
    }
    Ok(())
}
