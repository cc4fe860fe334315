use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};
use tracing::{debug, warn};

use crate::{
    error::UploadError,
    progress::{ProgressObserver, ProgressTee},
};

pub const COPY_CHUNK_SIZE: usize = 32 * 1024;
const MAX_NAME_ATTEMPTS: usize = 8;
const MAX_EXTENSION_LEN: usize = 16;

static LAST_ISSUED_NANOS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug)]
pub struct Destination {
    file_name: String,
    path: PathBuf,
    file: File,
}

impl Destination {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct Persister {
    root: PathBuf,
}

impl Persister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_dir(&self) -> Result<(), UploadError> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o777);

        builder
            .create(&self.root)
            .await
            .map_err(UploadError::storage("create upload directory"))
    }

    pub async fn create_destination(
        &self,
        original_name: Option<&str>,
    ) -> Result<Destination, UploadError> {
        self.create_named(original_name, next_timestamp_nanos).await
    }

    async fn create_named(
        &self,
        original_name: Option<&str>,
        mut next_nanos: impl FnMut() -> u64,
    ) -> Result<Destination, UploadError> {
        let extension = extension_of(original_name.unwrap_or_default());

        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let file_name = format!("{}{}", next_nanos(), extension);
            let path = self.root.join(&file_name);

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    debug!(file_name = %file_name, "created upload destination");
                    return Ok(Destination {
                        file_name,
                        path,
                        file,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(file_name = %file_name, attempt, "generated upload name already taken");
                }
                Err(err) => return Err(UploadError::storage("create destination file")(err)),
            }
        }

        Err(UploadError::StorageUnavailable {
            action: "create destination file",
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("no free file name after {MAX_NAME_ATTEMPTS} attempts"),
            ),
        })
    }

    pub async fn write_through<R, O>(
        &self,
        destination: Destination,
        source: &mut R,
        total_size: u64,
        observer: &mut O,
    ) -> Result<StoredFile, UploadError>
    where
        R: AsyncRead + Unpin,
        O: ProgressObserver + ?Sized,
    {
        let Destination {
            file_name,
            path,
            file,
        } = destination;
        // Declared before `file` so the handle closes before the unlink.
        let partial = PartialUpload::new(path);
        let mut file = file;

        match copy_with_progress(source, &mut file, total_size, observer).await {
            Ok(size) => Ok(StoredFile {
                file_name,
                path: partial.keep(),
                size,
            }),
            Err(err) => {
                drop(file);
                drop(partial);
                Err(err)
            }
        }
    }
}

struct PartialUpload {
    path: PathBuf,
    armed: bool,
}

impl PartialUpload {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for PartialUpload {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial upload"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "failed to remove partial upload"
            ),
        }
    }
}

async fn copy_with_progress<R, W, O>(
    source: &mut R,
    destination: &mut W,
    total_size: u64,
    observer: &mut O,
) -> Result<u64, UploadError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    O: ProgressObserver + ?Sized,
{
    let mut tee = ProgressTee::new(total_size, observer);
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let read = source
            .read(&mut buffer)
            .await
            .map_err(UploadError::storage("read upload payload"))?;
        if read == 0 {
            break;
        }

        let chunk = &buffer[..read];
        io::Write::write_all(&mut tee, chunk).map_err(UploadError::storage("track progress"))?;
        destination
            .write_all(chunk)
            .await
            .map_err(UploadError::storage("write destination file"))?;
        written += read as u64;
    }

    destination
        .flush()
        .await
        .map_err(UploadError::storage("flush destination file"))?;
    Ok(written)
}

pub fn extension_of(file_name: &str) -> &str {
    let segment = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);

    let Some(dot) = segment.rfind('.') else {
        return "";
    };
    let extension = &segment[dot..];
    let valid = extension.len() > 1
        && extension.len() <= MAX_EXTENSION_LEN
        && extension[1..].chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        extension
    } else {
        ""
    }
}

// Bumped past the last value so coarse clocks never repeat a name.
fn next_timestamp_nanos() -> u64 {
    let now = Utc::now()
        .timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
        .unwrap_or_default();

    let mut last = LAST_ISSUED_NANOS.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last.saturating_add(1));
        match LAST_ISSUED_NANOS.compare_exchange_weak(
            last,
            candidate,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}
