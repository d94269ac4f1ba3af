use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{error, info, instrument};

use crate::config::Upload;
use crate::error::UploadError;
use crate::graph::ListService;
use crate::model::chunk_ranges;

/// Bytes per PUT.
pub const CHUNK_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub local_path: PathBuf,
    /// Path under the drive root, e.g. `folder/file.csv`.
    pub remote_path: String,
}

impl UploadJob {
    pub fn from_config(cfg: &Upload) -> Vec<Self> {
        cfg.files
            .iter()
            .filter_map(|file| {
                let name = file.remote_name()?;
                let folder = cfg.remote_folder.trim_matches('/');
                let remote_path = if folder.is_empty() {
                    name
                } else {
                    format!("{folder}/{name}")
                };
                Some(Self {
                    local_path: PathBuf::from(&file.local_path),
                    remote_path,
                })
            })
            .collect()
    }
}

/// Upload one file in `chunk_size` pieces through a fresh session. Returns
/// the number of chunks sent. A failed chunk abandons the session; chunks
/// already accepted stay accepted.
#[instrument(skip_all, fields(file = %job.remote_path))]
pub async fn upload_file(
    service: &dyn ListService,
    job: &UploadJob,
    chunk_size: u64,
) -> Result<usize, UploadError> {
    let file_label = job.remote_path.clone();
    let read_err = |source: std::io::Error| UploadError::Read {
        file: file_label.clone(),
        source,
    };

    let mut file = File::open(&job.local_path).await.map_err(read_err)?;
    let total = file.metadata().await.map_err(read_err)?.len();

    let upload_url = service
        .create_upload_session(&job.remote_path)
        .await
        .map_err(|source| UploadError::Session {
            file: file_label.clone(),
            source,
        })?;

    let ranges = chunk_ranges(total, chunk_size);
    for range in &ranges {
        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(read_err)?;
        let mut buf = vec![0u8; range.len() as usize];
        file.read_exact(&mut buf).await.map_err(read_err)?;

        service
            .upload_chunk(&upload_url, *range, total, buf)
            .await
            .map_err(|source| UploadError::Chunk {
                file: file_label.clone(),
                range: *range,
                source,
            })?;
    }

    info!(bytes = total, chunks = ranges.len(), "upload complete");
    Ok(ranges.len())
}

/// Upload every job; a failed file does not stop the next one.
pub async fn upload_all(
    service: &dyn ListService,
    jobs: &[UploadJob],
    chunk_size: u64,
) -> Vec<Result<usize, UploadError>> {
    let mut results = Vec::with_capacity(jobs.len());
    for job in jobs {
        let result = upload_file(service, job, chunk_size).await;
        if let Err(err) = &result {
            error!(%err, "upload failed");
        }
        results.push(result);
    }
    results
}
