//! Concurrency-bounded segment fetching.
//!
//! One stream download pulls its segment sequence in manifest order and
//! appends each segment to a sink file. The two stream downloads of a job
//! share a fixed-capacity token pool, so in-flight transfers across video
//! and audio combined never exceed the pool size. Any failure cancels the
//! job's shared scope, which stops the sibling stream and the iterators.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dash::{MediaType, Segment, SegmentIter};

use crate::error::GrabError;
use crate::progress::SegmentProgress;

/// Per-segment retrieval, abstracted for testability.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch(&self, segment: &Segment) -> Result<Bytes, GrabError>;
}

/// HTTP implementation: one GET per segment, redirects followed by the
/// client, byte ranges via the `Range` header.
pub struct HttpSegmentSource {
    client: Client,
}

impl HttpSegmentSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SegmentSource for HttpSegmentSource {
    async fn fetch(&self, segment: &Segment) -> Result<Bytes, GrabError> {
        let mut request = self.client.get(segment.url.clone());
        if let Some(range) = segment.byte_range {
            request = request.header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", range.start, range.end),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| GrabError::segment_fetch(segment.url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GrabError::HttpStatus {
                status,
                url: segment.url.to_string(),
            });
        }

        response
            .bytes()
            .await
            .map_err(|e| GrabError::segment_fetch(segment.url.as_str(), e))
    }
}

/// Per-stream byte counters. Each counter has exactly one writer (its
/// fetcher); the progress estimator reads the sum and tolerates staleness.
#[derive(Debug, Default)]
pub struct ByteCounters {
    pub video: AtomicU64,
    pub audio: AtomicU64,
}

impl ByteCounters {
    pub fn for_media(&self, media: MediaType) -> &AtomicU64 {
        match media {
            MediaType::Video => &self.video,
            MediaType::Audio => &self.audio,
        }
    }

    pub fn total(&self) -> u64 {
        self.video.load(Ordering::Relaxed) + self.audio.load(Ordering::Relaxed)
    }
}

/// Download one stream's segments into `sink_path`.
///
/// Segments are fetched and appended strictly in iteration order,
/// serialized within the stream; the shared `tokens` pool bounds in-flight
/// transfers across sibling streams. On any error the shared `cancel`
/// scope is cancelled before returning, so the sibling stream stops too.
/// Tokens are released on every exit path, including aborts.
#[allow(clippy::too_many_arguments)]
pub async fn download_stream(
    media: MediaType,
    mut segments: SegmentIter,
    sink_path: &Path,
    source: &dyn SegmentSource,
    tokens: &Semaphore,
    cancel: &CancellationToken,
    counters: &ByteCounters,
    progress: &SegmentProgress,
) -> Result<u64, GrabError> {
    let mut file = match File::create(sink_path).await {
        Ok(file) => file,
        Err(e) => {
            cancel.cancel();
            return Err(e.into());
        }
    };

    let mut written = 0u64;
    let mut index = 0u64;

    while let Some(item) = segments.next() {
        let segment = match item {
            Ok(segment) => segment,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };

        // A permit must be held for the whole transfer; dropping it on any
        // path below returns it to the pool so the sibling is never starved.
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(GrabError::Cancelled),
            permit = tokens.acquire() => permit.map_err(|_| GrabError::Cancelled)?,
        };

        let fetched = tokio::select! {
            _ = cancel.cancelled() => {
                drop(permit);
                return Err(GrabError::Cancelled);
            }
            result = source.fetch(&segment) => result,
        };

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(permit);
                warn!(stream = %media, url = %segment.url, error = %e, "Segment fetch failed");
                cancel.cancel();
                return Err(e);
            }
        };

        if let Err(e) = file.write_all(&bytes).await {
            drop(permit);
            cancel.cancel();
            return Err(e.into());
        }
        drop(permit);

        counters
            .for_media(media)
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        written += bytes.len() as u64;
        index += 1;

        progress.record(counters.total(), segment.position.fraction());

        debug!(
            stream = %media,
            segment = index,
            bytes = bytes.len(),
            "Segment appended"
        );
    }

    if cancel.is_cancelled() {
        return Err(GrabError::Cancelled);
    }

    if let Err(e) = file.flush().await {
        cancel.cancel();
        return Err(e.into());
    }

    debug!(stream = %media, segments = index, bytes = written, "Stream download complete");
    Ok(written)
}
