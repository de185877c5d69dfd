//! Acquisition job orchestration.
//!
//! One job turns a show descriptor into a single playable file: manifest
//! fetch, representation selection, two concurrent stream downloads into
//! temporary files, external combine, then thumbnail acquisition. The job
//! owns the cancellation scope and guarantees that a failed or cancelled
//! job leaves no files behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use dash::{Manifest, MediaType};

use crate::client::create_client;
use crate::combine::{CombineInputs, Combiner, MediaTags};
use crate::config::EngineConfig;
use crate::error::GrabError;
use crate::fetch::{ByteCounters, HttpSegmentSource, SegmentSource, download_stream};
use crate::progress::{ProgressSink, SegmentProgress, extrapolate_total};
use crate::thumbnail;

/// One matched show as delivered by a provider: identity, destination and
/// the stream manifest to acquire, plus the descriptive bits written into
/// container tags and sidecar records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowDescriptor {
    pub id: String,
    pub title: String,
    pub manifest_url: String,
    pub output: PathBuf,

    #[serde(default)]
    pub synopsis: Option<String>,
    #[serde(default)]
    pub show_name: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub episode_image: Option<String>,
    #[serde(default)]
    pub show_image: Option<String>,
}

impl ShowDescriptor {
    pub fn tags(&self) -> MediaTags {
        MediaTags {
            title: self.title.clone(),
            synopsis: self.synopsis.clone(),
            show: self.show_name.clone(),
            channel: self.channel.clone(),
        }
    }
}

/// Result of a completed job.
#[derive(Debug)]
pub struct JobOutcome {
    pub output: PathBuf,
    pub bytes_downloaded: u64,
}

/// The acquisition engine: one HTTP client plus the combiner, shared by
/// every job of a scheduling pass.
pub struct Engine {
    client: Client,
    source: Arc<dyn SegmentSource>,
    combiner: Combiner,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, GrabError> {
        let client = create_client(&config.fetch)?;
        let source = Arc::new(HttpSegmentSource::new(client.clone()));
        let combiner = Combiner::new(&config);
        Ok(Self {
            client,
            source,
            combiner,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Run one acquisition job end to end: fetch and parse the manifest,
    /// then hand over to [`Engine::run_job_with`].
    pub async fn run_job(
        &self,
        show: &ShowDescriptor,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, GrabError> {
        debug!(job = %show.id, url = %show.manifest_url, "Fetching manifest");

        let response = self
            .client
            .get(&show.manifest_url)
            .send()
            .await
            .map_err(|e| GrabError::manifest(&show.manifest_url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GrabError::manifest(
                &show.manifest_url,
                format!("HTTP {status}"),
            ));
        }

        // Resolve segment URIs against the post-redirect manifest URL.
        let manifest_url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| GrabError::manifest(&show.manifest_url, e))?;
        let manifest =
            dash::parse(&body).map_err(|e| GrabError::manifest(&show.manifest_url, e))?;

        self.run_job_with(show, &manifest, &manifest_url, self.source.clone(), sink, cancel)
            .await
    }

    /// Run a job against an already fetched manifest with an explicit
    /// segment source. Nothing has been written to disk at entry, so
    /// selection failures need no cleanup; from the moment downloading
    /// starts, any failure or cancellation removes every file this job
    /// created.
    pub async fn run_job_with(
        &self,
        show: &ShowDescriptor,
        manifest: &Manifest,
        manifest_url: &Url,
        source: Arc<dyn SegmentSource>,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, GrabError> {
        let period = manifest
            .periods
            .first()
            .ok_or_else(|| GrabError::manifest(manifest_url.as_str(), "manifest has no period"))?;

        let (video_set, video_rep) = select(period, MediaType::Video, manifest_url)?;
        let (audio_set, audio_rep) = select(period, MediaType::Audio, manifest_url)?;
        debug!(
            job = %show.id,
            video = video_rep.id.as_deref().unwrap_or("?"),
            video_bandwidth = video_rep.bandwidth,
            audio = audio_rep.id.as_deref().unwrap_or("?"),
            audio_bandwidth = audio_rep.bandwidth,
            "Representations selected"
        );

        // Child scope: internal failures cancel it to stop the sibling
        // stream without cancelling the caller's token.
        let scope = cancel.child_token();

        let video_segments = dash::segments_for(
            manifest,
            period,
            video_set,
            video_rep,
            manifest_url,
            scope.clone(),
        )?;
        let audio_segments = dash::segments_for(
            manifest,
            period,
            audio_set,
            audio_rep,
            manifest_url,
            scope.clone(),
        )?;

        if let Some(parent) = show.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let video_tmp = stream_temp_path(&show.output, "video");
        let audio_tmp = stream_temp_path(&show.output, "audio");

        let progress = SegmentProgress::new(sink.clone());
        let duration = period
            .duration()
            .or_else(|| manifest.presentation_duration());
        match duration {
            Some(total) => {
                let bits = (video_rep.bandwidth + audio_rep.bandwidth) as f64 * total.as_secs_f64();
                progress.init((bits / 8.0) as u64);
            }
            None => progress.init(0),
        }

        let tokens = Semaphore::new(self.config.transfer_tokens);
        let counters = ByteCounters::default();

        info!(job = %show.id, output = %show.output.display(), "Downloading streams");
        let (video_result, audio_result) = tokio::join!(
            download_stream(
                MediaType::Video,
                video_segments,
                &video_tmp,
                source.as_ref(),
                &tokens,
                &scope,
                &counters,
                &progress,
            ),
            download_stream(
                MediaType::Audio,
                audio_segments,
                &audio_tmp,
                source.as_ref(),
                &tokens,
                &scope,
                &counters,
                &progress,
            ),
        );

        if let Err(e) = merge_stream_results(video_result, audio_result) {
            self.cleanup(show, &[&video_tmp, &audio_tmp]).await;
            return Err(e);
        }

        debug!(job = %show.id, "Combining streams");
        let inputs = CombineInputs::Streams {
            video: video_tmp.clone(),
            audio: audio_tmp.clone(),
        };
        if let Err(e) = self
            .combiner
            .run(&inputs, &show.tags(), &show.output, sink.clone(), &scope)
            .await
        {
            self.cleanup(show, &[&video_tmp, &audio_tmp]).await;
            return Err(e);
        }

        remove_quietly(&video_tmp).await;
        remove_quietly(&audio_tmp).await;

        info!(
            job = %show.id,
            output = %show.output.display(),
            bytes = counters.total(),
            "Job done"
        );

        thumbnail::acquire(&self.client, show).await;

        Ok(JobOutcome {
            output: show.output.clone(),
            bytes_downloaded: counters.total(),
        })
    }

    /// Acquire a show whose URL points directly at a muxed stream instead
    /// of a manifest: one bounded download, then a direct remux into the
    /// final container.
    pub async fn run_direct_job(
        &self,
        show: &ShowDescriptor,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, GrabError> {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let scope = cancel.child_token();

        if let Some(parent) = show.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = stream_temp_path(&show.output, "direct");

        info!(job = %show.id, url = %show.manifest_url, "Downloading direct stream");
        let download = async {
            let response = self.client.get(&show.manifest_url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(GrabError::HttpStatus {
                    status,
                    url: show.manifest_url.clone(),
                });
            }

            let total = response.content_length();
            sink.init(total.unwrap_or(0));

            let mut file = tokio::fs::File::create(&tmp).await?;
            let mut stream = response.bytes_stream();
            let mut done = 0u64;

            loop {
                let chunk = tokio::select! {
                    _ = scope.cancelled() => return Err(GrabError::Cancelled),
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let chunk =
                    chunk.map_err(|e| GrabError::segment_fetch(&show.manifest_url, e))?;
                file.write_all(&chunk).await?;
                done += chunk.len() as u64;
                let estimate = match total {
                    Some(t) => t.max(done),
                    None => extrapolate_total(done, None),
                };
                sink.update(done, estimate);
            }
            file.flush().await?;
            Ok(done)
        };

        let done = match download.await {
            Ok(done) => done,
            Err(e) => {
                self.cleanup(show, &[&tmp]).await;
                return Err(e);
            }
        };

        let inputs = CombineInputs::Direct { input: tmp.clone() };
        if let Err(e) = self
            .combiner
            .run(&inputs, &show.tags(), &show.output, sink.clone(), &scope)
            .await
        {
            self.cleanup(show, &[&tmp]).await;
            return Err(e);
        }
        remove_quietly(&tmp).await;

        info!(job = %show.id, output = %show.output.display(), bytes = done, "Job done");
        thumbnail::acquire(&self.client, show).await;

        Ok(JobOutcome {
            output: show.output.clone(),
            bytes_downloaded: done,
        })
    }

    /// Delete every temporary and partial output file this job created.
    /// Runs on both failure and cancellation; success removes the
    /// temporaries inline and keeps the output.
    async fn cleanup(&self, show: &ShowDescriptor, temps: &[&Path]) {
        for path in temps
            .iter()
            .copied()
            .chain(std::iter::once(show.output.as_path()))
        {
            if path.exists() {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => info!(path = %path.display(), "Removed partial file"),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to remove partial file")
                    }
                }
            }
        }
    }
}

fn select<'a>(
    period: &'a dash::Period,
    media: MediaType,
    manifest_url: &Url,
) -> Result<(&'a dash::AdaptationSet, &'a dash::Representation), GrabError> {
    let missing = || GrabError::MissingStream {
        media,
        url: manifest_url.to_string(),
    };
    let set = period.adaptation_set(media).ok_or_else(missing)?;
    let rep = set.best_representation().ok_or_else(missing)?;
    Ok((set, rep))
}

/// Keep the first real failure; a `Cancelled` on one stream is only the
/// echo of the sibling's error or of an external cancellation.
fn merge_stream_results(
    video: Result<u64, GrabError>,
    audio: Result<u64, GrabError>,
) -> Result<(), GrabError> {
    match (video, audio) {
        (Ok(_), Ok(_)) => Ok(()),
        (Err(e), _) if !e.is_cancelled() => Err(e),
        (_, Err(e)) if !e.is_cancelled() => Err(e),
        _ => Err(GrabError::Cancelled),
    }
}

/// Temporary per-stream file colocated with the final output:
/// `show.mp4` -> `show.mp4.video.part`.
fn stream_temp_path(output: &Path, stream: &str) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{stream}.part"));
    output.with_file_name(name)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
    }
}
