//! Job scheduling and deduplication.
//!
//! Iterates each provider's matched shows, skips what this run has already
//! seen or what already exists on disk (exactly or under a re-numbered
//! name), and submits the remainder to a bounded worker pool. One show's
//! failure never aborts the pass; provider enumeration failures skip that
//! provider only.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GrabError;
use crate::job::{Engine, JobOutcome, ShowDescriptor};
use crate::progress::ProgressSink;

/// Resolves the shows a provider currently offers for acquisition.
#[async_trait]
pub trait ShowProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn matched_shows(&self) -> Result<Vec<ShowDescriptor>, GrabError>;
}

/// Invoked once per completed job to persist a metadata record next to the
/// output. Failures are logged; they do not fail the job.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn write_record(&self, show: &ShowDescriptor) -> Result<(), GrabError>;
}

/// Metadata sink that records nothing.
pub struct NullMetadataSink;

#[async_trait]
impl MetadataSink for NullMetadataSink {
    async fn write_record(&self, _show: &ShowDescriptor) -> Result<(), GrabError> {
        Ok(())
    }
}

/// Produces the progress sink attached to each submitted job.
pub type ProgressSinkFactory = dyn Fn(&ShowDescriptor) -> Arc<dyn ProgressSink> + Send + Sync;

/// Tally of one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct Scheduler {
    engine: Arc<Engine>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelling every job submitted by this scheduler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// One scheduling pass: enumerate, dedup, submit, join.
    ///
    /// The worker pool bounds concurrently running jobs; it is independent
    /// of each job's internal transfer-token pool. The dedup ledger lives
    /// for this pass only, so an unfinished show is naturally retried on
    /// the next pass.
    pub async fn run_pass(
        &self,
        providers: &[Arc<dyn ShowProvider>],
        metadata: Arc<dyn MetadataSink>,
        sinks: &ProgressSinkFactory,
    ) -> PassSummary {
        let mut summary = PassSummary::default();
        let mut ledger: HashSet<String> = HashSet::new();
        let workers = Arc::new(Semaphore::new(self.engine.config().job_workers.max(1)));
        let mut jobs: JoinSet<Result<JobOutcome, GrabError>> = JoinSet::new();

        for provider in providers {
            let shows = match provider.matched_shows().await {
                Ok(shows) => shows,
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Provider enumeration failed, skipping");
                    continue;
                }
            };
            info!(
                provider = provider.name(),
                shows = shows.len(),
                "Provider resolved"
            );

            for show in shows {
                // The ledger is consulted before any filesystem probe.
                if !ledger.insert(show.id.clone()) {
                    debug!(job = %show.id, "Already handled this run");
                    summary.skipped += 1;
                    continue;
                }

                if show.output.exists() {
                    debug!(job = %show.id, output = %show.output.display(), "Output already exists");
                    summary.skipped += 1;
                    continue;
                }

                match renumbered_existing(&show.output) {
                    Ok(Some(existing)) => {
                        info!(
                            job = %show.id,
                            existing = %existing.display(),
                            "A re-numbered release already exists"
                        );
                        summary.skipped += 1;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(job = %show.id, error = %e, "Destination probe failed, submitting anyway");
                    }
                }

                summary.submitted += 1;
                let engine = self.engine.clone();
                let workers = workers.clone();
                let metadata = metadata.clone();
                let sink = sinks(&show);
                let cancel = self.cancel.clone();

                jobs.spawn(async move {
                    let _permit = workers
                        .acquire_owned()
                        .await
                        .map_err(|_| GrabError::Cancelled)?;

                    let outcome = engine.run_job(&show, sink, &cancel).await;
                    match &outcome {
                        Ok(done) => {
                            info!(job = %show.id, bytes = done.bytes_downloaded, "Job completed");
                            if let Err(e) = metadata.write_record(&show).await {
                                warn!(job = %show.id, error = %e, "Metadata record failed");
                            }
                        }
                        Err(e) if e.is_cancelled() => {
                            info!(job = %show.id, "Job cancelled");
                        }
                        Err(e) => {
                            warn!(job = %show.id, error = %e, "Job failed");
                        }
                    }
                    outcome
                });
            }
        }

        // Join every submitted job before returning; dropping the JoinSet
        // afterwards shuts the pool down.
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(Ok(_)) => summary.completed += 1,
                Ok(Err(_)) => summary.failed += 1,
                Err(e) => {
                    warn!(error = %e, "Job task aborted");
                    summary.failed += 1;
                }
            }
        }

        info!(
            submitted = summary.submitted,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Scheduling pass finished"
        );
        summary
    }
}

static SEASON_EPISODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[Ss]\d{1,3}[Ee]\d{1,3}").expect("valid regex"));

/// Pattern matching the target filename with its season/episode numbering
/// wildcarded, to tolerate mis-numbered re-releases. `None` when the name
/// carries no recognizable numbering.
fn season_episode_pattern(file_name: &str) -> Option<Regex> {
    let token = SEASON_EPISODE.find(file_name)?;
    let pattern = format!(
        "^{}[Ss]\\d+[Ee]\\d+{}$",
        regex::escape(&file_name[..token.start()]),
        regex::escape(&file_name[token.end()..])
    );
    Regex::new(&pattern).ok()
}

/// Scan the destination directory for a file matching the wildcarded name.
fn renumbered_existing(output: &Path) -> std::io::Result<Option<PathBuf>> {
    let Some(name) = output.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let Some(pattern) = season_episode_pattern(name) else {
        return Ok(None);
    };
    let Some(dir) = output.parent() else {
        return Ok(None);
    };
    if !dir.is_dir() {
        return Ok(None);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(candidate) = entry.file_name().to_str()
            && pattern.is_match(candidate)
        {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::progress::NullSink;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn pattern_wildcards_season_and_episode() {
        let pattern = season_episode_pattern("The.Show.S01E02.mp4").unwrap();
        assert!(pattern.is_match("The.Show.S01E02.mp4"));
        assert!(pattern.is_match("The.Show.S05E09.mp4"));
        assert!(pattern.is_match("The.Show.s2e10.mp4"));
        assert!(!pattern.is_match("Other.Show.S01E02.mp4"));
        assert!(!pattern.is_match("The.Show.S01E02.mkv"));

        assert!(season_episode_pattern("Movie.mp4").is_none());
    }

    #[test]
    fn renumbered_release_is_found() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Show.S01E03.mp4"), b"x").unwrap();

        let wanted = dir.path().join("Show.S02E05.mp4");
        let found = renumbered_existing(&wanted).unwrap();
        assert_eq!(found, Some(dir.path().join("Show.S01E03.mp4")));

        let other = dir.path().join("Different.S02E05.mp4");
        assert_eq!(renumbered_existing(&other).unwrap(), None);
    }

    struct FixedProvider {
        shows: Vec<ShowDescriptor>,
    }

    #[async_trait]
    impl ShowProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn matched_shows(&self) -> Result<Vec<ShowDescriptor>, GrabError> {
            Ok(self.shows.clone())
        }
    }

    struct BrokenProvider;

    #[async_trait]
    impl ShowProvider for BrokenProvider {
        fn name(&self) -> &str {
            "broken"
        }

        async fn matched_shows(&self) -> Result<Vec<ShowDescriptor>, GrabError> {
            Err(GrabError::scheduling("broken", "catalog unreachable"))
        }
    }

    fn show(id: &str, output: PathBuf) -> ShowDescriptor {
        ShowDescriptor {
            id: id.to_string(),
            title: id.to_string(),
            manifest_url: "http://unreachable.invalid/manifest.mpd".to_string(),
            output,
            synopsis: None,
            show_name: None,
            channel: None,
            episode_image: None,
            show_image: None,
        }
    }

    fn null_sinks() -> Box<dyn Fn(&ShowDescriptor) -> Arc<dyn ProgressSink> + Send + Sync> {
        Box::new(|_| Arc::new(NullSink))
    }

    #[tokio::test]
    async fn existing_and_duplicate_shows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let existing = dir.path().join("A.S01E01.mp4");
        fs::write(&existing, b"done").unwrap();
        fs::write(dir.path().join("B.S01E01.mp4"), b"done").unwrap();

        let provider = Arc::new(FixedProvider {
            shows: vec![
                show("a", existing.clone()),
                // Same identity again: ledger skip, before any fs probe.
                show("a", existing.clone()),
                // Different numbering of an existing release: fuzzy skip.
                show("b", dir.path().join("B.S04E09.mp4")),
            ],
        }) as Arc<dyn ShowProvider>;

        let engine = Arc::new(Engine::new(EngineConfig::default()).unwrap());
        let scheduler = Scheduler::new(engine);
        let summary = scheduler
            .run_pass(&[provider], Arc::new(NullMetadataSink), &null_sinks())
            .await;

        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn second_pass_over_unchanged_directory_submits_nothing() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("C.S01E01.mp4");
        fs::write(&out, b"done").unwrap();

        let provider =
            Arc::new(FixedProvider { shows: vec![show("c", out)] }) as Arc<dyn ShowProvider>;
        let engine = Arc::new(Engine::new(EngineConfig::default()).unwrap());
        let scheduler = Scheduler::new(engine);

        let first = scheduler
            .run_pass(
                &[provider.clone()],
                Arc::new(NullMetadataSink),
                &null_sinks(),
            )
            .await;
        let second = scheduler
            .run_pass(&[provider], Arc::new(NullMetadataSink), &null_sinks())
            .await;

        assert_eq!(first.submitted, 0);
        assert_eq!(second.submitted, 0);
    }

    #[tokio::test]
    async fn broken_provider_does_not_abort_the_pass() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("D.S01E01.mp4");
        fs::write(&out, b"done").unwrap();

        let providers: Vec<Arc<dyn ShowProvider>> = vec![
            Arc::new(BrokenProvider),
            Arc::new(FixedProvider { shows: vec![show("d", out)] }),
        ];

        let engine = Arc::new(Engine::new(EngineConfig::default()).unwrap());
        let scheduler = Scheduler::new(engine);
        let summary = scheduler
            .run_pass(&providers, Arc::new(NullMetadataSink), &null_sinks())
            .await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.submitted, 0);
    }
}
