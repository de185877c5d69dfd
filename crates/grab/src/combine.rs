//! Stream combining via the external remuxer.
//!
//! Merges independently downloaded video/audio elementary streams (or a
//! single direct stream) into the final container with copy codecs and
//! descriptive tags. The remuxer's stderr is scraped through the remux
//! progress parser; a stall watchdog converts a silent hang into a
//! reported failure by killing the process.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::GrabError;
use crate::progress::{ProgressSink, RemuxProgress};

/// Inputs handed to the remuxer.
#[derive(Debug, Clone)]
pub enum CombineInputs {
    /// Separately downloaded elementary streams.
    Streams { video: PathBuf, audio: PathBuf },
    /// One already-muxed stream that only needs repackaging.
    Direct { input: PathBuf },
}

impl CombineInputs {
    fn paths(&self) -> Vec<&Path> {
        match self {
            CombineInputs::Streams { video, audio } => vec![video, audio],
            CombineInputs::Direct { input } => vec![input],
        }
    }
}

/// Descriptive tags written into the output container.
#[derive(Debug, Clone, Default)]
pub struct MediaTags {
    pub title: String,
    pub synopsis: Option<String>,
    pub show: Option<String>,
    pub channel: Option<String>,
}

impl MediaTags {
    fn as_metadata_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut tag = |key: &str, value: &str| {
            args.push("-metadata".to_string());
            args.push(format!("{key}={value}"));
        };

        if !self.title.is_empty() {
            tag("title", &self.title);
        }
        if let Some(synopsis) = &self.synopsis {
            tag("description", synopsis);
        }
        if let Some(show) = &self.show {
            tag("show", show);
        }
        if let Some(channel) = &self.channel {
            tag("network", channel);
        }
        args
    }
}

/// Drives the external remuxing process for one job.
pub struct Combiner {
    ffmpeg_path: String,
    stall_timeout: Duration,
}

impl Combiner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ffmpeg_path: process_utils::resolve_ffmpeg(config.ffmpeg_path.as_deref()),
            stall_timeout: config.stall_timeout,
        }
    }

    /// Create with an explicit binary and stall deadline.
    pub fn with_binary(path: impl Into<String>, stall_timeout: Duration) -> Self {
        Self {
            ffmpeg_path: path.into(),
            stall_timeout,
        }
    }

    fn build_args(inputs: &CombineInputs, tags: &MediaTags, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "info".to_string(),
        ];

        match inputs {
            CombineInputs::Streams { video, audio } => {
                args.extend([
                    "-i".to_string(),
                    video.to_string_lossy().to_string(),
                    "-i".to_string(),
                    audio.to_string_lossy().to_string(),
                    "-map".to_string(),
                    "0:v:0".to_string(),
                    "-map".to_string(),
                    "1:a:0".to_string(),
                    "-c".to_string(),
                    "copy".to_string(),
                ]);
            }
            CombineInputs::Direct { input } => {
                args.extend([
                    "-i".to_string(),
                    input.to_string_lossy().to_string(),
                    "-c".to_string(),
                    "copy".to_string(),
                ]);
            }
        }

        args.extend(tags.as_metadata_args());
        args.push(output.to_string_lossy().to_string());
        args
    }

    /// Run the remuxer to completion. Cancellation and the stall watchdog
    /// both terminate the process; a non-zero exit is a hard failure that
    /// carries the last stderr line as the diagnostic.
    pub async fn run(
        &self,
        inputs: &CombineInputs,
        tags: &MediaTags,
        output: &Path,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<(), GrabError> {
        let mut estimated = 0u64;
        for path in inputs.paths() {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                estimated += meta.len();
            }
        }
        sink.init(estimated);

        let args = Self::build_args(inputs, tags, output);
        debug!(binary = %self.ffmpeg_path, ?args, "Invoking combiner");

        let mut cmd = process_utils::tokio_command(&self.ffmpeg_path);
        cmd.args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            GrabError::combine(format!("failed to spawn `{}`: {e}", self.ffmpeg_path))
        })?;

        let mut parser = RemuxProgress::new(sink);
        let status = self.supervise(child, &mut parser, cancel).await?;

        if !status.success() {
            return Err(GrabError::combine(format!(
                "exit code {}: {}",
                status.code().unwrap_or(-1),
                parser.last_line()
            )));
        }

        info!(output = %output.display(), "Combine complete");
        Ok(())
    }

    /// Pump stderr lines into the parser until the process closes its pipe,
    /// the watchdog fires, or the scope is cancelled.
    async fn supervise(
        &self,
        mut child: Child,
        parser: &mut RemuxProgress,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus, GrabError> {
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GrabError::combine("combiner stderr was not captured"))?;
        let mut lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill combiner after cancellation");
                    }
                    return Err(GrabError::Cancelled);
                }
                next = tokio::time::timeout(self.stall_timeout, lines.next_line()) => match next {
                    Err(_) => {
                        warn!(last_line = parser.last_line(), "Combiner stalled, killing process");
                        if let Err(e) = child.kill().await {
                            warn!(error = %e, "Failed to kill stalled combiner");
                        }
                        return Err(GrabError::CombineStall {
                            seconds: self.stall_timeout.as_secs(),
                            last_line: parser.last_line().to_string(),
                        });
                    }
                    Ok(Ok(Some(line))) => parser.observe_line(&line),
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        debug!(error = %e, "Combiner stderr closed with a read error");
                        break;
                    }
                }
            }
        }

        child.wait().await.map_err(GrabError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullSink;

    fn tags() -> MediaTags {
        MediaTags {
            title: "Episode One".to_string(),
            synopsis: Some("A beginning.".to_string()),
            show: Some("The Show".to_string()),
            channel: Some("TV1".to_string()),
        }
    }

    #[test]
    fn build_args_for_two_streams() {
        let inputs = CombineInputs::Streams {
            video: PathBuf::from("/tmp/out.mp4.video.part"),
            audio: PathBuf::from("/tmp/out.mp4.audio.part"),
        };
        let args = Combiner::build_args(&inputs, &tags(), Path::new("/tmp/out.mp4"));

        assert_eq!(args[0], "-y");
        assert!(args.contains(&"/tmp/out.mp4.video.part".to_string()));
        assert!(args.contains(&"/tmp/out.mp4.audio.part".to_string()));
        assert!(args.contains(&"0:v:0".to_string()));
        assert!(args.contains(&"1:a:0".to_string()));
        assert!(args.contains(&"copy".to_string()));
        assert!(args.contains(&"title=Episode One".to_string()));
        assert!(args.contains(&"description=A beginning.".to_string()));
        assert!(args.contains(&"show=The Show".to_string()));
        assert!(args.contains(&"network=TV1".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/out.mp4");
    }

    #[test]
    fn build_args_for_direct_input() {
        let inputs = CombineInputs::Direct {
            input: PathBuf::from("/tmp/out.mp4.direct.part"),
        };
        let args = Combiner::build_args(&inputs, &MediaTags::default(), Path::new("/tmp/out.mp4"));

        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 1);
        assert!(!args.contains(&"-map".to_string()));
        assert!(!args.contains(&"-metadata".to_string()));
    }

    #[cfg(unix)]
    fn spawn_shell(script: &str) -> Child {
        let mut cmd = process_utils::tokio_command("sh");
        cmd.args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd.spawn().unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn watchdog_kills_a_silent_process() {
        let combiner = Combiner::with_binary("unused", Duration::from_millis(100));
        let child = spawn_shell(r#"echo "Duration: 00:01:00.00" >&2; sleep 5"#);
        let mut parser = RemuxProgress::new(Arc::new(NullSink));

        let err = combiner
            .supervise(child, &mut parser, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            GrabError::CombineStall { last_line, .. } => {
                assert_eq!(last_line, "Duration: 00:01:00.00");
            }
            other => panic!("expected stall, got {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn watchdog_rearms_on_every_line() {
        let combiner = Combiner::with_binary("unused", Duration::from_millis(300));
        // Three lines 100ms apart: each is inside the deadline even though
        // the total run exceeds it.
        let child =
            spawn_shell(r#"for i in 1 2 3; do echo "line $i" >&2; sleep 0.1; done; exit 0"#);
        let mut parser = RemuxProgress::new(Arc::new(NullSink));

        let status = combiner
            .supervise(child, &mut parser, &CancellationToken::new())
            .await
            .unwrap();
        assert!(status.success());
        assert_eq!(parser.last_line(), "line 3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_terminates_the_process() {
        let combiner = Combiner::with_binary("unused", Duration::from_secs(5));
        let child = spawn_shell("sleep 5");
        let mut parser = RemuxProgress::new(Arc::new(NullSink));

        let cancel = CancellationToken::new();
        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let err = combiner
            .supervise(child, &mut parser, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        trigger.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_the_last_line() {
        let combiner = Combiner::with_binary("unused", Duration::from_secs(5));
        let child = spawn_shell(r#"echo "boom: no such stream" >&2; exit 3"#);
        let mut parser = RemuxProgress::new(Arc::new(NullSink));

        let status = combiner
            .supervise(child, &mut parser, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(parser.last_line(), "boom: no such stream");
    }
}
