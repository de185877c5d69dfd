use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// HTTP client options shared by manifest, segment and thumbnail requests.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Overall timeout for a single HTTP request.
    pub timeout: Duration,

    /// Connection timeout (time to establish the initial connection).
    pub connect_timeout: Duration,

    /// Whether to follow redirects.
    pub follow_redirects: bool,

    /// User agent string.
    pub user_agent: String,

    /// Custom HTTP headers for requests.
    pub headers: HeaderMap,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: FetchConfig::default_headers(),
        }
    }
}

impl FetchConfig {
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        headers
    }
}

/// Engine-wide configuration for acquisition jobs and the scheduler.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// HTTP client options.
    pub fetch: FetchConfig,

    /// Capacity of the per-job transfer token pool. Bounds in-flight
    /// segment fetches across a job's video and audio streams combined.
    pub transfer_tokens: usize,

    /// Number of acquisition jobs the scheduler runs concurrently. This is
    /// the outer bound, independent of `transfer_tokens`.
    pub job_workers: usize,

    /// Idle deadline for the external combiner: if its progress stream is
    /// silent for this long, the process is killed and the job fails.
    pub stall_timeout: Duration,

    /// Explicit remuxer binary path. Falls back to `FFMPEG_PATH`, then
    /// `ffmpeg`.
    pub ffmpeg_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            transfer_tokens: 2,
            job_workers: 2,
            stall_timeout: Duration::from_secs(60),
            ffmpeg_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behaviour() {
        let config = EngineConfig::default();
        assert_eq!(config.transfer_tokens, 2);
        assert_eq!(config.stall_timeout, Duration::from_secs(60));
        assert!(config.fetch.follow_redirects);
    }
}
