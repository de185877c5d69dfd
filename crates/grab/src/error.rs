use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum GrabError {
    #[error("job cancelled")]
    Cancelled,

    #[error("manifest error for `{url}`: {reason}")]
    Manifest { url: String, reason: String },

    #[error("manifest `{url}` offers no {media} stream")]
    MissingStream {
        media: dash::MediaType,
        url: String,
    },

    #[error("segment addressing error: {source}")]
    Addressing {
        #[from]
        source: dash::DashError,
    },

    #[error("segment fetch failed for `{url}`: {reason}")]
    SegmentFetch { url: String, reason: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("combiner failed: {reason}")]
    Combine { reason: String },

    #[error("combiner produced no output for {seconds}s; last line: {last_line}")]
    CombineStall { seconds: u64, last_line: String },

    #[error("cannot enumerate shows for provider `{provider}`: {reason}")]
    Scheduling { provider: String, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl GrabError {
    pub fn manifest(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Manifest {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn segment_fetch(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::SegmentFetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn combine(reason: impl ToString) -> Self {
        Self::Combine {
            reason: reason.to_string(),
        }
    }

    pub fn scheduling(provider: impl Into<String>, reason: impl ToString) -> Self {
        Self::Scheduling {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the failure was an external cancellation request rather
    /// than an internal error. Cleanup is identical either way; only the
    /// reported terminal state differs.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
