#[derive(Debug, thiserror::Error)]
pub enum DashError {
    #[error("manifest is not valid XML: {source}")]
    Xml {
        #[from]
        source: quick_xml::DeError,
    },

    #[error("invalid duration `{input}`")]
    InvalidDuration { input: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("representation `{representation}` has no usable segment addressing: {reason}")]
    Addressing {
        representation: String,
        reason: String,
    },
}

impl DashError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn addressing(representation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Addressing {
            representation: representation.into(),
            reason: reason.into(),
        }
    }
}
