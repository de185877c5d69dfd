use reqwest::Client;
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::GrabError;

/// Create a reqwest Client with the provided configuration.
pub fn create_client(config: &FetchConfig) -> Result<Client, GrabError> {
    let mut builder = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }
    if !config.connect_timeout.is_zero() {
        builder = builder.connect_timeout(config.connect_timeout);
    }

    debug!(
        user_agent = %config.user_agent,
        follow_redirects = config.follow_redirects,
        "Building HTTP client"
    );

    builder.build().map_err(GrabError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_defaults() {
        assert!(create_client(&FetchConfig::default()).is_ok());
    }
}
