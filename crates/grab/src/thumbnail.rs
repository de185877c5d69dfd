//! Thumbnail acquisition.
//!
//! Runs after a job reaches its terminal success state: the episode image
//! is fetched next to the output file, the show-level image once per
//! destination directory. Both are guarded by existence checks so re-runs
//! do not repeat the downloads, and failures are logged without affecting
//! the job outcome.

use std::path::Path;

use reqwest::Client;
use tracing::{debug, warn};

use crate::error::GrabError;
use crate::job::ShowDescriptor;

/// Image placed alongside every episode file.
const SHOW_IMAGE_NAME: &str = "folder.jpg";

pub async fn acquire(client: &Client, show: &ShowDescriptor) {
    if let Some(url) = &show.episode_image {
        let path = show.output.with_extension("jpg");
        if let Err(e) = download_image(client, url, &path).await {
            warn!(job = %show.id, url = %url, error = %e, "Episode thumbnail failed");
        }
    }

    if let Some(url) = &show.show_image
        && let Some(dir) = show.output.parent()
    {
        let path = dir.join(SHOW_IMAGE_NAME);
        if let Err(e) = download_image(client, url, &path).await {
            warn!(job = %show.id, url = %url, error = %e, "Show thumbnail failed");
        }
    }
}

async fn download_image(client: &Client, url: &str, path: &Path) -> Result<(), GrabError> {
    if path.exists() {
        debug!(path = %path.display(), "Thumbnail already present, skipping");
        return Ok(());
    }

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(GrabError::HttpStatus {
            status,
            url: url.to_string(),
        });
    }

    let body = response.bytes().await?;
    tokio::fs::write(path, &body).await?;
    debug!(path = %path.display(), bytes = body.len(), "Thumbnail saved");
    Ok(())
}
