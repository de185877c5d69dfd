//! Catalog-file provider and sidecar metadata writer.
//!
//! The catalog is a JSON array of show descriptors, standing in for the
//! per-provider search collaborators: anything that can produce matched
//! shows with an identity, a destination and a manifest URL can drive the
//! scheduler.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use grab_engine::{GrabError, MetadataSink, ShowDescriptor, ShowProvider};

pub struct JsonCatalog {
    path: PathBuf,
    dest: Option<PathBuf>,
}

impl JsonCatalog {
    pub fn new(path: PathBuf, dest: Option<PathBuf>) -> Self {
        Self { path, dest }
    }
}

#[async_trait]
impl ShowProvider for JsonCatalog {
    fn name(&self) -> &str {
        "catalog"
    }

    async fn matched_shows(&self) -> Result<Vec<ShowDescriptor>, GrabError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| GrabError::scheduling("catalog", e))?;
        let mut shows: Vec<ShowDescriptor> =
            serde_json::from_slice(&bytes).map_err(|e| GrabError::scheduling("catalog", e))?;

        if let Some(dest) = &self.dest {
            for show in &mut shows {
                if show.output.is_relative() {
                    show.output = dest.join(&show.output);
                }
            }
        }

        debug!(path = %self.path.display(), shows = shows.len(), "Catalog loaded");
        Ok(shows)
    }
}

/// Writes a JSON record next to each completed output file.
pub struct JsonSidecarSink;

#[async_trait]
impl MetadataSink for JsonSidecarSink {
    async fn write_record(&self, show: &ShowDescriptor) -> Result<(), GrabError> {
        let mut path = show.output.clone().into_os_string();
        path.push(".info.json");

        let record =
            serde_json::to_vec_pretty(show).map_err(|e| GrabError::from(std::io::Error::other(e)))?;
        tokio::fs::write(&path, record).await?;
        debug!(path = %PathBuf::from(path).display(), "Metadata record written");
        Ok(())
    }
}
