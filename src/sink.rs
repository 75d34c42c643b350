use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::playlist::ChannelRecord;

/// Writes the annotated channel list as a JSON array.
///
/// The file is written next to `path` first and renamed over it, so readers never see a partial file.
///
/// # Errors
/// Errors when the directory cannot be created or the file cannot be written / renamed
#[instrument(skip(channels), fields(channels = channels.len()))]
pub async fn write_channels(path: &Path, channels: &[ChannelRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Creating output directory {}", parent.display()))?;
    }

    let json = serde_json::to_vec_pretty(channels).context("Serializing channel verdicts")?;

    let temp_path = temp_path(path);
    tokio::fs::write(&temp_path, json)
        .await
        .with_context(|| format!("Writing {}", temp_path.display()))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("Moving verdicts into {}", path.display()))?;

    debug!("Wrote {}", path.display());
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| OsString::from("channels.json"), ToOwned::to_owned);
    name.push(".tmp");
    path.with_file_name(name)
}
