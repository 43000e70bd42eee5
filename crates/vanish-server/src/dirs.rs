use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Directory holding `vanish.db` and `vanish.key`, created on first use.
///
/// A configured path (`ServerConfig::data_dir`, i.e. `VANISH_DATA_DIR`)
/// wins over the platform data directory (`~/.local/share/vanish` on Linux).
pub fn data_dir(configured: Option<&Path>) -> Result<PathBuf> {
    let dir = match configured {
        Some(dir) => dir.to_path_buf(),
        None => ProjectDirs::from("", "", "vanish")
            .map(|p| p.data_dir().to_path_buf())
            .context("no platform data directory; set VANISH_DATA_DIR")?,
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}
