//! Data-directory bootstrap: ensure the catalog destination directories
//! exist before the catalog manager tries to write into them.

use std::path::{Path, PathBuf};

/// Ensure `<data_dir>/geoip` and `<data_dir>/geosite` exist, falling back
/// to a temp directory if `data_dir` itself can't be created.
pub fn ensure_data_dirs(data_dir: &Path) -> PathBuf {
    let geoip = data_dir.join("geoip");
    let geosite = data_dir.join("geosite");
    match std::fs::create_dir_all(&geoip).and_then(|_| std::fs::create_dir_all(&geosite)) {
        Ok(()) => data_dir.to_path_buf(),
        Err(e) => {
            tracing::warn!(path = %data_dir.display(), error = %e, "falling back to temp data dir");
            let fallback = std::env::temp_dir().join("rule-bot-data");
            std::fs::create_dir_all(fallback.join("geoip")).ok();
            std::fs::create_dir_all(fallback.join("geosite")).ok();
            fallback
        }
    }
}
