use std::{fs, path::PathBuf};

use anyhow::{Context, Result};

use crate::config::DirectoryConfig;

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub logs_dir: PathBuf,
    pub data_dir: PathBuf,
    pub state_db_path: PathBuf,
    pub state_json_path: PathBuf,
    pub snapshot_path: PathBuf,
}

pub fn ensure_directories(cfg: &DirectoryConfig) -> Result<ResolvedPaths> {
    let logs_dir = ensure_dir(&cfg.logs_dir)?;
    let data_dir = ensure_dir(&cfg.data_dir)?;

    let check_file = data_dir.join(".write-test");
    fs::write(&check_file, b"ok")
        .with_context(|| format!("data directory {} is not writable", data_dir.display()))?;
    fs::remove_file(&check_file)?;

    Ok(ResolvedPaths {
        state_db_path: data_dir.join(&cfg.state_db_filename),
        state_json_path: data_dir.join(&cfg.state_json_filename),
        snapshot_path: data_dir.join(&cfg.snapshot_filename),
        logs_dir,
        data_dir,
    })
}

fn ensure_dir(path: &str) -> Result<PathBuf> {
    let dir = PathBuf::from(path);
    if !dir.exists() {
        fs::create_dir_all(&dir).with_context(|| format!("failed to create directory {path}"))?;
    }
    Ok(dir.canonicalize().unwrap_or(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_files_live_in_the_data_dir() {
        let root = tempfile::tempdir().unwrap();
        let cfg = DirectoryConfig {
            logs_dir: root.path().join("logs").display().to_string(),
            data_dir: root.path().join("data").display().to_string(),
            state_db_filename: "crawler_state.db".to_string(),
            state_json_filename: "scheduler_state.json".to_string(),
            snapshot_filename: "opportunities.json".to_string(),
        };
        let paths = ensure_directories(&cfg).unwrap();
        assert!(paths.logs_dir.is_dir());
        assert_eq!(paths.state_db_path, paths.data_dir.join("crawler_state.db"));
        assert_eq!(paths.snapshot_path.file_name().unwrap(), "opportunities.json");
    }
}
