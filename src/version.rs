//! 認識エンジンのバージョンタグと結果ファイル名

use crate::error::{MeterRegressError, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::process::Command;

pub const UNKNOWN_VERSION: &str = "unknown";

fn git(repo: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("--git-dir")
        .arg(repo.join(".git"))
        .arg("--work-tree")
        .arg(repo)
        .args(args)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// エンジンリポジトリのバージョン
///
/// 最新タグ（先頭の `v` は除く）→ `dev-<短縮ハッシュ>` → `unknown` の順に試す。
pub fn git_version(repo: Option<&Path>) -> String {
    let Some(repo) = repo else {
        return UNKNOWN_VERSION.to_string();
    };

    if let Some(tag) = git(repo, &["describe", "--tags", "--abbrev=0"]) {
        return tag.trim_start_matches(['v', 'V']).to_string();
    }
    if let Some(hash) = git(repo, &["rev-parse", "--short", "HEAD"]) {
        return format!("dev-{}", hash);
    }

    tracing::debug!("gitバージョンを取得できません: {}", repo.display());
    UNKNOWN_VERSION.to_string()
}

/// `<stem>_v<version>_<YYYYmmdd_HHMMSS>.<ext>`
pub fn versioned_path(path: &Path, version: &str, at: DateTime<Local>) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut name = format!("{}_v{}_{}", stem, version, at.format("%Y%m%d_%H%M%S"));
    if let Some(ext) = path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    path.with_file_name(name)
}

/// 結果ファイルをバージョン付きの名前に変更
pub fn rename_results(from: &Path, to: &Path) -> Result<PathBuf> {
    if !from.exists() {
        return Err(MeterRegressError::FileNotFound(from.display().to_string()));
    }
    std::fs::rename(from, to)?;
    Ok(to.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_versioned_path() {
        let at = Local.with_ymd_and_hms(2026, 3, 7, 9, 5, 1).unwrap();
        let path = versioned_path(Path::new("/data/results.xlsx"), "1.4.2", at);
        assert_eq!(path, PathBuf::from("/data/results_v1.4.2_20260307_090501.xlsx"));
    }

    #[test]
    fn test_versioned_path_without_extension() {
        let at = Local.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let path = versioned_path(Path::new("results"), "dev-abc123", at);
        assert_eq!(path, PathBuf::from("results_vdev-abc123_20260101_000000"));
    }

    #[test]
    fn test_git_version_fallbacks() {
        assert_eq!(git_version(None), UNKNOWN_VERSION);
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(git_version(Some(dir.path())), UNKNOWN_VERSION);
    }

    #[test]
    fn test_rename_results() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.xlsx");
        std::fs::write(&from, b"x").unwrap();
        let to = dir.path().join("a_v1_20260101_000000.xlsx");

        assert_eq!(rename_results(&from, &to).unwrap(), to);
        assert!(to.exists());
        assert!(!from.exists());
        assert!(rename_results(&from, &to).is_err());
    }
}
