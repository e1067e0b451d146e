use crate::error::{MeterRegressError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// ローカル実行を表すサーバー名
pub const LOCAL_SERVER: &str = "default";

/// APIキーを読む環境変数（サーバー設定で上書き可）
const DEFAULT_API_KEY_ENV: &str = "RECOGNITION_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// テスト画像フォルダ
    pub images_dir: Option<PathBuf>,
    /// 参照値Excel
    pub dataset_path: Option<PathBuf>,
    pub sheet_name: String,
    pub engine: EngineConfig,
    /// 使用する認識サーバー名（"default" はローカル実行）
    pub selected_server: String,
    pub servers: BTreeMap<String, ServerConfig>,
    /// 並列数（未指定ならCPU数×2、最大8）
    pub workers: Option<usize>,
    pub timeout_seconds: u64,
    pub poll_interval_seconds: u64,
    pub max_wait_seconds: u64,
    pub fallback_wait_seconds: u64,
    pub image_extensions: Vec<String>,
    /// 何件成功ごとに途中保存するか
    pub checkpoint_every: usize,
    pub history_path: Option<PathBuf>,
    /// バージョンタグを取得する認識エンジンのリポジトリ
    pub main_repo_path: Option<PathBuf>,
    /// 完了後に結果ファイル名へバージョンと時刻を付ける
    pub rename_results: bool,
}

/// ローカル認識エンジン
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: Option<PathBuf>,
    /// スクリプト実行用のインタプリタ（例: python3）
    pub interpreter: Option<String>,
}

/// リモート認識サーバー
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
}

/// 起動時に一度だけ決定する認識バックエンド
#[derive(Debug, Clone, PartialEq)]
pub enum BackendSelection {
    Local {
        program: PathBuf,
        interpreter: Option<String>,
        timeout: Duration,
    },
    Remote {
        name: String,
        base_url: String,
        api_key: String,
        poll_interval: Duration,
        max_wait: Duration,
        fallback_wait: Duration,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            images_dir: None,
            dataset_path: None,
            sheet_name: "Image Data".into(),
            engine: EngineConfig::default(),
            selected_server: LOCAL_SERVER.into(),
            servers: BTreeMap::new(),
            workers: None,
            timeout_seconds: 120,
            poll_interval_seconds: 5,
            max_wait_seconds: 300,
            fallback_wait_seconds: 10,
            image_extensions: ["jpg", "jpeg", "png", "bmp", "tiff", "tif"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            checkpoint_every: 5,
            history_path: None,
            main_repo_path: None,
            rename_results: true,
        }
    }
}

impl Config {
    /// 設定ファイル → 環境変数の順に読み込む
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| MeterRegressError::Config("ホームディレクトリが見つかりません".into()))?;
        Ok(home.join(".config").join("meter-regress"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// 環境変数で上書き
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FOLDER_TEST") {
            self.images_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("EXCEL_DATA") {
            self.dataset_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("PROGRAM_SCRIPT") {
            self.engine.program = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("PROGRAM_INTERPRETER") {
            self.engine.interpreter = Some(v);
        }
        if let Some(v) = lookup("SELECTED_SERVER") {
            self.selected_server = v;
        }
        if let Some(v) = lookup("MAIN_REPO_PATH") {
            self.main_repo_path = Some(PathBuf::from(v));
        }
        if let Some(n) = lookup("RECOGNITION_WORKERS").and_then(|v| v.parse().ok()) {
            self.workers = Some(n);
        }

        for server in self.servers.values_mut() {
            let env_name = server.api_key_env.as_deref().unwrap_or(DEFAULT_API_KEY_ENV);
            if let Some(key) = lookup(env_name) {
                server.api_key = Some(key);
            }
        }
    }

    pub fn is_local(&self) -> bool {
        self.selected_server == LOCAL_SERVER
    }

    /// 並列数（CPU数×2、上限8）
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            (cpus * 2).min(8)
        })
        .max(1)
    }

    pub fn history_path(&self) -> Result<PathBuf> {
        match &self.history_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("history.jsonl")),
        }
    }

    /// 認識バックエンドを決定
    pub fn backend(&self) -> Result<BackendSelection> {
        if self.is_local() {
            let program = self.engine.program.clone().ok_or_else(|| {
                MeterRegressError::Config("PROGRAM_SCRIPT が設定されていません".into())
            })?;
            return Ok(BackendSelection::Local {
                program,
                interpreter: self.engine.interpreter.clone(),
                timeout: Duration::from_secs(self.timeout_seconds),
            });
        }

        let server = self.servers.get(&self.selected_server).ok_or_else(|| {
            MeterRegressError::Config(format!("未定義のサーバー: {}", self.selected_server))
        })?;
        let api_key = server.api_key.clone().ok_or_else(|| {
            MeterRegressError::Config(format!(
                "サーバー {} のAPIキーが設定されていません",
                self.selected_server
            ))
        })?;

        Ok(BackendSelection::Remote {
            name: self.selected_server.clone(),
            base_url: server.base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            max_wait: Duration::from_secs(self.max_wait_seconds),
            fallback_wait: Duration::from_secs(self.fallback_wait_seconds),
        })
    }

    /// 実行前の環境チェック（問題をすべて列挙する）
    pub fn validate(&self) -> Result<()> {
        let mut required = vec![
            ("FOLDER_TEST", self.images_dir.as_ref()),
            ("EXCEL_DATA", self.dataset_path.as_ref()),
        ];
        if self.is_local() {
            required.push(("PROGRAM_SCRIPT", self.engine.program.as_ref()));
        }

        let mut errors: Vec<String> = required
            .into_iter()
            .filter_map(|(name, path)| match path {
                None => Some(format!("{} が設定されていません", name)),
                Some(p) if !p.exists() => {
                    Some(format!("パスが存在しません: {} = {}", name, p.display()))
                }
                Some(_) => None,
            })
            .collect();

        if !self.is_local() && !self.servers.contains_key(&self.selected_server) {
            errors.push(format!("未定義のサーバー: {}", self.selected_server));
        }

        if !errors.is_empty() {
            return Err(MeterRegressError::InvalidEnvironment(errors));
        }

        if let Some(dir) = &self.images_dir {
            let empty = std::fs::read_dir(dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty {
                tracing::warn!("画像フォルダが空です: {}", dir.display());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.timeout_seconds, 120);
        assert_eq!(config.checkpoint_every, 5);
        assert_eq!(config.sheet_name, "Image Data");
        assert!(config.is_local());
        assert!(config.image_extensions.contains(&"tif".to_string()));
    }

    #[test]
    fn test_apply_env_overrides() {
        let vars = env(&[
            ("FOLDER_TEST", "/data/images"),
            ("EXCEL_DATA", "/data/ref.xlsx"),
            ("PROGRAM_SCRIPT", "/opt/engine/run.py"),
            ("RECOGNITION_WORKERS", "3"),
        ]);
        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).cloned());

        assert_eq!(config.images_dir, Some(PathBuf::from("/data/images")));
        assert_eq!(config.dataset_path, Some(PathBuf::from("/data/ref.xlsx")));
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn test_backend_local() {
        let mut config = Config::default();
        assert!(config.backend().is_err());

        config.engine.program = Some(PathBuf::from("engine.py"));
        config.engine.interpreter = Some("python3".into());
        match config.backend().unwrap() {
            BackendSelection::Local { program, interpreter, timeout } => {
                assert_eq!(program, PathBuf::from("engine.py"));
                assert_eq!(interpreter.as_deref(), Some("python3"));
                assert_eq!(timeout, Duration::from_secs(120));
            }
            other => panic!("unexpected backend: {:?}", other),
        }
    }

    #[test]
    fn test_backend_remote_key_from_env() {
        let mut config = Config::default();
        config.selected_server = "staging".into();
        config.servers.insert(
            "staging".into(),
            ServerConfig {
                base_url: "https://ocr.example.com/api/".into(),
                api_key: None,
                api_key_env: Some("STAGING_KEY".into()),
            },
        );
        assert!(config.backend().is_err());

        let vars = env(&[("STAGING_KEY", "secret")]);
        config.apply_env(|k| vars.get(k).cloned());

        match config.backend().unwrap() {
            BackendSelection::Remote { base_url, api_key, max_wait, .. } => {
                assert_eq!(base_url, "https://ocr.example.com/api");
                assert_eq!(api_key, "secret");
                assert_eq!(max_wait, Duration::from_secs(300));
            }
            other => panic!("unexpected backend: {:?}", other),
        }
    }

    #[test]
    fn test_validate_lists_all_problems() {
        let config = Config::default();
        match config.validate() {
            Err(MeterRegressError::InvalidEnvironment(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/meter-regress.json")).unwrap();
        assert_eq!(config.max_wait_seconds, 300);
    }

    #[test]
    fn test_load_from_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"timeout_seconds": 30, "workers": 2}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.worker_count(), 2);
        assert_eq!(config.poll_interval_seconds, 5);
    }

    #[test]
    fn test_save_to_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.images_dir = Some(PathBuf::from("/data/images"));
        config.selected_server = "gpu".into();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.images_dir, Some(PathBuf::from("/data/images")));
        assert_eq!(loaded.selected_server, "gpu");
        assert_eq!(loaded.timeout_seconds, config.timeout_seconds);
    }
}
