//! 認識エンジン呼び出し
//!
//! ローカル（サブプロセス）とリモート（HTTP API）の2種類。
//! どちらも失敗を `RecognitionResult::failure` として返し、呼び出し側へエラーを伝播しない。

mod local;
mod remote;

pub use local::LocalRecognizer;
pub use remote::RemoteRecognizer;

use crate::config::BackendSelection;
use crate::error::Result;
use crate::scanner::ImageInfo;
use meter_regress_common::RecognitionResult;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// 1枚分の認識タスク
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub image_path: PathBuf,
    pub file_name: String,
    /// テーブル上の行番号
    pub row_id: usize,
    pub task_id: String,
}

impl Task {
    pub fn new(image: &ImageInfo, row_id: usize, worker: usize) -> Self {
        Self {
            image_path: image.path.clone(),
            file_name: image.file_name.clone(),
            row_id,
            task_id: task_id(&image.file_name, worker),
        }
    }
}

/// タスクID: `test_{UNIX秒}_{ファイル名}_{ワーカー番号}`
pub fn task_id(file_name: &str, worker: usize) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("test_{}_{}_{}", secs, file_name.replace('.', "_"), worker)
}

pub trait Recognizer: Send + Sync {
    /// 1枚を認識（失敗も結果として返す）
    fn recognize(&self, task: &Task) -> RecognitionResult;

    /// 並列実行はリモートのみ許可
    fn is_remote(&self) -> bool;

    fn name(&self) -> &str;
}

/// 設定からバックエンドを生成（実行中は切り替えない）
pub fn build_recognizer(selection: &BackendSelection) -> Result<Arc<dyn Recognizer>> {
    let recognizer: Arc<dyn Recognizer> = match selection {
        BackendSelection::Local {
            program,
            interpreter,
            timeout,
        } => Arc::new(LocalRecognizer::new(program.clone(), interpreter.clone(), *timeout)),
        BackendSelection::Remote {
            name,
            base_url,
            api_key,
            poll_interval,
            max_wait,
            fallback_wait,
        } => Arc::new(RemoteRecognizer::new(
            name.clone(),
            base_url.clone(),
            api_key.clone(),
            *poll_interval,
            *max_wait,
            *fallback_wait,
        )?),
    };

    tracing::info!("認識バックエンド: {}", recognizer.name());
    Ok(recognizer)
}
