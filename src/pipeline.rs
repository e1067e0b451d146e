//! 回帰テスト1回分の実行
//!
//! 環境チェック → 画像スキャン → データセット読み込み → 認識・反映 →
//! 最終保存 → 履歴追記 → 結果ファイルのリネーム

use crate::config::Config;
use crate::dataset::excel::{self, Banner, ExcelSink, SaveOptions};
use crate::dataset::SharedTable;
use crate::dispatcher::{DispatchOptions, Dispatcher, RunOutcome};
use crate::error::{MeterRegressError, Result};
use crate::history::{HistoryRecord, HistoryStore};
use crate::recognizer::build_recognizer;
use crate::report::TIMESTAMP_FORMAT;
use crate::scanner;
use crate::version;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub version: String,
    /// 最終的な結果ファイル（リネーム後のパス）
    pub results_path: PathBuf,
}

pub fn run(config: &Config, show_progress: bool) -> Result<RunReport> {
    config.validate()?;

    let images_dir = config
        .images_dir
        .as_ref()
        .ok_or_else(|| MeterRegressError::Config("FOLDER_TEST が設定されていません".into()))?;
    let dataset_path = config
        .dataset_path
        .as_ref()
        .ok_or_else(|| MeterRegressError::Config("EXCEL_DATA が設定されていません".into()))?;

    let images = scanner::scan_folder(images_dir, &config.image_extensions)?;
    if images.is_empty() {
        return Err(MeterRegressError::NoImagesFound(images_dir.display().to_string()));
    }
    tracing::info!("{}枚の画像を検出: {}", images.len(), images_dir.display());

    let table = excel::load_table(dataset_path, &config.sheet_name)?;
    tracing::info!("データセット {}行: {}", table.len(), dataset_path.display());

    let recognizer = build_recognizer(&config.backend()?)?;

    let version = version::git_version(config.main_repo_path.as_deref());
    let started_at = chrono::Local::now();
    let target = if config.rename_results {
        version::versioned_path(dataset_path, &version, started_at)
    } else {
        dataset_path.clone()
    };

    let sink = ExcelSink::new(
        dataset_path.clone(),
        SaveOptions {
            sheet_name: config.sheet_name.clone(),
            banner: Some(Banner {
                version: version.clone(),
                tested_at: started_at.format(TIMESTAMP_FORMAT).to_string(),
                results_file: target
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            }),
            summary: None,
        },
    );

    let shared = SharedTable::new(table);
    let options = DispatchOptions {
        workers: config.worker_count(),
        checkpoint_every: config.checkpoint_every,
        show_progress,
    };
    let outcome = Dispatcher::new(&shared, recognizer, &sink, options).run(&images)?;

    record_history(config, &outcome, &version, dataset_path);

    let results_path = if target != *dataset_path {
        match version::rename_results(dataset_path, &target) {
            Ok(path) => {
                tracing::info!("結果ファイルをリネーム: {}", path.display());
                path
            }
            Err(e) => {
                tracing::error!("結果ファイルのリネームに失敗: {}", e);
                dataset_path.clone()
            }
        }
    } else {
        dataset_path.clone()
    };

    Ok(RunReport {
        outcome,
        version,
        results_path,
    })
}

/// 履歴の追記失敗は実行結果に影響させない
fn record_history(config: &Config, outcome: &RunOutcome, version: &str, dataset: &std::path::Path) {
    let store = match config.history_path() {
        Ok(path) => HistoryStore::new(path),
        Err(e) => {
            tracing::warn!("履歴の保存先を決定できません: {}", e);
            return;
        }
    };

    let dataset_name = dataset.file_name().map(|n| n.to_string_lossy().to_string());
    let record = HistoryRecord::from_summary(&outcome.summary, version, dataset_name.as_deref());
    if let Err(e) = store.append(&record) {
        tracing::warn!("履歴の保存に失敗: {}", e);
    }
}

/// データセットの雛形を作る
pub fn init_dataset(config: &Config, output: &std::path::Path) -> Result<usize> {
    let images_dir = config
        .images_dir
        .as_ref()
        .ok_or_else(|| MeterRegressError::Config("FOLDER_TEST が設定されていません".into()))?;

    let images = scanner::scan_folder(images_dir, &config.image_extensions)?;
    if images.is_empty() {
        return Err(MeterRegressError::NoImagesFound(images_dir.display().to_string()));
    }

    let table = crate::dataset::template::build_template(&images)?;
    excel::save_table(&table, output, &SaveOptions::new(config.sheet_name.clone()))?;
    Ok(table.len())
}
