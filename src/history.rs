//! テスト実行履歴
//!
//! 1実行 = JSON 1行の追記専用ファイル。壊れた行は読み飛ばす。

use crate::error::Result;
use meter_regress_common::Summary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// テストスイートのバージョン
pub const SUITE_VERSION: &str = "test_suite_v1.0";

/// 履歴1件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: String,
    /// 認識エンジンのバージョンタグ
    pub version: String,
    pub suite_version: String,
    pub total_images: usize,
    pub successful_images: usize,
    pub error_images: usize,
    pub skipped_images: usize,
    pub overall_accuracy: f64,
    pub indications_accuracy: f64,
    pub series_accuracy: f64,
    pub model_accuracy: f64,
    pub rate_accuracy: f64,
    pub duration_seconds: f64,
    #[serde(default)]
    pub comment: String,
}

impl HistoryRecord {
    pub fn from_summary(summary: &Summary, version: &str, dataset_file: Option<&str>) -> Self {
        let source = dataset_file
            .map(|f| format!("ファイル: {}", f))
            .unwrap_or_else(|| "テストデータ".to_string());

        Self {
            timestamp: summary.completion_time.clone(),
            version: version.to_string(),
            suite_version: SUITE_VERSION.to_string(),
            total_images: summary.total_images,
            successful_images: summary.successfully_processed,
            error_images: summary.errors,
            skipped_images: summary.skipped,
            overall_accuracy: summary.accuracy.overall.accuracy,
            indications_accuracy: summary.accuracy.indications.accuracy,
            series_accuracy: summary.accuracy.series.accuracy,
            model_accuracy: summary.accuracy.model.accuracy,
            rate_accuracy: summary.accuracy.rate.accuracy,
            duration_seconds: summary.total_time_seconds,
            comment: format!(
                "自動テスト。{}。成功率: {:.1}%",
                source, summary.success_rate
            ),
        }
    }
}

/// バージョン別の精度推移
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionTrend {
    pub tests: usize,
    pub avg_accuracy: f64,
    pub best_accuracy: f64,
    pub worst_accuracy: f64,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 1件追記
    pub fn append(&self, record: &HistoryRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// 全件（古い順）
    pub fn load(&self) -> Result<Vec<HistoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("履歴 {} 行目を読み飛ばします: {}", idx + 1, e),
            }
        }
        Ok(records)
    }

    /// 直近 `limit` 件（新しい順）
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let mut records = self.load()?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    /// 直近 `window` 件からバージョン別の総合精度を集計
    pub fn accuracy_trend(&self, window: usize) -> Result<BTreeMap<String, VersionTrend>> {
        let mut trend: BTreeMap<String, VersionTrend> = BTreeMap::new();

        for record in self.recent(window)? {
            let entry = trend.entry(record.version.clone()).or_insert(VersionTrend {
                tests: 0,
                avg_accuracy: 0.0,
                best_accuracy: 0.0,
                worst_accuracy: 100.0,
            });
            entry.tests += 1;
            // 合計を一旦 avg_accuracy に積み、最後に割る
            entry.avg_accuracy += record.overall_accuracy;
            entry.best_accuracy = entry.best_accuracy.max(record.overall_accuracy);
            entry.worst_accuracy = entry.worst_accuracy.min(record.overall_accuracy);
        }

        for entry in trend.values_mut() {
            entry.avg_accuracy /= entry.tests as f64;
        }

        Ok(trend)
    }
}
