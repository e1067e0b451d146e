//! 精度集計
//!
//! 照合フラグから項目別・総合の正解率を求め、
//! 実行カウンタと経過時間を合わせてサマリーを組み立てる。

use crate::types::MatchFlags;
use serde::{Deserialize, Serialize};

/// 項目別の正解数と正解率（%）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldAccuracy {
    pub correct: usize,
    pub accuracy: f64,
}

impl FieldAccuracy {
    fn new(correct: usize, total: usize) -> Self {
        Self {
            correct,
            accuracy: percentage(correct, total),
        }
    }
}

/// 精度統計
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AccuracyStats {
    pub total_tests: usize,
    pub indications: FieldAccuracy,
    pub series: FieldAccuracy,
    pub model: FieldAccuracy,
    pub rate: FieldAccuracy,
    pub overall: FieldAccuracy,
    pub overall_confidence: FieldAccuracy,
}

/// 割合（%）。分母0なら0
pub fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// 全行のフラグから精度を計算
///
/// 分母は未処理行・エラー行を含む全行数。
pub fn calculate_accuracy<'a, I>(rows: I) -> AccuracyStats
where
    I: IntoIterator<Item = Option<&'a MatchFlags>>,
{
    let mut total = 0;
    let mut counts = [0usize; 6];

    for flags in rows {
        total += 1;
        let Some(flags) = flags else { continue };
        let hits = [
            flags.indications,
            flags.series,
            flags.model,
            flags.rate,
            flags.overall,
            flags.overall_confidence,
        ];
        for (count, hit) in counts.iter_mut().zip(hits) {
            *count += hit as usize;
        }
    }

    AccuracyStats {
        total_tests: total,
        indications: FieldAccuracy::new(counts[0], total),
        series: FieldAccuracy::new(counts[1], total),
        model: FieldAccuracy::new(counts[2], total),
        rate: FieldAccuracy::new(counts[3], total),
        overall: FieldAccuracy::new(counts[4], total),
        overall_confidence: FieldAccuracy::new(counts[5], total),
    }
}

/// 実行カウンタのスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunTotals {
    pub processed: usize,
    pub errors: usize,
    pub skipped: usize,
    /// 認識成功後の書き込み失敗（errors にも含まれる）
    pub data_update_errors: usize,
}

impl RunTotals {
    /// 認識を試行した件数
    pub fn attempted(&self) -> usize {
        self.processed + self.errors
    }
}

/// 実行サマリー
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Summary {
    pub total_images: usize,
    pub successfully_processed: usize,
    pub errors: usize,
    pub data_update_errors: usize,
    pub skipped: usize,
    pub success_rate: f64,
    pub total_time_seconds: f64,
    pub average_time_per_image: f64,
    /// 平均時間がエンジン計測値由来か
    pub average_from_telemetry: bool,
    pub images_per_minute: f64,
    pub completion_time: String,
    pub accuracy: AccuracyStats,
}

/// サマリーを組み立てる
///
/// 平均処理時間は、エンジンが画像ごとの計測値を返していればその平均を使う。
/// 経過時間からの平均はディスパッチや保存のオーバーヘッドを含むため次善。
pub fn build_summary(
    totals: RunTotals,
    elapsed_seconds: f64,
    accuracy: AccuracyStats,
    timing_totals: &[f64],
    completion_time: impl Into<String>,
) -> Summary {
    let attempted = totals.attempted();

    let (average_time_per_image, average_from_telemetry) = if timing_totals.is_empty() {
        let average = if attempted > 0 {
            elapsed_seconds / attempted as f64
        } else {
            0.0
        };
        (average, false)
    } else {
        let sum: f64 = timing_totals.iter().sum();
        (sum / timing_totals.len() as f64, true)
    };

    let images_per_minute = if elapsed_seconds > 0.0 {
        attempted as f64 * 60.0 / elapsed_seconds
    } else {
        0.0
    };

    Summary {
        total_images: attempted + totals.skipped,
        successfully_processed: totals.processed,
        errors: totals.errors,
        data_update_errors: totals.data_update_errors,
        skipped: totals.skipped,
        success_rate: percentage(totals.processed, attempted),
        total_time_seconds: elapsed_seconds,
        average_time_per_image,
        average_from_telemetry,
        images_per_minute,
        completion_time: completion_time.into(),
        accuracy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(ind: bool, ser: bool, model: bool, rate: bool) -> MatchFlags {
        MatchFlags::from_fields(ind, ser, model, rate, true)
    }

    #[test]
    fn test_calculate_accuracy_empty() {
        let stats = calculate_accuracy(std::iter::empty());
        assert_eq!(stats.total_tests, 0);
        assert_eq!(stats.indications.accuracy, 0.0);
        assert_eq!(stats.overall.accuracy, 0.0);
        assert_eq!(stats.overall_confidence.accuracy, 0.0);
    }

    #[test]
    fn test_calculate_accuracy_counts_unprocessed_rows() {
        let a = flags(true, true, true, true);
        let b = flags(true, false, true, false);
        let rows = vec![Some(&a), Some(&b), None, None];

        let stats = calculate_accuracy(rows);
        assert_eq!(stats.total_tests, 4);
        assert_eq!(stats.indications.correct, 2);
        assert_eq!(stats.indications.accuracy, 50.0);
        assert_eq!(stats.series.accuracy, 25.0);
        assert_eq!(stats.overall.correct, 1);
        assert_eq!(stats.overall_confidence.correct, 2);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(1, 4), 25.0);
    }

    #[test]
    fn test_build_summary_wall_clock_average() {
        let totals = RunTotals { processed: 8, errors: 2, skipped: 3, data_update_errors: 0 };
        let summary = build_summary(totals, 120.0, AccuracyStats::default(), &[], "2026-01-01 00:00:00");

        assert_eq!(summary.total_images, 13);
        assert_eq!(summary.success_rate, 80.0);
        assert_eq!(summary.average_time_per_image, 12.0);
        assert!(!summary.average_from_telemetry);
        assert_eq!(summary.images_per_minute, 5.0);
    }

    #[test]
    fn test_build_summary_prefers_telemetry() {
        let totals = RunTotals { processed: 2, errors: 0, skipped: 0, data_update_errors: 0 };
        let summary = build_summary(totals, 100.0, AccuracyStats::default(), &[1.0, 3.0], "");

        assert_eq!(summary.average_time_per_image, 2.0);
        assert!(summary.average_from_telemetry);
    }

    #[test]
    fn test_build_summary_zero_elapsed() {
        let summary = build_summary(RunTotals::default(), 0.0, AccuracyStats::default(), &[], "");
        assert_eq!(summary.images_per_minute, 0.0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.average_time_per_image, 0.0);
    }
}
