//! 実行サマリーの作成と表示

use crate::dataset::Table;
use meter_regress_common::{build_summary, FieldAccuracy, RunTotals, Summary};
use std::fmt::Write;
use std::time::Duration;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// テーブルと実行カウンタからサマリーを作る
///
/// `timings` は今回の実行で反映した画像のエンジン計測時間（秒）。
pub fn summarize(table: &Table, totals: RunTotals, elapsed: Duration, timings: &[f64]) -> Summary {
    build_summary(
        totals,
        elapsed.as_secs_f64(),
        table.accuracy(),
        timings,
        chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
    )
}

fn accuracy_line(out: &mut String, label: &str, field: &FieldAccuracy, total: usize) {
    let _ = writeln!(
        out,
        "  {:<20} {:>6.2}% ({}/{})",
        label, field.accuracy, field.correct, total
    );
}

/// 終了時レポート
pub fn render(summary: &Summary) -> String {
    let mut out = String::new();
    let attempted = summary.successfully_processed + summary.errors;

    let _ = writeln!(out, "=== 実行結果 ({}) ===", summary.completion_time);
    let _ = writeln!(out, "  処理対象:   {}枚", attempted);
    let _ = writeln!(out, "  成功:       {}枚", summary.successfully_processed);
    let _ = writeln!(
        out,
        "  エラー:     {}枚 (うちデータ更新エラー {})",
        summary.errors, summary.data_update_errors
    );
    let _ = writeln!(out, "  スキップ:   {}枚", summary.skipped);
    let _ = writeln!(out, "  成功率:     {:.2}%", summary.success_rate);
    let _ = writeln!(
        out,
        "  所要時間:   {:.1}秒 (平均 {:.2}秒/枚{}、{:.1}枚/分)",
        summary.total_time_seconds,
        summary.average_time_per_image,
        if summary.average_from_telemetry { "・エンジン計測" } else { "" },
        summary.images_per_minute
    );

    let accuracy = &summary.accuracy;
    let total = accuracy.total_tests;
    let _ = writeln!(out, "=== 精度 ({}件) ===", total);
    accuracy_line(&mut out, "Indications", &accuracy.indications, total);
    accuracy_line(&mut out, "Series number", &accuracy.series, total);
    accuracy_line(&mut out, "Model", &accuracy.model, total);
    accuracy_line(&mut out, "Rate", &accuracy.rate, total);
    accuracy_line(&mut out, "Overall", &accuracy.overall, total);
    accuracy_line(&mut out, "Overall confidence", &accuracy.overall_confidence, total);

    out
}

/// サマリーをログへ出力
pub fn log_summary(summary: &Summary) {
    let accuracy = &summary.accuracy;
    tracing::info!(
        processed = summary.successfully_processed,
        errors = summary.errors,
        skipped = summary.skipped,
        data_update_errors = summary.data_update_errors,
        success_rate = summary.success_rate,
        elapsed_secs = summary.total_time_seconds,
        "実行完了"
    );
    tracing::info!(
        indications = accuracy.indications.accuracy,
        series = accuracy.series.accuracy,
        model = accuracy.model.accuracy,
        rate = accuracy.rate.accuracy,
        overall = accuracy.overall.accuracy,
        "精度"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ReferenceValues, Row};
    use meter_regress_common::MatchFlags;

    fn table() -> Table {
        let mut hit = Row::new("a.jpg", ReferenceValues::default());
        hit.matches = Some(MatchFlags::from_fields(true, true, true, true, true));

        let mut miss = Row::new("b.jpg", ReferenceValues::default());
        miss.matches = Some(MatchFlags::from_fields(true, false, true, true, true));

        Table::new(vec![hit, miss, Row::new("c.jpg", ReferenceValues::default())])
    }

    #[test]
    fn test_summarize_uses_telemetry() {
        let totals = RunTotals {
            processed: 2,
            errors: 1,
            skipped: 1,
            data_update_errors: 0,
        };
        let summary = summarize(&table(), totals, Duration::from_secs(30), &[2.0, 4.0]);

        assert_eq!(summary.total_images, 4);
        assert_eq!(summary.average_time_per_image, 3.0);
        assert!(summary.average_from_telemetry);
        assert_eq!(summary.images_per_minute, 6.0);
        assert_eq!(summary.accuracy.total_tests, 3);
        assert_eq!(summary.accuracy.overall.correct, 1);
        assert!(!summary.completion_time.is_empty());
    }

    #[test]
    fn test_render_contains_accuracy() {
        let summary = summarize(&table(), RunTotals::default(), Duration::ZERO, &[]);
        let text = render(&summary);
        assert!(text.contains("精度 (3件)"));
        assert!(text.contains("Series number"));
        assert!(text.contains("33.33% (1/3)"));
    }

    #[test]
    fn test_summarize_without_telemetry_uses_elapsed() {
        let totals = RunTotals {
            processed: 3,
            errors: 1,
            ..Default::default()
        };
        let summary = summarize(&table(), totals, Duration::from_secs(20), &[]);
        assert_eq!(summary.average_time_per_image, 5.0);
        assert!(!summary.average_from_telemetry);
    }
}
