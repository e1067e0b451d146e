//! パイプライン統合テスト
//!
//! シェルスクリプトを認識エンジンとして、データセット読み込みから
//! 最終保存・履歴追記までを通しで検証する。
#![cfg(unix)]

use meter_regress::config::Config;
use meter_regress::dataset::excel::{self, SaveOptions};
use meter_regress::dataset::{ReferenceValues, Row, Table};
use meter_regress::history::HistoryStore;
use meter_regress::pipeline;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

const ENGINE: &str = r#"case "$1" in
  *img1.jpg)
    echo "warming up"
    echo '{"status":"completed","meter_reading":"100.55","serial_number":"A1","model":"M","rate":"T1","overall_confidence":0.8,"timing":{"total":1.0}}'
    ;;
  *img2.jpg)
    echo '{"status":"completed","meter_reading":"42","serial_number":"S-2","model":"x200","rate":"T2","overall_confidence":0.7,"timing":{"total":3.0}}'
    ;;
  *img3.jpg)
    echo "camera buffer corrupted" >&2
    exit 2
    ;;
esac
"#;

struct Fixture {
    dir: TempDir,
    config: Config,
}

impl Fixture {
    fn dataset(&self) -> PathBuf {
        self.dir.path().join("image_data.xlsx")
    }
}

fn reference(ind: &str, series: &str, model: &str, rate: &str) -> ReferenceValues {
    ReferenceValues {
        indications: ind.into(),
        series: series.into(),
        model: model.into(),
        rate: rate.into(),
    }
}

fn write_engine(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("engine.sh");
    std::fs::write(&path, body).unwrap();
    path
}

fn fixture(image_names: &[&str], rows: Vec<Row>) -> Fixture {
    let dir = tempdir().unwrap();
    let images = dir.path().join("images");
    std::fs::create_dir(&images).unwrap();
    for name in image_names {
        std::fs::write(images.join(name), b"jpeg bytes").unwrap();
    }

    let dataset = dir.path().join("image_data.xlsx");
    excel::save_table(&Table::new(rows), &dataset, &SaveOptions::new("Image Data")).unwrap();

    let mut config = Config::default();
    config.images_dir = Some(images);
    config.dataset_path = Some(dataset);
    config.engine.program = Some(write_engine(dir.path(), ENGINE));
    config.engine.interpreter = Some("sh".into());
    config.timeout_seconds = 10;
    config.history_path = Some(dir.path().join("history.jsonl"));
    config.rename_results = false;

    Fixture { dir, config }
}

/// 2行のデータセット: 数値の許容差と型式の正規化で一致
#[test]
fn test_end_to_end_two_rows() {
    let fx = fixture(
        &["img1.jpg", "img2.jpg"],
        vec![
            Row::new("img1.jpg", reference("100.5", "A1", "M", "T1")),
            Row::new("img2.jpg", reference("42", "S2", "X-200", "T2")),
        ],
    );

    let report = pipeline::run(&fx.config, false).unwrap();
    let outcome = &report.outcome;
    assert_eq!(outcome.totals.processed, 2);
    assert_eq!(outcome.totals.errors, 0);
    assert_eq!(outcome.summary.accuracy.overall.accuracy, 100.0);
    assert_eq!(outcome.summary.average_time_per_image, 2.0);
    assert!(outcome.summary.average_from_telemetry);

    let saved = excel::load_table(&fx.dataset(), "Image Data").unwrap();
    let img1 = &saved.rows()[0];
    assert_eq!(img1.indications, "100.55");
    assert!(img1.matches.unwrap().indications);
    let img2 = &saved.rows()[1];
    assert!(img2.matches.unwrap().model);
    assert!(img2.matches.unwrap().series);
    assert_eq!(img2.extras["Timing Total"], "3");

    let history = HistoryStore::new(fx.dir.path().join("history.jsonl"));
    let records = history.recent(10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].successful_images, 2);
}

/// エンジンの異常終了はその画像だけエラーにして続行
#[test]
fn test_engine_failure_continues_run() {
    let fx = fixture(
        &["img1.jpg", "img3.jpg", "stray.jpg"],
        vec![
            Row::new("img1.jpg", reference("100.5", "A1", "M", "T1")),
            Row::new("img3.jpg", reference("1", "1", "1", "1")),
        ],
    );

    let outcome = pipeline::run(&fx.config, false).unwrap().outcome;
    assert_eq!(outcome.totals.processed, 1);
    assert_eq!(outcome.totals.errors, 1);
    assert_eq!(outcome.totals.skipped, 1);

    let saved = excel::load_table(&fx.dataset(), "Image Data").unwrap();
    assert_eq!(saved.rows()[1].indications, "ERROR: camera buffer corrupted");
    assert!(saved.rows()[1].matches.is_none());
    assert!(saved.rows()[0].is_processed());
}

/// 2回目の実行では処理済みの行に触れない
#[test]
fn test_rerun_is_idempotent() {
    let fx = fixture(
        &["img1.jpg", "img2.jpg"],
        vec![
            Row::new("img1.jpg", reference("100.5", "A1", "M", "T1")),
            Row::new("img2.jpg", reference("42", "S2", "X-200", "T2")),
        ],
    );

    pipeline::run(&fx.config, false).unwrap();
    let first = excel::load_table(&fx.dataset(), "Image Data").unwrap();

    // エンジンを壊しても処理済み行は再実行されない
    write_engine(fx.dir.path(), "exit 1");
    let outcome = pipeline::run(&fx.config, false).unwrap().outcome;
    assert_eq!(outcome.totals.processed, 0);
    assert_eq!(outcome.totals.errors, 0);
    assert_eq!(outcome.totals.skipped, 2);

    let second = excel::load_table(&fx.dataset(), "Image Data").unwrap();
    assert_eq!(first.rows(), second.rows());
}

#[test]
fn test_results_renamed_with_version() {
    let mut fx = fixture(
        &["img1.jpg"],
        vec![Row::new("img1.jpg", reference("100.5", "A1", "M", "T1"))],
    );
    fx.config.rename_results = true;

    let report = pipeline::run(&fx.config, false).unwrap();
    let name = report.results_path.file_name().unwrap().to_string_lossy().to_string();

    assert!(name.starts_with("image_data_vunknown_"));
    assert!(name.ends_with(".xlsx"));
    assert!(report.results_path.exists());
    assert!(!fx.dataset().exists());
}

#[test]
fn test_no_images_aborts() {
    let fx = fixture(&[], vec![Row::new("img1.jpg", ReferenceValues::default())]);
    let result = pipeline::run(&fx.config, false);
    assert!(matches!(
        result,
        Err(meter_regress::error::MeterRegressError::NoImagesFound(_))
    ));
}

#[test]
fn test_init_dataset_template() {
    let fx = fixture(&["img1.jpg", "img2.jpg"], Vec::new());
    let output = fx.dir.path().join("template.xlsx");

    let rows = pipeline::init_dataset(&fx.config, &output).unwrap();
    assert_eq!(rows, 2);

    let table = excel::load_table(&output, "Image Data").unwrap();
    let index = table.build_filename_index();
    assert!(index.contains_key("img1.jpg"));
    assert!(table.extra_columns().iter().any(|c| c == "Total Pixels"));
}
