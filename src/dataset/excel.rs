//! データセットのExcel読み書き
//!
//! 読み込みは calamine、書き出しは rust_xlsxwriter。
//! 結果ファイルは先頭にバージョン情報のバナー行を持つことがあるため、
//! 読み込み時は先頭10行から "Filename" を含む行をヘッダーとして探す。

use super::{Row, Table, TableSink};
use crate::error::{MeterRegressError, Result};
use calamine::{open_workbook_auto, Data, Reader};
use meter_regress_common::{generic_match, MatchFlags, Summary};
use rust_xlsxwriter::{Color, Format, FormatAlign, FormatBorder, Workbook, Worksheet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const COL_FILENAME: &str = "Filename";
pub const COL_REF_INDICATIONS: &str = "Indications (reference)";
/// 旧フォーマットの綴り
pub const COL_REF_INDICATIONS_LEGACY: &str = "Inidications (reference)";
pub const COL_REF_SERIES: &str = "Series number (reference)";
pub const COL_REF_MODEL: &str = "Model (reference)";
pub const COL_REF_RATE: &str = "Rate (reference)";
pub const COL_INDICATIONS: &str = "Indications";
pub const COL_SERIES: &str = "Series number";
pub const COL_MODEL: &str = "Model";
pub const COL_RATE: &str = "Rate";
pub const COL_INDICATIONS_MATCH: &str = "Indications Match";
pub const COL_SERIES_MATCH: &str = "Series Match";
pub const COL_MODEL_MATCH: &str = "Model Match";
pub const COL_RATE_MATCH: &str = "Rate Match";
pub const COL_OVERALL_MATCH: &str = "Overall Match";
pub const COL_OVERALL_CONFIDENCE: &str = "Overall Confidence";
pub const COL_OVERALL_CONFIDENCE_MATCH: &str = "Overall Confidence Match";

const HEADER_SEARCH_ROWS: usize = 10;
const SUMMARY_SHEET: &str = "Summary";

/// 固定列（書き出し順）
const CORE_COLUMNS: [&str; 16] = [
    COL_FILENAME,
    COL_REF_INDICATIONS,
    COL_REF_SERIES,
    COL_REF_MODEL,
    COL_REF_RATE,
    COL_INDICATIONS,
    COL_SERIES,
    COL_MODEL,
    COL_RATE,
    COL_OVERALL_CONFIDENCE,
    COL_INDICATIONS_MATCH,
    COL_SERIES_MATCH,
    COL_MODEL_MATCH,
    COL_RATE_MATCH,
    COL_OVERALL_MATCH,
    COL_OVERALL_CONFIDENCE_MATCH,
];

/// 結果ファイル先頭のバナー
#[derive(Debug, Clone, PartialEq)]
pub struct Banner {
    pub version: String,
    pub tested_at: String,
    pub results_file: String,
}

/// 書き出しオプション
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub sheet_name: String,
    pub banner: Option<Banner>,
    pub summary: Option<Summary>,
}

impl SaveOptions {
    pub fn new(sheet_name: impl Into<String>) -> Self {
        Self {
            sheet_name: sheet_name.into(),
            ..Default::default()
        }
    }
}

/// セル値を文字列化（整数値の浮動小数点は "123" で表す）
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => format_number(*f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => if *b { "1".into() } else { "0".into() },
        other => other.to_string(),
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        value.to_string()
    }
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

/// シートを読み込んでテーブルを構築
///
/// 指定シートがなければ先頭シートを使う。
pub fn load_table(path: &Path, sheet_name: &str) -> Result<Table> {
    if !path.exists() {
        return Err(MeterRegressError::FileNotFound(path.display().to_string()));
    }

    let mut workbook = open_workbook_auto(path)?;
    let sheet_names = workbook.sheet_names();
    let target = if sheet_names.iter().any(|n| n == sheet_name) {
        sheet_name.to_string()
    } else {
        let first = sheet_names.first().cloned().ok_or_else(|| {
            MeterRegressError::InvalidDataset("シートがありません".into())
        })?;
        tracing::warn!("シート {} が見つかりません。{} を使用します", sheet_name, first);
        first
    };

    let range = workbook.worksheet_range(&target)?;
    let rows: Vec<Vec<String>> = range
        .rows()
        .map(|r| r.iter().map(cell_text).collect())
        .collect();

    table_from_cells(&rows)
}

/// セル文字列の2次元配列からテーブルを構築
pub(crate) fn table_from_cells(cells: &[Vec<String>]) -> Result<Table> {
    let header_row = cells
        .iter()
        .take(HEADER_SEARCH_ROWS)
        .position(|row| row.iter().any(|c| c == COL_FILENAME))
        .ok_or_else(|| {
            MeterRegressError::InvalidDataset(format!("{} 列が見つかりません", COL_FILENAME))
        })?;

    let mut columns: HashMap<&str, usize> = HashMap::new();
    let mut extra_columns: Vec<(String, usize)> = Vec::new();

    for (idx, name) in cells[header_row].iter().enumerate() {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let canonical = if name == COL_REF_INDICATIONS_LEGACY {
            COL_REF_INDICATIONS
        } else {
            name
        };
        match CORE_COLUMNS.iter().find(|c| **c == canonical) {
            Some(core) => {
                columns.entry(*core).or_insert(idx);
            }
            None => extra_columns.push((name.to_string(), idx)),
        }
    }

    let mut table = Table::default();
    for (name, _) in &extra_columns {
        table.register_extra_column(name);
    }

    for values in &cells[header_row + 1..] {
        if values.iter().all(|c| c.trim().is_empty()) {
            continue;
        }

        let get = |name: &str| -> String {
            columns
                .get(name)
                .and_then(|idx| values.get(*idx))
                .cloned()
                .unwrap_or_default()
        };

        let mut row = Row::new(
            get(COL_FILENAME),
            super::ReferenceValues {
                indications: get(COL_REF_INDICATIONS),
                series: get(COL_REF_SERIES),
                model: get(COL_REF_MODEL),
                rate: get(COL_REF_RATE),
            },
        );
        row.indications = get(COL_INDICATIONS);
        row.series_number = get(COL_SERIES);
        row.model = get(COL_MODEL);
        row.rate = get(COL_RATE);
        row.overall_confidence = get(COL_OVERALL_CONFIDENCE).parse::<f64>().ok();
        row.matches = read_match_flags(&row, &get);

        for (name, idx) in &extra_columns {
            if let Some(value) = values.get(*idx).filter(|v| !v.is_empty()) {
                row.extras.insert(name.clone(), value.clone());
            }
        }

        table.push(row);
    }

    Ok(table)
}

/// 保存済みの照合フラグを復元（処理済みで4項目すべて読めた行のみ）
fn read_match_flags(row: &Row, get: &dyn Fn(&str) -> String) -> Option<MatchFlags> {
    if !row.is_processed() {
        return None;
    }

    let indications = parse_flag(&get(COL_INDICATIONS_MATCH))?;
    let series = parse_flag(&get(COL_SERIES_MATCH))?;
    let model = parse_flag(&get(COL_MODEL_MATCH))?;
    let rate = parse_flag(&get(COL_RATE_MATCH))?;
    let confident = parse_flag(&get(COL_OVERALL_CONFIDENCE_MATCH))
        .unwrap_or_else(|| row.overall_confidence.is_some_and(|c| c > 0.0));

    let mut flags = MatchFlags::from_fields(indications, series, model, rate, confident);
    if let Some(overall) = parse_flag(&get(COL_OVERALL_MATCH)) {
        flags.overall = overall;
    }
    Some(flags)
}

/// テーブルをExcelに保存
///
/// 同じディレクトリの一時ファイルに書いてから置き換えるため、
/// 書き込み途中で中断しても既存ファイルは壊れない。
pub fn save_table(table: &Table, path: &Path, options: &SaveOptions) -> Result<()> {
    let mut workbook = Workbook::new();

    write_data_sheet(workbook.add_worksheet(), table, options)?;
    if let Some(summary) = &options.summary {
        write_summary_sheet(workbook.add_worksheet(), summary)?;
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "results".into());

    // 書き手ごとに別名の一時ファイルを使う
    let mut temp = tempfile::Builder::new()
        .prefix(&format!("{}_temp_", stem))
        .suffix(".xlsx")
        .tempfile_in(dir)?;
    workbook.save_to_writer(temp.as_file_mut())?;
    temp.persist(path)
        .map_err(|e| MeterRegressError::Persistence(format!("{}: {}", path.display(), e.error)))?;

    Ok(())
}

fn write_data_sheet(worksheet: &mut Worksheet, table: &Table, options: &SaveOptions) -> Result<()> {
    worksheet.set_name(&options.sheet_name)?;

    let banner_format = Format::new().set_bold().set_font_color(Color::RGB(0x1F4E79));
    let header_format = Format::new()
        .set_bold()
        .set_background_color(Color::RGB(0xBDD7EE))
        .set_border(FormatBorder::Thin)
        .set_align(FormatAlign::Center)
        .set_align(FormatAlign::VerticalCenter)
        .set_text_wrap();
    let text_format = Format::new().set_num_format("@");
    let error_format = Format::new()
        .set_num_format("@")
        .set_font_color(Color::RGB(0xC00000));
    let result_match_format = Format::new()
        .set_num_format("@")
        .set_background_color(Color::RGB(0xE2EFDA));
    let result_mismatch_format = Format::new()
        .set_num_format("@")
        .set_background_color(Color::RGB(0xFCE4D6));
    let match_format = Format::new()
        .set_align(FormatAlign::Center)
        .set_background_color(Color::RGB(0xC6EFCE));
    let mismatch_format = Format::new()
        .set_align(FormatAlign::Center)
        .set_background_color(Color::RGB(0xFFC7CE));

    // バナー（3行）
    let mut header_row: u32 = 0;
    if let Some(banner) = &options.banner {
        worksheet.write_string_with_format(
            0,
            0,
            format!("アプリバージョン: v{}    テスト日時: {}", banner.version, banner.tested_at),
            &banner_format,
        )?;
        worksheet.write_string(1, 0, format!("結果ファイル: {}", banner.results_file))?;
        worksheet.write_string(2, 0, "=".repeat(80))?;
        header_row = 3;
    }

    let extras = table.extra_columns();
    for (col, name) in CORE_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(extras.iter().cloned())
        .enumerate()
    {
        worksheet.write_string_with_format(header_row, col as u16, &name, &header_format)?;
    }

    for (idx, row) in table.rows().iter().enumerate() {
        let r = header_row + 1 + idx as u32;

        let texts = [
            &row.filename,
            &row.reference.indications,
            &row.reference.series,
            &row.reference.model,
            &row.reference.rate,
        ];
        for (col, value) in texts.iter().enumerate() {
            worksheet.write_string_with_format(r, col as u16, value.as_str(), &text_format)?;
        }

        let results = [&row.indications, &row.series_number, &row.model, &row.rate];
        let highlights = result_highlights(row);
        for (offset, (value, highlight)) in results.iter().zip(highlights).enumerate() {
            let format = match highlight {
                _ if offset == 0 && row.has_error() => &error_format,
                Some(true) => &result_match_format,
                Some(false) => &result_mismatch_format,
                None => &text_format,
            };
            worksheet.write_string_with_format(r, 5 + offset as u16, value.as_str(), format)?;
        }

        if let Some(confidence) = row.overall_confidence {
            worksheet.write_number(r, 9, confidence)?;
        }

        if let Some(flags) = &row.matches {
            let values = [
                flags.indications,
                flags.series,
                flags.model,
                flags.rate,
                flags.overall,
                flags.overall_confidence,
            ];
            for (offset, matched) in values.iter().enumerate() {
                let format = if *matched { &match_format } else { &mismatch_format };
                let value = if *matched { 1.0 } else { 0.0 };
                worksheet.write_number_with_format(r, 10 + offset as u16, value, format)?;
            }
        }

        for (offset, name) in extras.iter().enumerate() {
            if let Some(value) = row.extras.get(name) {
                let col = (CORE_COLUMNS.len() + offset) as u16;
                worksheet.write_string_with_format(r, col, value, &text_format)?;
            }
        }
    }

    worksheet.set_column_width(0, 28.0)?;
    for col in 1..CORE_COLUMNS.len() as u16 {
        worksheet.set_column_width(col, 16.0)?;
    }
    worksheet.set_freeze_panes(header_row + 1, 1)?;

    Ok(())
}

/// 結果セルの色分け（認識値・シリアル番号・型式・料金区分の順）
///
/// 参照値と単純比較して一致なら `Some(true)`。未処理・エラー行の空セルは `None`。
fn result_highlights(row: &Row) -> [Option<bool>; 4] {
    if row.has_error() {
        return [None; 4];
    }
    let pairs = [
        (&row.indications, &row.reference.indications),
        (&row.series_number, &row.reference.series),
        (&row.model, &row.reference.model),
        (&row.rate, &row.reference.rate),
    ];
    pairs.map(|(result, reference)| {
        if result.trim().is_empty() {
            None
        } else {
            let result = result.to_lowercase();
            let reference = reference.to_lowercase();
            generic_match(Some(result.as_str()), Some(reference.as_str()))
        }
    })
}

fn write_summary_sheet(worksheet: &mut Worksheet, summary: &Summary) -> Result<()> {
    worksheet.set_name(SUMMARY_SHEET)?;

    let label_format = Format::new()
        .set_bold()
        .set_background_color(Color::RGB(0xF2F2F2))
        .set_border(FormatBorder::Thin);
    let value_format = Format::new().set_border(FormatBorder::Thin);

    let accuracy = &summary.accuracy;
    let entries: Vec<(&str, String)> = vec![
        ("Completion time", summary.completion_time.clone()),
        ("Total images", summary.total_images.to_string()),
        ("Successfully processed", summary.successfully_processed.to_string()),
        ("Errors", summary.errors.to_string()),
        ("Data update errors", summary.data_update_errors.to_string()),
        ("Skipped", summary.skipped.to_string()),
        ("Success rate (%)", format!("{:.2}", summary.success_rate)),
        ("Total time (s)", format!("{:.2}", summary.total_time_seconds)),
        ("Average time per image (s)", format!("{:.2}", summary.average_time_per_image)),
        ("Images per minute", format!("{:.2}", summary.images_per_minute)),
        ("Tests with results", accuracy.total_tests.to_string()),
        ("Indications accuracy (%)", format!("{:.2}", accuracy.indications.accuracy)),
        ("Series accuracy (%)", format!("{:.2}", accuracy.series.accuracy)),
        ("Model accuracy (%)", format!("{:.2}", accuracy.model.accuracy)),
        ("Rate accuracy (%)", format!("{:.2}", accuracy.rate.accuracy)),
        ("Overall accuracy (%)", format!("{:.2}", accuracy.overall.accuracy)),
        (
            "Overall confidence accuracy (%)",
            format!("{:.2}", accuracy.overall_confidence.accuracy),
        ),
    ];

    for (idx, (label, value)) in entries.iter().enumerate() {
        worksheet.write_string_with_format(idx as u32, 0, *label, &label_format)?;
        worksheet.write_string_with_format(idx as u32, 1, value, &value_format)?;
    }
    worksheet.set_column_width(0, 34.0)?;
    worksheet.set_column_width(1, 24.0)?;

    Ok(())
}

/// Excelファイルへのチェックポイント保存先
#[derive(Debug, Clone)]
pub struct ExcelSink {
    path: PathBuf,
    options: SaveOptions,
}

impl ExcelSink {
    pub fn new(path: impl Into<PathBuf>, options: SaveOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TableSink for ExcelSink {
    fn save(&self, table: &Table) -> Result<()> {
        save_table(table, &self.path, &self.options)
    }

    fn save_final(&self, table: &Table, summary: &Summary) -> Result<()> {
        let options = SaveOptions {
            summary: Some(summary.clone()),
            ..self.options.clone()
        };
        save_table(table, &self.path, &options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Field, ReferenceValues};

    fn cells(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1234567.0), "1234567");
        assert_eq!(format_number(100.5), "100.5");
        assert_eq!(cell_text(&Data::Float(7.0)), "7");
        assert_eq!(cell_text(&Data::String(" abc ".into())), "abc");
        assert_eq!(cell_text(&Data::Empty), "");
    }

    #[test]
    fn test_header_after_banner_and_legacy_column() {
        let table = table_from_cells(&cells(&[
            &["アプリバージョン: v1.0"],
            &["結果ファイル: x.xlsx"],
            &["===="],
            &["Filename", "Width", "Inidications (reference)", "Series number (reference)"],
            &["a.jpg", "640", "100.5", "123"],
            &["", "", "", ""],
            &["b.jpg", "", "7", ""],
        ]))
        .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0].reference.indications, "100.5");
        assert_eq!(table.rows()[0].reference.series, "123");
        assert_eq!(table.rows()[0].extras["Width"], "640");
        assert_eq!(table.extra_columns(), &["Width".to_string()]);
        assert!(table.rows()[1].extras.is_empty());
    }

    #[test]
    fn test_missing_filename_header() {
        let result = table_from_cells(&cells(&[&["Name", "Value"], &["a", "b"]]));
        assert!(matches!(result, Err(MeterRegressError::InvalidDataset(_))));
    }

    #[test]
    fn test_match_flags_restored_only_for_processed_rows() {
        let table = table_from_cells(&cells(&[
            &[
                "Filename", "Indications", "Series number", "Model", "Rate",
                "Indications Match", "Series Match", "Model Match", "Rate Match",
                "Overall Match", "Overall Confidence", "Overall Confidence Match",
            ],
            &["a.jpg", "1", "2", "M", "R", "1", "1", "0", "1", "0", "0.5", "1"],
            &["b.jpg", "ERROR: Timeout", "", "", "", "0", "0", "0", "0", "0", "", "0"],
        ]))
        .unwrap();

        let flags = table.rows()[0].matches.unwrap();
        assert!(flags.indications && flags.series && !flags.model && flags.rate);
        assert!(!flags.overall);
        assert!(flags.overall_confidence);
        assert_eq!(table.rows()[0].overall_confidence, Some(0.5));
        assert!(table.rows()[1].matches.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.xlsx");

        let mut row = Row::new(
            "a.jpg",
            ReferenceValues {
                indications: "100.5".into(),
                series: "00123".into(),
                model: "X".into(),
                rate: "T1".into(),
            },
        );
        row.indications = "100.5".into();
        row.series_number = "00123".into();
        row.model = "X".into();
        row.rate = "T1".into();
        row.overall_confidence = Some(0.9);
        row.matches = Some(MatchFlags::from_fields(true, true, true, true, true));

        let mut table = Table::new(vec![row, Row::new("b.jpg", ReferenceValues::default())]);
        table.set(0, Field::Extra("Timing Total".into()), "1.25").unwrap();

        let options = SaveOptions {
            sheet_name: "Image Data".into(),
            banner: Some(Banner {
                version: "1.2.3".into(),
                tested_at: "2026-01-01 00:00:00".into(),
                results_file: "results.xlsx".into(),
            }),
            summary: None,
        };
        ExcelSink::new(&path, options)
            .save_final(&table, &Summary::default())
            .unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name != "results.xlsx")
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);

        let loaded = load_table(&path, "Image Data").unwrap();
        assert_eq!(loaded.len(), 2);
        let first = &loaded.rows()[0];
        assert_eq!(first.reference.series, "00123");
        assert_eq!(first.series_number, "00123");
        assert_eq!(first.overall_confidence, Some(0.9));
        assert_eq!(first.matches, table.rows()[0].matches);
        assert_eq!(first.extras["Timing Total"], "1.25");
        assert!(loaded.rows()[1].matches.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_table(Path::new("/nonexistent/data.xlsx"), "Image Data");
        assert!(matches!(result, Err(MeterRegressError::FileNotFound(_))));
    }

    #[test]
    fn test_result_highlights_against_reference() {
        let mut row = Row::new(
            "a.jpg",
            ReferenceValues {
                indications: "100.5".into(),
                series: "A1".into(),
                model: "X-200".into(),
                rate: "T1".into(),
            },
        );
        assert_eq!(result_highlights(&row), [None; 4]);

        row.indications = "100.5004".into();
        row.series_number = "a1".into();
        row.model = "x200".into();
        row.rate = "T2".into();
        assert_eq!(
            result_highlights(&row),
            [Some(true), Some(true), Some(false), Some(false)]
        );

        row.indications = "ERROR: Timeout".into();
        assert_eq!(result_highlights(&row), [None; 4]);
    }

    #[test]
    fn test_concurrent_saves_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.xlsx");
        let sink = ExcelSink::new(&path, SaveOptions::new("Image Data"));
        let table = Table::new(
            (0..50)
                .map(|i| Row::new(format!("img{:02}.jpg", i), ReferenceValues::default()))
                .collect(),
        );

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8).map(|_| scope.spawn(|| sink.save(&table))).collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }
        });

        assert_eq!(load_table(&path, "Image Data").unwrap().len(), 50);
    }
}
