//! 認識結果をテーブルへ反映
//!
//! 参照値の読み出しと結果の書き込みはそれぞれ短いロック区間で行い、
//! 照合の計算はロック外で行う。

use crate::dataset::{timing_column, Field, SharedTable, ERROR_PREFIX};
use crate::error::Result;
use meter_regress_common::{
    numeric_match, text_match, MatchFlags, MeterReading, RecognitionResult,
};

pub const COL_SERIAL_CONFIDENCE: &str = "Serial Number Confidence";
pub const COL_RECOGNITION_CONFIDENCE: &str = "Recognition Confidence";

const DATA_UPDATE_ERROR: &str = "Data update error";

/// 反映結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// 認識成功・書き込み完了
    Success,
    /// 認識失敗（エラーマーカーを書き込み済み）
    RecognitionFailed,
    /// 書き込み処理自体の失敗
    DataUpdateError,
}

/// 1枚分の結果を行へ反映する
///
/// 書き込みに失敗しても他のタスクには影響させず、行にエラーマーカーを残す。
pub fn reconcile(table: &SharedTable, row_id: usize, result: &RecognitionResult) -> Reconciled {
    match try_reconcile(table, row_id, result) {
        Ok(true) => Reconciled::Success,
        Ok(false) => Reconciled::RecognitionFailed,
        Err(e) => {
            tracing::error!("データ更新エラー (行 {}): {}", row_id + 1, e);
            let marker = error_marker(DATA_UPDATE_ERROR);
            if let Err(e) = table.update(|t| {
                t.row_mut(row_id)?.matches = None;
                t.set(row_id, Field::Indications, marker)
            }) {
                tracing::error!("エラーマーカーの書き込みに失敗 (行 {}): {}", row_id + 1, e);
            }
            Reconciled::DataUpdateError
        }
    }
}

pub fn error_marker(message: &str) -> String {
    format!("{} {}", ERROR_PREFIX, message)
}

/// 指示値の表記を揃える（数値なら小数点を `.` に、テキストはそのまま）
fn normalize_reading(raw: &str) -> String {
    match MeterReading::parse(raw) {
        MeterReading::Number(_) => raw.trim().replace(',', "."),
        MeterReading::Text(text) => text,
    }
}

fn try_reconcile(table: &SharedTable, row_id: usize, result: &RecognitionResult) -> Result<bool> {
    if !result.is_completed() {
        let marker = error_marker(result.error_message());
        table.update(|t| {
            t.row_mut(row_id)?.matches = None;
            t.set(row_id, Field::Indications, marker)
        })?;
        return Ok(false);
    }

    let reference = table.read(|t| t.row(row_id).map(|row| row.reference.clone()))??;

    let indications = normalize_reading(&result.meter_reading);
    let flags = MatchFlags::from_fields(
        numeric_match(&indications, &reference.indications),
        text_match(&result.serial_number, &reference.series),
        text_match(&result.model, &reference.model),
        text_match(&result.rate, &reference.rate),
        result.overall_confidence > 0.0,
    );

    let digit_confidences = result
        .recognition_confidences
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    table.update(|t| {
        t.set(row_id, Field::Indications, indications)?;
        t.set(row_id, Field::SeriesNumber, result.serial_number.trim())?;
        t.set(row_id, Field::Model, result.model.trim())?;
        t.set(row_id, Field::Rate, result.rate.trim())?;
        t.set(row_id, Field::OverallConfidence, result.overall_confidence.to_string())?;
        t.set(
            row_id,
            Field::Extra(COL_SERIAL_CONFIDENCE.into()),
            result.serial_number_confidence.to_string(),
        )?;
        t.set(row_id, Field::Extra(COL_RECOGNITION_CONFIDENCE.into()), digit_confidences)?;
        for (name, secs) in &result.timing {
            t.set(row_id, Field::Extra(timing_column(name)), secs.to_string())?;
        }
        for (name, value) in &result.extras {
            t.set(row_id, Field::Extra(name.clone()), value.clone())?;
        }

        // フラグは結果4項目が揃っている行にのみ付ける
        let row = t.row_mut(row_id)?;
        row.matches = if row.is_processed() { Some(flags) } else { None };
        Ok(())
    })?;

    Ok(true)
}
