//! 認識結果の型定義
//!
//! ローカル実行・リモートAPIの両バックエンドで共有される型:
//! - RecognitionResult: 1画像ぶんの正規化済み認識結果
//! - MeterReading: 指示値（数値 or 判読不能桁を含むテキスト）
//! - MatchFlags: 参照値との照合フラグ

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// 保存するエラーメッセージの最大文字数
pub const ERROR_MESSAGE_LIMIT: usize = 200;

/// 認識ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionStatus {
    Completed,
    #[default]
    Failed,
}

/// 認識結果（正規化済み）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionResult {
    pub status: RecognitionStatus,
    pub meter_reading: String,          // 指示値
    pub serial_number: String,          // シリアル番号
    pub model: String,                  // 型式
    pub rate: String,                   // 料金区分
    pub serial_number_confidence: f64,
    pub recognition_confidences: Vec<f64>, // 桁ごとの信頼度
    pub overall_confidence: f64,
    /// 処理時間の内訳（秒）
    pub timing: BTreeMap<String, f64>,
    /// エンジンが返したその他の属性（前処理結果など）
    pub extras: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl RecognitionResult {
    /// 失敗結果を生成（メッセージは上限で切り詰め、値は空）
    pub fn failure(message: impl AsRef<str>) -> Self {
        Self {
            status: RecognitionStatus::Failed,
            error: Some(truncate_message(message.as_ref())),
            ..Default::default()
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RecognitionStatus::Completed
    }

    /// エラーメッセージ（失敗時）
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("Unknown error")
    }

    /// エンジンのJSON出力から結果を構築
    ///
    /// - `status` が `completed` 以外は失敗結果になる
    /// - `overall_confidence` が無ければシリアル信頼度×桁信頼度の積で補完
    /// - `preprocessing_results` は `extras` に、`timing` は `timing` に格納
    pub fn from_engine_value(value: &Value) -> Self {
        let status = value.get("status").and_then(Value::as_str).unwrap_or("");

        match status {
            "completed" => {}
            "failed" => {
                let message = value
                    .get("error")
                    .map(value_to_text)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Unknown error".to_string());
                return Self::failure(message);
            }
            "" => return Self::failure("status field missing in engine output"),
            other => return Self::failure(format!("unexpected status: {}", other)),
        }

        let text = |key: &str| value.get(key).map(value_to_text).unwrap_or_default();

        let serial_number_confidence = value
            .get("serial_number_confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let recognition_confidences: Vec<f64> = value
            .get("recognition_confidences")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();

        let overall_confidence = value
            .get("overall_confidence")
            .and_then(Value::as_f64)
            .unwrap_or_else(|| {
                compute_overall_confidence(serial_number_confidence, &recognition_confidences)
            });

        let timing = value
            .get("timing")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|secs| (k.clone(), secs)))
                    .collect()
            })
            .unwrap_or_default();

        let extras = value
            .get("preprocessing_results")
            .and_then(Value::as_object)
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), value_to_text(v))).collect())
            .unwrap_or_default();

        Self {
            status: RecognitionStatus::Completed,
            meter_reading: text("meter_reading"),
            serial_number: text("serial_number"),
            model: text("model"),
            rate: text("rate"),
            serial_number_confidence,
            recognition_confidences,
            overall_confidence,
            timing,
            extras,
            error: None,
        }
    }
}

/// 総合信頼度 = round(シリアル信頼度 × Π桁信頼度, 4)
///
/// 桁信頼度が空の場合はシリアル信頼度のみを丸める。
pub fn compute_overall_confidence(serial_confidence: f64, digit_confidences: &[f64]) -> f64 {
    let product: f64 = digit_confidences.iter().product();
    round4(serial_confidence * product)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// エラーメッセージを上限文字数で切り詰める
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() > ERROR_MESSAGE_LIMIT {
        let head: String = message.chars().take(ERROR_MESSAGE_LIMIT).collect();
        format!("{}...", head)
    } else {
        message.to_string()
    }
}

/// JSON値をセル用テキストに変換
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// 指示値
#[derive(Debug, Clone, PartialEq)]
pub enum MeterReading {
    Number(f64),
    /// 判読不能桁のプレースホルダ等を含むためテキストのまま扱う
    Text(String),
}

impl MeterReading {
    /// 区切り（`,` `.`）以外がすべて数字なら数値化、それ以外はテキスト
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let digits_only = trimmed.chars().filter(|c| !matches!(c, ',' | '.'));
        let looks_numeric = trimmed.chars().any(|c| c.is_ascii_digit())
            && digits_only.clone().all(|c| c.is_ascii_digit());

        if looks_numeric {
            if let Ok(number) = trimmed.replace(',', ".").parse::<f64>() {
                return MeterReading::Number(number);
            }
        }
        MeterReading::Text(trimmed.to_string())
    }
}

impl fmt::Display for MeterReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeterReading::Number(n) => write!(f, "{}", n),
            MeterReading::Text(s) => write!(f, "{}", s),
        }
    }
}

/// 参照値との照合フラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MatchFlags {
    pub indications: bool,
    pub series: bool,
    pub model: bool,
    pub rate: bool,
    pub overall: bool,
    pub overall_confidence: bool,
}

impl MatchFlags {
    /// 4項目の照合結果からフラグを組み立てる（overall は4項目すべて一致）
    pub fn from_fields(indications: bool, series: bool, model: bool, rate: bool, confident: bool) -> Self {
        Self {
            indications,
            series,
            model,
            rate,
            overall: indications && series && model && rate,
            overall_confidence: confident,
        }
    }
}
