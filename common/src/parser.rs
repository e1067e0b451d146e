//! エンジン出力パーサー
//!
//! 認識エンジンの標準出力には診断メッセージが前後に混ざるため、
//! 出力中に埋め込まれたJSONオブジェクトを探し出して認識結果に変換する。

use crate::error::{Error, Result};
use crate::types::RecognitionResult;
use regex::Regex;
use serde_json::Value;

/// 出力からJSONオブジェクトを抽出
///
/// 抽出優先順位:
/// 1. 貪欲な `{...}` 正規表現マッチ（末尾側の候補から）
/// 2. 先頭から走査して最後に読めたトップレベルのオブジェクト
/// 3. `{` で始まる最初の行から `}` を含む最初の行までの範囲
///
/// # Examples
/// ```
/// use meter_regress_common::extract_json_object;
///
/// let output = "loading model...\n{\"status\": \"completed\"}\ndone";
/// let value = extract_json_object(output).unwrap();
/// assert_eq!(value["status"], "completed");
/// ```
pub fn extract_json_object(output: &str) -> Result<Value> {
    lazy_static::lazy_static! {
        static ref OBJECT_RE: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
    }

    let candidates: Vec<&str> = OBJECT_RE.find_iter(output).map(|m| m.as_str()).collect();
    for candidate in candidates.iter().rev() {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
            return Ok(value);
        }
    }

    if let Some(value) = last_top_level_object(output) {
        return Ok(value);
    }

    if let Some(value) = line_scan_object(output) {
        return Ok(value);
    }

    Err(Error::Parse("JSON not found in output".into()))
}

/// 先頭から `{` を探し、読めたオブジェクトの直後から再開する
fn last_top_level_object(output: &str) -> Option<Value> {
    let mut last = None;
    let mut offset = 0;

    while let Some(pos) = output[offset..].find('{') {
        let start = offset + pos;
        let mut stream = serde_json::Deserializer::from_str(&output[start..]).into_iter::<Value>();

        match stream.next() {
            Some(Ok(value @ Value::Object(_))) => {
                offset = start + stream.byte_offset();
                last = Some(value);
            }
            _ => offset = start + 1,
        }
    }

    last
}

fn line_scan_object(output: &str) -> Option<Value> {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.iter().position(|line| line.trim().starts_with('{'))?;
    let end = start + lines[start..].iter().position(|line| line.contains('}'))?;

    let joined = lines[start..=end].join("\n");
    serde_json::from_str::<Value>(&joined)
        .ok()
        .filter(Value::is_object)
}

/// エンジンの標準出力を認識結果に変換
///
/// JSONが見つからない場合もエラーではなく失敗結果を返す。
pub fn parse_engine_output(output: &str) -> RecognitionResult {
    match extract_json_object(output) {
        Ok(value) => RecognitionResult::from_engine_value(&value),
        Err(_) => RecognitionResult::failure("JSON not found in output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =============================================
    // extract_json_object テスト
    // =============================================

    #[test]
    fn test_extract_plain_object() {
        let value = extract_json_object(r#"{"status": "completed", "meter_reading": "1"}"#).unwrap();
        assert_eq!(value["meter_reading"], "1");
    }

    #[test]
    fn test_extract_with_noise_around() {
        let output = "INFO model loaded\nWARN low light\n{\n  \"status\": \"completed\",\n  \"model\": \"X-200\"\n}\nbye";
        let value = extract_json_object(output).unwrap();
        assert_eq!(value["model"], "X-200");
    }

    #[test]
    fn test_extract_last_of_several_objects() {
        let output = "{\"stage\": \"preprocess\"}\nprogress 50%\n{\"status\": \"completed\", \"rate\": \"T2\"}";
        let value = extract_json_object(output).unwrap();
        assert_eq!(value["rate"], "T2");
    }

    #[test]
    fn test_extract_nested_object() {
        let output = "debug {not json\n{\"status\": \"completed\", \"timing\": {\"total\": 1.5}}";
        let value = extract_json_object(output).unwrap();
        assert_eq!(value["timing"]["total"], 1.5);
    }

    #[test]
    fn test_extract_with_trailing_brace_noise() {
        let output = "{\"status\": \"failed\", \"error\": \"blur\"}\ntrailing } brace";
        let value = extract_json_object(output).unwrap();
        assert_eq!(value["error"], "blur");
    }

    #[test]
    fn test_line_scan_object() {
        let output = "header\n  {\"status\": \"completed\",\n \"rate\": \"T1\"}\nfooter }";
        let value = line_scan_object(output).unwrap();
        assert_eq!(value["rate"], "T1");
        assert!(line_scan_object("no braces").is_none());
    }

    #[test]
    fn test_extract_error_when_missing() {
        let result = extract_json_object("no json here");
        assert!(matches!(result, Err(Error::Parse(_))));
        assert!(extract_json_object("").is_err());
    }

    // =============================================
    // parse_engine_output テスト
    // =============================================

    #[test]
    fn test_parse_engine_output_completed() {
        let output = "noise\n{\"status\": \"completed\", \"meter_reading\": \"00123,4\", \"serial_number_confidence\": 0.5}";
        let result = parse_engine_output(output);
        assert!(result.is_completed());
        assert_eq!(result.meter_reading, "00123,4");
        assert_eq!(result.overall_confidence, 0.5);
    }

    #[test]
    fn test_parse_engine_output_without_json() {
        let result = parse_engine_output("Traceback (most recent call last)");
        assert!(!result.is_completed());
        assert_eq!(result.error_message(), "JSON not found in output");
    }
}
