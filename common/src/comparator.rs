//! 認識値と参照値の照合ルール
//!
//! - `numeric_match`: 指示値（数値）用。OCRの桁ノイズを吸収する許容幅 0.1
//! - `text_match`: シリアル番号・型式・料金区分用。区切り文字と同形異字を正規化
//! - `generic_match`: 旧レポート用の単純比較（許容幅 0.001、失敗時は文字列一致）
//!
//! 空値・欠損値はどのルールでも一致しない（両方空でも不一致）。

/// 数値比較の許容幅
pub const NUMERIC_TOLERANCE: f64 = 0.1;

/// 旧ルールの数値比較許容幅
pub const GENERIC_TOLERANCE: f64 = 0.001;

/// 差の比較に使う固定小数点の桁（10^-9 まで）
const DECIMAL_SCALE: f64 = 1e9;

/// |a - b| が許容幅未満か
///
/// 浮動小数点の誤差で 10 と 10.1 の差が 0.1 未満にならないよう、
/// 差と許容幅を 10^-9 単位の整数に丸めてから比較する。
fn within_tolerance(a: f64, b: f64, tolerance: f64) -> bool {
    ((a - b).abs() * DECIMAL_SCALE).round() < (tolerance * DECIMAL_SCALE).round()
}

/// 小数点にカンマを許容して有限の数値にパースする
///
/// # Examples
/// ```
/// use meter_regress_common::comparator::parse_number;
///
/// assert_eq!(parse_number(" 12,5 "), Some(12.5));
/// assert_eq!(parse_number("abc"), None);
/// ```
pub fn parse_number(value: &str) -> Option<f64> {
    let cleaned = value.trim().replace(',', ".");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// 数値として一致するか（|a - b| < 0.1）
pub fn numeric_match(recognized: &str, reference: &str) -> bool {
    match (parse_number(recognized), parse_number(reference)) {
        (Some(a), Some(b)) => within_tolerance(a, b, NUMERIC_TOLERANCE),
        _ => false,
    }
}

/// 比較用にテキストを正規化
///
/// 小文字化・トリム後、空白/ハイフン/アンダースコアを削除し、
/// キリル文字の х/с/о をラテン文字に揃える。
pub fn normalize_text(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_'))
        .map(|c| match c {
            'х' | 'Х' => 'x',
            'с' | 'С' => 'c',
            'о' | 'О' => 'o',
            other => other,
        })
        .collect()
}

/// 正規化後のテキストが一致するか
pub fn text_match(recognized: &str, reference: &str) -> bool {
    let recognized = normalize_text(recognized);
    let reference = normalize_text(reference);

    if recognized.is_empty() || reference.is_empty() {
        return false;
    }

    recognized == reference
}

/// 旧ルールでの比較
///
/// どちらかが欠損なら `None`。数値として読めれば許容幅 0.001 で比較し、
/// 読めなければトリム後の完全一致で判定する。
pub fn generic_match(recognized: Option<&str>, reference: Option<&str>) -> Option<bool> {
    let recognized = recognized?.trim();
    let reference = reference?.trim();

    if recognized.is_empty() || reference.is_empty() {
        return Some(false);
    }

    if let (Some(a), Some(b)) = (parse_number(recognized), parse_number(reference)) {
        return Some(within_tolerance(a, b, GENERIC_TOLERANCE));
    }

    Some(recognized == reference)
}
