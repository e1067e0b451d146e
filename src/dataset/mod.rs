//! 参照値・認識結果のテーブル
//!
//! スプレッドシート1行 = テスト画像1枚。固定の列（参照値・認識値・照合フラグ）と、
//! エンジンが返す任意属性を入れる `extras` で構成する。
//! ワーカー間で共有する場合は [`SharedTable`] 経由で排他的に更新する。

pub mod excel;
pub mod template;

use crate::error::{MeterRegressError, Result};
use meter_regress_common::{calculate_accuracy, AccuracyStats, MatchFlags, Summary};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// 認識失敗時に指示値列へ書き込む接頭辞
pub const ERROR_PREFIX: &str = "ERROR:";

/// 処理時間列の接頭辞（例: "Timing Total"）
pub const TIMING_PREFIX: &str = "Timing ";

/// 参照値（読み込み後は不変）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceValues {
    pub indications: String,
    pub series: String,
    pub model: String,
    pub rate: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub filename: String,
    pub reference: ReferenceValues,
    pub indications: String,
    pub series_number: String,
    pub model: String,
    pub rate: String,
    pub overall_confidence: Option<f64>,
    /// 認識結果が書き込まれ、エラーでない行のみ Some
    pub matches: Option<MatchFlags>,
    pub extras: BTreeMap<String, String>,
}

impl Row {
    pub fn new(filename: impl Into<String>, reference: ReferenceValues) -> Self {
        Self {
            filename: filename.into(),
            reference,
            ..Default::default()
        }
    }

    pub fn has_error(&self) -> bool {
        self.indications.starts_with(ERROR_PREFIX)
    }

    /// 4項目すべて埋まっていてエラーでなければ処理済み
    pub fn is_processed(&self) -> bool {
        let filled = [&self.indications, &self.series_number, &self.model, &self.rate]
            .iter()
            .all(|v| !v.trim().is_empty());
        filled && !self.has_error()
    }
}

/// 列の指定
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Filename,
    RefIndications,
    RefSeries,
    RefModel,
    RefRate,
    Indications,
    SeriesNumber,
    Model,
    Rate,
    OverallConfidence,
    Extra(String),
}

/// エンジンの計測名から列名を作る（"total" → "Timing Total"）
pub fn timing_column(name: &str) -> String {
    let words: Vec<String> = name
        .split(|c| c == '_' || c == ' ')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    format!("{}{}", TIMING_PREFIX, words.join(" "))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    rows: Vec<Row>,
    /// 追加列（最初に現れた順）
    extra_columns: Vec<String>,
}

impl Table {
    pub fn new(rows: Vec<Row>) -> Self {
        let mut table = Self {
            rows: Vec::new(),
            extra_columns: Vec::new(),
        };
        for row in rows {
            table.push(row);
        }
        table
    }

    pub fn push(&mut self, row: Row) {
        for key in row.extras.keys() {
            self.register_extra_column(key);
        }
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    pub fn register_extra_column(&mut self, name: &str) {
        if !self.extra_columns.iter().any(|c| c == name) {
            self.extra_columns.push(name.to_string());
        }
    }

    pub fn row(&self, row_id: usize) -> Result<&Row> {
        self.rows.get(row_id).ok_or(MeterRegressError::RowNotFound(row_id))
    }

    pub fn row_mut(&mut self, row_id: usize) -> Result<&mut Row> {
        self.rows.get_mut(row_id).ok_or(MeterRegressError::RowNotFound(row_id))
    }

    pub fn get(&self, row_id: usize, field: &Field) -> Result<String> {
        let row = self.row(row_id)?;
        let value = match field {
            Field::Filename => row.filename.clone(),
            Field::RefIndications => row.reference.indications.clone(),
            Field::RefSeries => row.reference.series.clone(),
            Field::RefModel => row.reference.model.clone(),
            Field::RefRate => row.reference.rate.clone(),
            Field::Indications => row.indications.clone(),
            Field::SeriesNumber => row.series_number.clone(),
            Field::Model => row.model.clone(),
            Field::Rate => row.rate.clone(),
            Field::OverallConfidence => row
                .overall_confidence
                .map(|c| c.to_string())
                .unwrap_or_default(),
            Field::Extra(name) => row.extras.get(name).cloned().unwrap_or_default(),
        };
        Ok(value)
    }

    /// 1セルを更新（ファイル名列・参照値列は変更不可）
    pub fn set(&mut self, row_id: usize, field: Field, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        if let Field::Extra(name) = &field {
            self.register_extra_column(name);
        }

        let row = self.row_mut(row_id)?;
        match field {
            Field::Indications => row.indications = value,
            Field::SeriesNumber => row.series_number = value,
            Field::Model => row.model = value,
            Field::Rate => row.rate = value,
            Field::OverallConfidence => {
                row.overall_confidence = value.trim().parse::<f64>().ok();
            }
            Field::Extra(name) => {
                row.extras.insert(name, value);
            }
            Field::Filename
            | Field::RefIndications
            | Field::RefSeries
            | Field::RefModel
            | Field::RefRate => {
                return Err(MeterRegressError::InvalidDataset(format!(
                    "読み取り専用の列は変更できません: {:?}",
                    field
                )));
            }
        }
        Ok(())
    }

    pub fn is_processed(&self, row_id: usize) -> Result<bool> {
        Ok(self.row(row_id)?.is_processed())
    }

    /// ファイル名 → 行番号
    ///
    /// 同名の行が複数ある場合は後の行が優先される（先の行は警告を出して除外）。
    pub fn build_filename_index(&self) -> HashMap<String, usize> {
        let mut index = HashMap::with_capacity(self.rows.len());

        for (row_id, row) in self.rows.iter().enumerate() {
            let name = row.filename.trim();
            if name.is_empty() {
                continue;
            }
            if let Some(previous) = index.insert(name.to_string(), row_id) {
                tracing::warn!(
                    "ファイル名が重複しています: {} (行 {} は行 {} で上書き)",
                    name,
                    previous + 1,
                    row_id + 1
                );
            }
        }

        index
    }

    /// 全行の照合フラグから精度を集計
    pub fn accuracy(&self) -> AccuracyStats {
        calculate_accuracy(self.rows.iter().map(|row| row.matches.as_ref()))
    }
}

/// テーブルの保存先（チェックポイント・最終保存）
pub trait TableSink: Send + Sync {
    fn save(&self, table: &Table) -> Result<()>;

    /// 実行終了時の保存（サマリーを添えられる保存先は上書きする）
    fn save_final(&self, table: &Table, _summary: &Summary) -> Result<()> {
        self.save(table)
    }
}

/// ワーカー間で共有するテーブル
///
/// ロック区間はフィールド代入のみに限定し、I/Oはロック外で行う。
#[derive(Debug, Default)]
pub struct SharedTable {
    inner: Mutex<Table>,
}

impl SharedTable {
    pub fn new(table: Table) -> Self {
        Self {
            inner: Mutex::new(table),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Table>> {
        self.inner.lock().map_err(|_| MeterRegressError::LockPoisoned)
    }

    /// 読み取り専用でテーブルにアクセス
    pub fn read<R>(&self, f: impl FnOnce(&Table) -> R) -> Result<R> {
        let guard = self.lock()?;
        Ok(f(&guard))
    }

    /// 排他でテーブルを更新（複数フィールドの書き込みを1区間で行う）
    pub fn update<R>(&self, f: impl FnOnce(&mut Table) -> Result<R>) -> Result<R> {
        let mut guard = self.lock()?;
        f(&mut guard)
    }

    pub fn get(&self, row_id: usize, field: &Field) -> Result<String> {
        self.lock()?.get(row_id, field)
    }

    pub fn set(&self, row_id: usize, field: Field, value: impl Into<String>) -> Result<()> {
        self.lock()?.set(row_id, field, value)
    }

    pub fn is_processed(&self, row_id: usize) -> Result<bool> {
        self.lock()?.is_processed(row_id)
    }

    /// 保存用のスナップショット（ロックはコピーの間だけ保持）
    pub fn snapshot(&self) -> Result<Table> {
        Ok(self.lock()?.clone())
    }
}
