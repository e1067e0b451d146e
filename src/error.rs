use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeterRegressError {
    #[error("設定エラー: {0}")]
    Config(String),

    #[error("環境チェックに失敗しました:\n{}", .0.join("\n"))]
    InvalidEnvironment(Vec<String>),

    #[error("ファイルが見つかりません: {0}")]
    FileNotFound(String),

    #[error("フォルダが見つかりません: {0}")]
    FolderNotFound(String),

    #[error("画像が見つかりません: {0}")]
    NoImagesFound(String),

    #[error("データセットが不正: {0}")]
    InvalidDataset(String),

    #[error("行が存在しません: {0}")]
    RowNotFound(usize),

    #[error("共有テーブルのロックが破損しています")]
    LockPoisoned,

    #[error("Excel読み込みエラー: {0}")]
    ExcelRead(#[from] calamine::Error),

    #[error("Excel書き込みエラー: {0}")]
    ExcelWrite(#[from] rust_xlsxwriter::XlsxError),

    #[error("HTTPエラー: {0}")]
    Http(#[from] reqwest::Error),

    #[error("画像読み込みエラー: {0}")]
    ImageLoad(String),

    #[error("結果の保存に失敗: {0}")]
    Persistence(String),

    #[error("JSON解析エラー: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] meter_regress_common::Error),
}

pub type Result<T> = std::result::Result<T, MeterRegressError>;
