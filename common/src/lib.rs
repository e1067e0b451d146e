//! Meter Regress Common Library
//!
//! CLIハーネスで共有される型と純粋ロジック（I/Oなし）

pub mod accuracy;
pub mod comparator;
pub mod error;
pub mod parser;
pub mod types;

pub use accuracy::{build_summary, calculate_accuracy, AccuracyStats, FieldAccuracy, RunTotals, Summary};
pub use comparator::{generic_match, numeric_match, text_match};
pub use error::{Error, Result};
pub use parser::{extract_json_object, parse_engine_output};
pub use types::{MatchFlags, MeterReading, RecognitionResult, RecognitionStatus};
