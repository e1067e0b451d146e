//! 画像フォルダからデータセットの雛形を作る

use super::{Field, ReferenceValues, Row, Table};
use crate::error::Result;
use crate::scanner::{read_dimensions, ImageInfo};

pub const COL_WIDTH: &str = "Width";
pub const COL_HEIGHT: &str = "Height";
pub const COL_TOTAL_PIXELS: &str = "Total Pixels";

/// 1画像1行、参照値は空。画素数が読めない画像は寸法列を空にする
pub fn build_template(images: &[ImageInfo]) -> Result<Table> {
    let mut table = Table::default();
    for column in [COL_WIDTH, COL_HEIGHT, COL_TOTAL_PIXELS] {
        table.register_extra_column(column);
    }

    for (row_id, image) in images.iter().enumerate() {
        table.push(Row::new(image.file_name.clone(), ReferenceValues::default()));

        match read_dimensions(&image.path) {
            Ok((width, height)) => {
                table.set(row_id, Field::Extra(COL_WIDTH.into()), width.to_string())?;
                table.set(row_id, Field::Extra(COL_HEIGHT.into()), height.to_string())?;
                let total = u64::from(width) * u64::from(height);
                table.set(row_id, Field::Extra(COL_TOTAL_PIXELS.into()), total.to_string())?;
            }
            Err(e) => tracing::warn!("{}: {}", image.file_name, e),
        }
    }

    Ok(table)
}
