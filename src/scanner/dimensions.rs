use crate::error::{MeterRegressError, Result};
use std::path::Path;

/// 画像の幅・高さ（px）をヘッダから取得
pub fn read_dimensions(path: &Path) -> Result<(u32, u32)> {
    image::image_dimensions(path)
        .map_err(|e| MeterRegressError::ImageLoad(format!("{}: {}", path.display(), e)))
}
