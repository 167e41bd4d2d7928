//! Image encoding: page bitmap → base64 PNG wrapped in `ImageData`.
//!
//! PNG is lossless, which keeps small print (prices, dates) crisp; JPEG
//! artefacts around digits are a common source of misread amounts.
//! Phone photos of receipts can be 4000 px tall, so pages are first shrunk to
//! the configured longest edge.

use crate::error::ExtractionError;
use crate::pipeline::render::PageImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use std::io::Cursor;
use tracing::debug;

pub const PNG_MIME_TYPE: &str = "image/png";

/// Encode a page as a base64 PNG ready for the model request body.
///
/// Pages whose longest edge exceeds `max_edge` are downscaled (aspect ratio
/// preserved) before encoding.
pub fn encode_page(page: &PageImage, max_edge: u32) -> Result<ImageData, ExtractionError> {
    let img = &page.image;
    let resized;
    let img = if img.width().max(img.height()) > max_edge {
        resized = img.resize(max_edge, max_edge, FilterType::Triangle);
        &resized
    } else {
        img
    };

    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| ExtractionError::Render {
            page: page.page_num,
            detail: format!("PNG encoding failed: {e}"),
        })?;

    let b64 = STANDARD.encode(&buf);
    debug!(
        "Encoded page {} ({}x{}) → {} bytes base64",
        page.page_num,
        img.width(),
        img.height(),
        b64.len()
    );

    Ok(ImageData::new(b64, PNG_MIME_TYPE).with_detail("high"))
}
