use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use std::io::{Read, Write};
use std::path::Path;

use crate::errors::{AppError, AppResult};
use crate::models::TextMetadata;
use crate::security::InputValidator;

const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

/// Text values longer than this go into a compressed zTXt chunk.
const ZTXT_THRESHOLD: usize = 1024;

/// One image of a batch together with its position in that batch.
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub index: usize,
    pub image: DynamicImage,
}

impl ImageItem {
    pub fn new(index: usize, image: DynamicImage) -> Self {
        Self { index, image }
    }

    /// Number a list of images 0..n in order.
    pub fn batch(images: Vec<DynamicImage>) -> Vec<ImageItem> {
        images
            .into_iter()
            .enumerate()
            .map(|(index, image)| ImageItem::new(index, image))
            .collect()
    }

    /// Build from interleaved 8-bit pixels with 1, 3 or 4 channels.
    pub fn from_raw(
        index: usize,
        width: u32,
        height: u32,
        channels: u8,
        pixels: Vec<u8>,
    ) -> AppResult<Self> {
        let image = match channels {
            1 => GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
            3 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
            4 => RgbaImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgba8),
            _ => {
                return Err(AppError::validation(
                    "channels",
                    "Only 1, 3 or 4 channels are supported",
                ))
            }
        }
        .ok_or_else(|| {
            AppError::validation("pixels", "Pixel buffer does not match width x height x channels")
        })?;

        Ok(Self::new(index, image))
    }

    /// Build from a float tensor laid out H x W x C with values nominally in
    /// [0, 1]. Values are scaled by 255 and clamped.
    pub fn from_float_tensor(
        index: usize,
        width: u32,
        height: u32,
        channels: u8,
        data: &[f32],
    ) -> AppResult<Self> {
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(AppError::validation(
                "tensor",
                &format!("Expected {} values, got {}", expected, data.len()),
            ));
        }

        let pixels = data.iter().map(|&v| float_to_u8(v)).collect();
        Self::from_raw(index, width, height, channels, pixels)
    }
}

fn float_to_u8(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    (value * 255.0).clamp(0.0, 255.0) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Jpeg { quality: u8 },
    WebP,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Png
    }
}

impl OutputFormat {
    pub fn parse(name: &str, jpeg_quality: u8) -> AppResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => {
                if jpeg_quality == 0 || jpeg_quality > 100 {
                    return Err(AppError::validation(
                        "quality",
                        "Quality must be between 1 and 100",
                    ));
                }
                Ok(OutputFormat::Jpeg {
                    quality: jpeg_quality,
                })
            }
            "webp" => Ok(OutputFormat::WebP),
            other => Err(AppError::validation(
                "output_format",
                &format!("Unsupported output format '{}'", other),
            )),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg { .. } => "jpg",
            OutputFormat::WebP => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg { .. } => "image/jpeg",
            OutputFormat::WebP => "image/webp",
        }
    }

    pub fn supports_text_metadata(&self) -> bool {
        matches!(self, OutputFormat::Png)
    }
}

/// Encode `image` into `format`. Metadata is embedded when the format can
/// carry it and silently dropped (with a warning) otherwise.
pub fn encode_image(
    image: &DynamicImage,
    format: OutputFormat,
    metadata: &TextMetadata,
) -> AppResult<Vec<u8>> {
    let mut output = Vec::new();

    match format {
        OutputFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut output,
                CompressionType::Default,
                FilterType::Adaptive,
            );
            image.write_with_encoder(encoder)?;
        }
        OutputFormat::Jpeg { quality } => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut output, quality);
            rgb.write_with_encoder(encoder)?;
        }
        OutputFormat::WebP => {
            let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
            let encoder = WebPEncoder::new_lossless(&mut output);
            rgba.write_with_encoder(encoder)?;
        }
    }

    if metadata.is_empty() {
        return Ok(output);
    }

    if !format.supports_text_metadata() {
        log::warn!(
            "{} output cannot carry text metadata; uploading without {} metadata entries",
            format.extension(),
            metadata.len()
        );
        return Ok(output);
    }

    embed_text_chunks(&output, metadata)
}

/// Insert one text chunk per metadata entry ahead of the first IDAT chunk.
/// Entries whose keyword PNG cannot store are skipped, not fatal.
pub fn embed_text_chunks(png_data: &[u8], metadata: &TextMetadata) -> AppResult<Vec<u8>> {
    if png_data.len() < 8 || png_data[0..8] != PNG_SIGNATURE {
        return Err(AppError::validation("png", "Not a valid PNG file"));
    }

    let mut text_chunks = Vec::new();
    for (keyword, text) in metadata.iter() {
        if let Err(e) = InputValidator::validate_text_keyword(keyword) {
            log::warn!("Skipping metadata entry '{}': {}", keyword, e);
            continue;
        }
        if text.len() > ZTXT_THRESHOLD {
            write_ztxt_chunk(&mut text_chunks, keyword, text)?;
        } else {
            write_text_chunk(&mut text_chunks, keyword, text);
        }
    }

    let mut result = Vec::with_capacity(png_data.len() + text_chunks.len());
    result.extend_from_slice(&PNG_SIGNATURE);

    let mut inserted = false;
    for chunk in PngChunks::new(png_data) {
        let chunk = chunk?;
        if !inserted && (chunk.kind == *b"IDAT" || chunk.kind == *b"IEND") {
            result.extend_from_slice(&text_chunks);
            inserted = true;
        }
        result.extend_from_slice(chunk.raw);
    }

    if !inserted {
        return Err(AppError::validation("png", "PNG has no IDAT or IEND chunk"));
    }

    Ok(result)
}

/// Read every tEXt, zTXt and iTXt entry as (keyword, text).
pub fn read_text_chunks(png_data: &[u8]) -> AppResult<Vec<(String, String)>> {
    if png_data.len() < 8 || png_data[0..8] != PNG_SIGNATURE {
        return Err(AppError::validation("png", "Not a valid PNG file"));
    }

    let mut entries = Vec::new();
    for chunk in PngChunks::new(png_data) {
        let chunk = chunk?;
        let parsed = match &chunk.kind {
            b"tEXt" => parse_text_chunk(chunk.data),
            b"zTXt" => parse_ztxt_chunk(chunk.data),
            b"iTXt" => parse_itxt_chunk(chunk.data),
            _ => None,
        };
        match parsed {
            Some(entry) => entries.push(entry),
            None if matches!(&chunk.kind, b"tEXt" | b"zTXt" | b"iTXt") => {
                log::debug!(
                    "Could not decode {} chunk",
                    String::from_utf8_lossy(&chunk.kind)
                );
            }
            None => {}
        }
    }

    Ok(entries)
}

struct PngChunk<'a> {
    kind: [u8; 4],
    data: &'a [u8],
    /// Length, type, data and CRC exactly as they appear in the file.
    raw: &'a [u8],
}

struct PngChunks<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> PngChunks<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 8,
            done: false,
        }
    }
}

impl<'a> Iterator for PngChunks<'a> {
    type Item = AppResult<PngChunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.data.len() {
            return None;
        }

        let pos = self.pos;
        if pos + 8 > self.data.len() {
            self.done = true;
            return Some(Err(AppError::validation("png", "Truncated chunk header")));
        }

        let length = u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]) as usize;
        let kind = [
            self.data[pos + 4],
            self.data[pos + 5],
            self.data[pos + 6],
            self.data[pos + 7],
        ];

        // 4 length + 4 type + data + 4 CRC
        let end = pos + 12 + length;
        if end > self.data.len() {
            self.done = true;
            return Some(Err(AppError::validation("png", "Truncated chunk data")));
        }

        self.pos = end;
        if &kind == b"IEND" {
            self.done = true;
        }

        Some(Ok(PngChunk {
            kind,
            data: &self.data[pos + 8..pos + 8 + length],
            raw: &self.data[pos..end],
        }))
    }
}

fn write_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);

    let mut crc = Crc::new();
    crc.update(kind);
    crc.update(data);
    out.extend_from_slice(&crc.sum().to_be_bytes());
}

/// PNG text is Latin-1; characters outside it become '?'.
fn to_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u32 as u8 } else { b'?' })
        .collect()
}

fn from_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn write_text_chunk(out: &mut Vec<u8>, keyword: &str, text: &str) {
    let mut data = to_latin1(keyword);
    data.push(0);
    data.extend_from_slice(&to_latin1(text));
    write_chunk(out, b"tEXt", &data);
}

fn write_ztxt_chunk(out: &mut Vec<u8>, keyword: &str, text: &str) -> AppResult<()> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&to_latin1(text))?;
    let compressed = encoder.finish()?;

    let mut data = to_latin1(keyword);
    data.push(0);
    data.push(0); // compression method: deflate
    data.extend_from_slice(&compressed);
    write_chunk(out, b"zTXt", &data);
    Ok(())
}

fn parse_text_chunk(data: &[u8]) -> Option<(String, String)> {
    // keyword\0text
    let null_pos = data.iter().position(|&b| b == 0)?;
    Some((from_latin1(&data[..null_pos]), from_latin1(&data[null_pos + 1..])))
}

fn parse_ztxt_chunk(data: &[u8]) -> Option<(String, String)> {
    // keyword\0method compressed
    let null_pos = data.iter().position(|&b| b == 0)?;
    if data.get(null_pos + 1) != Some(&0) {
        return None;
    }
    let text = inflate(&data[null_pos + 2..])?;
    Some((from_latin1(&data[..null_pos]), from_latin1(&text)))
}

fn parse_itxt_chunk(data: &[u8]) -> Option<(String, String)> {
    // keyword\0 flag method language\0 translated\0 text
    let keyword_end = data.iter().position(|&b| b == 0)?;
    let keyword = from_latin1(&data[..keyword_end]);
    let compressed = *data.get(keyword_end + 1)? == 1;

    let rest = data.get(keyword_end + 3..)?;
    let language_end = rest.iter().position(|&b| b == 0)?;
    let rest = &rest[language_end + 1..];
    let translated_end = rest.iter().position(|&b| b == 0)?;
    let text = &rest[translated_end + 1..];

    let text = if compressed {
        inflate(text)?
    } else {
        text.to_vec()
    };
    String::from_utf8(text).ok().map(|t| (keyword, t))
}

fn inflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::new();
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => Some(decompressed),
        Err(e) => {
            log::warn!("Failed to decompress text chunk: {}", e);
            None
        }
    }
}

/// MIME type for a pre-encoded file, by extension.
pub fn mime_type_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Load an image from disk for the command-line batch path.
pub fn load_image(path: &Path) -> AppResult<DynamicImage> {
    if !path.exists() {
        return Err(AppError::file_not_found(&path.to_string_lossy()));
    }
    Ok(image::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, image::Rgb([10, 200, 30])))
    }

    #[test]
    fn test_float_tensor_is_scaled_and_clamped() {
        let data = [0.0, 0.5, 1.0, -2.0, 3.0, f32::NAN];
        let item = ImageItem::from_float_tensor(0, 2, 1, 3, &data).unwrap();
        let rgb = item.image.to_rgb8();

        assert_eq!(rgb.get_pixel(0, 0).0, [0, 127, 255]);
        assert_eq!(rgb.get_pixel(1, 0).0, [0, 255, 0]);
    }

    #[test]
    fn test_float_tensor_shape_mismatch() {
        assert!(ImageItem::from_float_tensor(0, 2, 2, 3, &[0.0; 5]).is_err());
        assert!(ImageItem::from_raw(0, 1, 1, 2, vec![0, 0]).is_err());
    }

    #[test]
    fn test_batch_assigns_indices_in_order() {
        let items = ImageItem::batch(vec![sample_image(), sample_image(), sample_image()]);
        let indices: Vec<usize> = items.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_png_metadata_can_be_read_back() {
        let mut metadata = TextMetadata::new();
        metadata.insert_json("prompt", &serde_json::json!({"3": {"class_type": "KSampler"}}));
        metadata.insert("workflow", "x".repeat(ZTXT_THRESHOLD + 10));

        let png = encode_image(&sample_image(), OutputFormat::Png, &metadata).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 4);

        let entries = read_text_chunks(&png).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "prompt");
        assert!(entries[0].1.contains("KSampler"));
        assert_eq!(entries[1].1.len(), ZTXT_THRESHOLD + 10);
    }

    #[test]
    fn test_invalid_keyword_is_skipped_not_fatal() {
        let mut metadata = TextMetadata::new();
        metadata.insert(&"k".repeat(100), "dropped");
        metadata.insert("kept", "yes");

        let png = encode_image(&sample_image(), OutputFormat::Png, &metadata).unwrap();
        let entries = read_text_chunks(&png).unwrap();
        assert_eq!(entries, vec![("kept".to_string(), "yes".to_string())]);
    }

    #[test]
    fn test_jpeg_ignores_metadata() {
        let mut metadata = TextMetadata::new();
        metadata.insert("prompt", "ignored");

        let jpeg = encode_image(
            &sample_image(),
            OutputFormat::Jpeg { quality: 80 },
            &metadata,
        )
        .unwrap();
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_webp_encodes() {
        let webp = encode_image(&sample_image(), OutputFormat::WebP, &TextMetadata::new()).unwrap();
        assert_eq!(&webp[0..4], b"RIFF");
    }

    #[test]
    fn test_embed_rejects_non_png() {
        let mut metadata = TextMetadata::new();
        metadata.insert("a", "b");
        assert!(embed_text_chunks(b"not a png", &metadata).is_err());
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!(OutputFormat::parse("PNG", 90).unwrap(), OutputFormat::Png);
        assert_eq!(
            OutputFormat::parse("jpg", 75).unwrap(),
            OutputFormat::Jpeg { quality: 75 }
        );
        assert!(OutputFormat::parse("jpeg", 0).is_err());
        assert!(OutputFormat::parse("bmp", 90).is_err());
        assert_eq!(OutputFormat::WebP.mime_type(), "image/webp");
    }

    #[test]
    fn test_mime_type_for_path() {
        assert_eq!(mime_type_for_path(Path::new("clip.MP4")), "video/mp4");
        assert_eq!(mime_type_for_path(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(
            mime_type_for_path(Path::new("noext")),
            "application/octet-stream"
        );
    }
}
