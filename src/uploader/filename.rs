use std::path::Path;

use crate::security::InputValidator;

pub const BATCH_NUM_PLACEHOLDER: &str = "%batch_num%";

/// Eight hex characters that keep concurrent runs from colliding.
pub fn unique_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `{template with %batch_num% = index}_{index:05}[_{suffix}].{extension}`
pub fn render_filename(
    template: &str,
    index: usize,
    suffix: Option<&str>,
    extension: &str,
) -> String {
    let prefix = template.replace(BATCH_NUM_PLACEHOLDER, &index.to_string());
    let stem = match suffix {
        Some(suffix) => format!("{}_{:05}_{}", prefix, index, suffix),
        None => format!("{}_{:05}", prefix, index),
    };
    InputValidator::sanitize_filename(&format!("{}.{}", stem, extension))
}

/// Name for a pre-encoded file: its sanitized stem, the optional suffix, and
/// the original extension.
pub fn render_file_upload_name(path: &Path, suffix: Option<&str>) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "upload".to_string());

    let mut name = match suffix {
        Some(suffix) => format!("{}_{}", stem, suffix),
        None => stem,
    };
    if let Some(extension) = path.extension() {
        name.push('.');
        name.push_str(&extension.to_string_lossy().to_lowercase());
    }
    InputValidator::sanitize_filename(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_placeholder_and_padding() {
        assert_eq!(render_filename("out_%batch_num%", 2, None, "png"), "out_2_00002.png");
        assert_eq!(
            render_filename("run", 17, Some("deadbeef"), "jpg"),
            "run_00017_deadbeef.jpg"
        );
    }

    #[test]
    fn test_unsafe_template_characters_are_replaced() {
        assert_eq!(render_filename("a/b:c", 0, None, "png"), "a_b_c_00000.png");
    }

    #[test]
    fn test_unique_suffix_shape() {
        let suffix = unique_suffix();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(suffix, unique_suffix());
    }

    #[test]
    fn test_file_upload_name() {
        assert_eq!(
            render_file_upload_name(Path::new("/tmp/clip final.MP4"), Some("0a1b2c3d")),
            "clip final_0a1b2c3d.mp4"
        );
        assert_eq!(render_file_upload_name(Path::new("notes"), None), "notes");
    }
}
