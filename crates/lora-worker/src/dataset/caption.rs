use std::path::{Path, PathBuf};

/// Caption text for one dataset item: the trigger token, optionally followed
/// by a fixed description.
pub fn caption_text(trigger: &str, description: Option<&str>) -> String {
    match description.map(str::trim).filter(|d| !d.is_empty()) {
        Some(description) => format!("{}, {}", trigger.trim(), description),
        None => trigger.trim().to_string(),
    }
}

/// `<dir>/<stem>.txt` next to the image.
pub fn caption_path(image: &Path) -> PathBuf {
    image.with_extension("txt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caption_text() {
        assert_eq!(caption_text("sf_abc", None), "sf_abc");
        assert_eq!(caption_text("sf_abc", Some("  ")), "sf_abc");
        assert_eq!(
            caption_text("sf_abc", Some("a photo of a person")),
            "sf_abc, a photo of a person"
        );
    }

    #[test]
    fn test_caption_path() {
        assert_eq!(
            caption_path(Path::new("/d/120_concept/img_1.JPG")),
            PathBuf::from("/d/120_concept/img_1.txt")
        );
    }
}
