//! YouTube URL recognition.
//!
//! Accepted forms are `youtube.com/watch?v=`, `youtube.com/embed/`,
//! `youtube.com/v/` and `youtu.be/`, each with an optional `http(s)://` and
//! `www.` in front.

use std::sync::LazyLock;

use regex::Regex;

pub const VIDEO_ID_LEN: usize = 11;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://)?(?:www\.)?(?:youtube\.com/(?:watch\?v=|embed/|v/)|youtu\.be/)[A-Za-z0-9_-]+")
        .expect("url pattern compiles")
});

static VIDEO_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/(?:watch\?v=|embed/|v/)|youtu\.be/)([A-Za-z0-9_-]{11})")
        .expect("video id pattern compiles")
});

/// Whether `url` looks like a YouTube video link.
pub fn validate_url(url: &str) -> bool {
    URL_PATTERN.is_match(url.trim())
}

/// Returns the 11-character video id, or `None` when the URL does not carry
/// one in a recognised position.
pub fn extract_video_id(url: &str) -> Option<String> {
    VIDEO_ID_PATTERN
        .captures(url.trim())
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}

/// Canonical watch URL handed to the extractor.
pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_supported_forms() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "http://youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "www.youtube.com/embed/dQw4w9WgXcQ",
            "youtube.com/v/dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "youtu.be/dQw4w9WgXcQ?si=abc",
            "  https://youtu.be/dQw4w9WgXcQ  ",
        ] {
            assert!(validate_url(url), "{url} should be accepted");
        }
    }

    #[test]
    fn rejects_other_inputs() {
        for url in [
            "",
            "not a url",
            "https://vimeo.com/123456",
            "https://www.youtube.com/",
            "https://www.youtube.com/watch?v=",
            "https://www.youtube.com/channel/UC123",
            "ftp://youtube.com/watch?v=dQw4w9WgXcQ",
            "https://evil.example/?u=youtube.com/watch?v=dQw4w9WgXcQ",
        ] {
            assert!(!validate_url(url), "{url} should be rejected");
        }
    }

    #[test]
    fn extracts_canonical_id() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            extract_video_id("https://youtu.be/a-b_c1234XY?t=3").as_deref(),
            Some("a-b_c1234XY")
        );
        assert_eq!(
            extract_video_id("youtube.com/embed/dQw4w9WgXcQextra").as_deref(),
            Some("dQw4w9WgXcQ")
        );
    }

    #[test]
    fn valid_url_with_short_id_has_no_identifier() {
        let url = "https://youtu.be/abc";
        assert!(validate_url(url));
        assert_eq!(extract_video_id(url), None);
    }

    #[test]
    fn extracted_ids_are_eleven_safe_characters() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "youtu.be/0123456789_-more",
            "https://www.youtube.com/v/ABCDEFGHIJK",
        ] {
            let id = extract_video_id(url).unwrap();
            assert_eq!(id.len(), VIDEO_ID_LEN);
            assert!(
                id.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
        }
    }

    #[test]
    fn builds_watch_url() {
        assert_eq!(
            watch_url("dQw4w9WgXcQ"),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }
}
