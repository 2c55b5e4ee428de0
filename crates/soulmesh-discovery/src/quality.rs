//! Opaque quality scoring.

/// Scalar quality estimate for a file, 0..=100.
pub trait QualityScorer: Send + Sync {
    fn score(&self, filename: &str, size: u64) -> u8;
}

/// Guesses from the file extension alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtensionQualityScorer;

impl QualityScorer for ExtensionQualityScorer {
    fn score(&self, filename: &str, _size: u64) -> u8 {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "flac" | "alac" | "wav" | "aiff" | "ape" | "wv" => 90,
            "opus" => 75,
            "ogg" | "m4a" | "aac" => 65,
            "mp3" => 60,
            "mkv" | "mp4" | "epub" | "pdf" => 70,
            _ => 40,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossless_beats_lossy() {
        let s = ExtensionQualityScorer;
        assert!(s.score("a.FLAC", 0) > s.score("a.mp3", 0));
        assert_eq!(s.score("noext", 0), 40);
    }
}
