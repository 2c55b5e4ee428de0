//! Filename similarity and match classification.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Fuzzy similarity at or above this is a `Variant` match.
pub const VARIANT_THRESHOLD: f64 = 0.6;

/// Confidence of a metadata match on one signal.
pub const METADATA_CONFIDENCE: f64 = 0.7;

/// Confidence when both recording id and fingerprint agree.
pub const METADATA_CONFIDENCE_BOTH: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchType {
    /// Same filename and size.
    Exact,
    /// Same recording id or fingerprint, different file.
    Metadata,
    /// Similar filename.
    Variant,
}

impl MatchType {
    /// Lower is stronger.
    pub fn rank(&self) -> u8 {
        match self {
            MatchType::Exact => 0,
            MatchType::Metadata => 1,
            MatchType::Variant => 2,
        }
    }
}

/// Lowercase, drop the directory and extension, fold separators to spaces.
pub fn normalize_stem(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let stem = match base.rfind('.') {
        Some(i) if i > 0 && base.len() - i <= 6 => &base[..i],
        _ => base,
    };
    let folded: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_lowercase().next().unwrap_or(c) } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tokens(stem: &str) -> HashSet<&str> {
    stem.split_whitespace().collect()
}

pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let inter = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    inter / union
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// 0..=1 similarity of two filenames: mean of token Jaccard and
/// normalized Levenshtein over the normalized stems.
pub fn filename_similarity(a: &str, b: &str) -> f64 {
    let sa = normalize_stem(a);
    let sb = normalize_stem(b);
    let max_len = sa.chars().count().max(sb.chars().count());
    let edit = if max_len == 0 {
        1.0
    } else {
        1.0 - levenshtein(&sa, &sb) as f64 / max_len as f64
    };
    0.5 * jaccard(&sa, &sb) + 0.5 * edit
}

/// Signals describing one side of a comparison.
#[derive(Debug, Clone, Copy)]
pub struct MatchSignals<'a> {
    pub filename: &'a str,
    pub size: u64,
    pub recording_id: Option<&'a str>,
    pub fingerprint: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub match_type: MatchType,
    pub similarity: f64,
    pub metadata_confidence: f64,
}

fn same(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if !x.is_empty() && x.eq_ignore_ascii_case(y))
}

/// Classify `found` against `wanted`; `None` when it is not a match at all.
pub fn classify(wanted: &MatchSignals<'_>, found: &MatchSignals<'_>) -> Option<MatchResult> {
    if wanted.filename.eq_ignore_ascii_case(found.filename) && wanted.size == found.size {
        return Some(MatchResult {
            match_type: MatchType::Exact,
            similarity: 1.0,
            metadata_confidence: 1.0,
        });
    }

    let recording = same(wanted.recording_id, found.recording_id);
    let fingerprint = same(wanted.fingerprint, found.fingerprint);
    if recording || fingerprint {
        let confidence = if recording && fingerprint {
            METADATA_CONFIDENCE_BOTH
        } else {
            METADATA_CONFIDENCE
        };
        return Some(MatchResult {
            match_type: MatchType::Metadata,
            similarity: confidence,
            metadata_confidence: confidence,
        });
    }

    let similarity = filename_similarity(wanted.filename, found.filename);
    (similarity >= VARIANT_THRESHOLD).then_some(MatchResult {
        match_type: MatchType::Variant,
        similarity,
        metadata_confidence: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals<'a>(name: &'a str, size: u64, rec: Option<&'a str>, fp: Option<&'a str>) -> MatchSignals<'a> {
        MatchSignals { filename: name, size, recording_id: rec, fingerprint: fp }
    }

    #[test]
    fn stems() {
        assert_eq!(normalize_stem("Music/Artist - Song_Title.FLAC"), "artist song title");
        assert_eq!(normalize_stem(".hidden"), "hidden");
        assert_eq!(normalize_stem("no extension here"), "no extension here");
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn exact_requires_size() {
        let wanted = signals("a.flac", 10, None, None);
        let m = classify(&wanted, &signals("A.FLAC", 10, None, None)).unwrap();
        assert_eq!(m.match_type, MatchType::Exact);
        let m = classify(&wanted, &signals("a.flac", 11, None, None)).unwrap();
        assert_eq!(m.match_type, MatchType::Variant);
    }

    #[test]
    fn metadata_confidence_boosted_by_both_signals() {
        let wanted = signals("x.flac", 10, Some("rec-1"), Some("fp-1"));
        let one = classify(&wanted, &signals("other.mp3", 5, Some("rec-1"), None)).unwrap();
        assert_eq!(one.match_type, MatchType::Metadata);
        assert_eq!(one.metadata_confidence, METADATA_CONFIDENCE);
        let both = classify(&wanted, &signals("other.mp3", 5, Some("REC-1"), Some("fp-1"))).unwrap();
        assert_eq!(both.metadata_confidence, METADATA_CONFIDENCE_BOTH);
    }

    #[test]
    fn unrelated_names_do_not_match() {
        let wanted = signals("artist - song.flac", 10, None, None);
        assert!(classify(&wanted, &signals("completely different thing.mp3", 5, None, None)).is_none());
        let v = classify(&wanted, &signals("Artist - Song (remaster).mp3", 5, None, None)).unwrap();
        assert_eq!(v.match_type, MatchType::Variant);
        assert!(v.similarity >= VARIANT_THRESHOLD);
    }
}
