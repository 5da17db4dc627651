use std::sync::OnceLock;

use regex::Regex;

/// Best-effort episode number parser supplied by the surrounding system.
pub trait EpisodeRecognizer: Send + Sync {
    fn recognize(&self, work_title: &str, name: &str, declared: Option<f64>) -> Option<f64>;
}

/// Regex recognizer covering the common "Ch. 12", "Episode 3.5", "#40 extra" shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicRecognizer;

fn volume_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:vol(?:ume)?|v|season)\.?\s*\d+(?:\.\d+)?:?").unwrap())
}

fn keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\bch(?:apter)?|\bep(?:isode)?|#)\.?\s*(\d+(?:\.\d+)?)(?:([a-i])\b)?(?:\s*(extra|omake|special))?").unwrap()
    })
}

fn bare_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)(?:([a-i])\b)?(?:\s*(extra|omake|special))?").unwrap())
}

impl EpisodeRecognizer for BasicRecognizer {
    fn recognize(&self, work_title: &str, name: &str, declared: Option<f64>) -> Option<f64> {
        if let Some(n) = declared.filter(|n| n.is_finite() && *n >= 0.0) {
            return Some(n);
        }

        let mut cleaned = name.to_lowercase().replace(',', ".");
        let title = work_title.trim().to_lowercase();
        if !title.is_empty() {
            cleaned = cleaned.replace(&title, " ");
        }
        let cleaned = volume_re().replace_all(&cleaned, " ");

        let caps = keyword_re().captures(&cleaned).or_else(|| bare_re().captures(&cleaned))?;
        let base: f64 = caps.get(1)?.as_str().parse().ok()?;
        if base.fract() != 0.0 {
            return Some(base);
        }
        let decimal = match (caps.get(2), caps.get(3)) {
            (_, Some(word)) => match word.as_str() {
                "extra" => 0.99,
                "omake" => 0.98,
                _ => 0.97,
            },
            (Some(letter), None) => {
                let idx = letter.as_str().as_bytes()[0] - b'a' + 1;
                f64::from(idx) / 10.0
            }
            (None, None) => 0.0,
        };
        Some(base + decimal)
    }
}
