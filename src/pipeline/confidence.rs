// Confidence predicate
//
// An answer is usable when, after trimming, it is at least `min_answer_chars`
// long and none of the configured low-confidence phrases appears in its
// opening (the first MARKER_WINDOW characters). Usable answers get a score in
// (0, 1] that grows with length up to SCORE_SATURATION characters; the team
// tier uses it to rank specialists.

use crate::config::EscalationConfig;

const MARKER_WINDOW: usize = 160;
const SCORE_SATURATION: usize = 2000;

#[derive(Debug, Clone)]
pub struct Confidence {
    min_chars: usize,
    markers: Vec<String>,
}

impl Confidence {
    pub fn from_config(config: &EscalationConfig) -> Self {
        Self {
            min_chars: config.min_answer_chars.max(1),
            markers: config
                .low_confidence_markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// `Ok(score)` for a usable answer, `Err(reason)` otherwise.
    pub fn assess(&self, text: &str) -> Result<f32, String> {
        let trimmed = text.trim();
        let chars = trimmed.chars().count();
        if chars == 0 {
            return Err("empty answer".to_string());
        }
        if chars < self.min_chars {
            return Err(format!("answer shorter than {} chars", self.min_chars));
        }

        let opening: String = trimmed.chars().take(MARKER_WINDOW).collect::<String>().to_lowercase();
        if let Some(marker) = self.markers.iter().find(|m| opening.contains(m.as_str())) {
            return Err(format!("answer signals low confidence ('{}')", marker));
        }

        Ok(chars.min(SCORE_SATURATION) as f32 / SCORE_SATURATION as f32)
    }
}
