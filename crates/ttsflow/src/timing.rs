//! Word timing estimation and normalization.
//!
//! Backends that report word boundaries produce authoritative timings; for the
//! rest, [`TimingEstimator`] spreads the chunk's real audio duration over its
//! words. Estimated timings always tile `[0, duration]` exactly, so they never
//! point past the audio they describe.

use crate::config::EngineConfig;
use crate::ssml::strip_tags;
use crate::types::{TimingSource, WordTiming};
use log::warn;

/// Average word length used to turn words-per-minute into seconds-per-character
const AVERAGE_WORD_CHARS: f64 = 5.0;

/// Estimates word timings from text and decoded audio duration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingEstimator {
    words_per_minute: u32,
    inter_word_gap: f64,
}

impl Default for TimingEstimator {
    fn default() -> Self {
        Self {
            words_per_minute: 150,
            inter_word_gap: 1.0,
        }
    }
}

impl TimingEstimator {
    pub fn new(words_per_minute: u32, inter_word_gap: f64) -> Self {
        Self {
            words_per_minute: words_per_minute.max(1),
            inter_word_gap: if inter_word_gap > 0.0 {
                inter_word_gap
            } else {
                1.0
            },
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.words_per_minute, config.inter_word_gap)
    }

    pub fn words_per_minute(&self) -> u32 {
        self.words_per_minute
    }

    /// Split text into speakable words.
    ///
    /// SSML tags are removed first. Punctuation stays attached to its word
    /// ("world."); tokens made only of punctuation are folded into the word
    /// before them.
    pub fn tokenize(text: &str) -> Vec<String> {
        Self::weighted_words(text, 0.0)
            .into_iter()
            .map(|(word, _)| word)
            .collect()
    }

    /// Timings for `text` spread over exactly `duration` seconds.
    ///
    /// Each word gets a slot proportional to its character count plus the
    /// inter-word gap. Slots are contiguous: `end[i] == start[i + 1]`, the first
    /// start is 0 and the last end equals `duration`.
    pub fn estimate(&self, text: &str, duration: f64) -> Vec<WordTiming> {
        if !(duration.is_finite() && duration > 0.0) {
            return Vec::new();
        }

        let words = Self::weighted_words(text, self.inter_word_gap);
        let total: f64 = words.iter().map(|(_, weight)| weight).sum();
        if words.is_empty() || total <= 0.0 {
            return Vec::new();
        }

        let last = words.len() - 1;
        let mut consumed = 0.0;
        words
            .into_iter()
            .enumerate()
            .map(|(index, (word, weight))| {
                let start = duration * consumed / total;
                consumed += weight;
                let end = if index == last {
                    duration
                } else {
                    duration * consumed / total
                };
                WordTiming::estimated(word, start, end)
            })
            .collect()
    }

    /// Expected speaking time for `text` at the configured rate
    pub fn natural_duration(&self, text: &str) -> f64 {
        let total: f64 = Self::weighted_words(text, self.inter_word_gap)
            .iter()
            .map(|(_, weight)| weight)
            .sum();
        let chars_per_minute =
            self.words_per_minute as f64 * (AVERAGE_WORD_CHARS + self.inter_word_gap);
        total * 60.0 / chars_per_minute
    }

    fn weighted_words(text: &str, gap: f64) -> Vec<(String, f64)> {
        let plain = strip_tags(text);
        let mut words: Vec<(String, f64)> = Vec::new();
        let mut leading = 0.0;

        for token in plain.split_whitespace() {
            let chars = token.chars().count() as f64;
            if token.chars().any(char::is_alphanumeric) {
                words.push((token.to_string(), chars + gap + leading));
                leading = 0.0;
            } else if let Some((_, weight)) = words.last_mut() {
                *weight += chars;
            } else {
                leading += chars;
            }
        }
        words
    }
}

/// Make backend timings satisfy the chunk invariants: sorted by start,
/// strictly increasing starts, inside `[0, duration]`, non-overlapping.
pub fn normalize_native(mut timings: Vec<WordTiming>, duration: f64) -> Vec<WordTiming> {
    let original_len = timings.len();
    timings.retain(|t| t.start.is_finite() && t.end.is_finite());
    timings.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut adjusted = original_len != timings.len();
    let mut normalized: Vec<WordTiming> = Vec::with_capacity(timings.len());
    for timing in timings {
        let start = timing.start.clamp(0.0, duration);
        if normalized.last().is_some_and(|prev| start <= prev.start) {
            adjusted = true;
            continue;
        }
        let end = timing.end.clamp(start, duration);
        if start != timing.start || end != timing.end {
            adjusted = true;
        }
        if let Some(prev) = normalized.last_mut() {
            if prev.end > start {
                prev.end = start;
                adjusted = true;
            }
        }
        normalized.push(WordTiming {
            word: timing.word,
            start,
            end,
            source: TimingSource::Native,
        });
    }

    if adjusted {
        warn!(
            "Adjusted backend word timings to fit {:.3}s of audio ({} of {} kept)",
            duration,
            normalized.len(),
            original_len
        );
    }
    normalized
}

/// Build native timings from start offsets only. Each word ends where the
/// next one starts; the last ends with the audio.
pub fn complete_from_starts(starts: Vec<(f64, String)>, duration: f64) -> Vec<WordTiming> {
    let ends: Vec<f64> = starts
        .iter()
        .skip(1)
        .map(|(start, _)| *start)
        .chain(std::iter::once(duration))
        .collect();
    starts
        .into_iter()
        .zip(ends)
        .map(|((start, word), end)| WordTiming::native(word, start, end.max(start)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(timings: &[WordTiming], duration: f64) {
        assert_eq!(timings.first().map(|t| t.start), Some(0.0));
        assert_eq!(timings.last().map(|t| t.end), Some(duration));
        for pair in timings.windows(2) {
            assert!(pair[0].start < pair[1].start, "starts must increase");
            assert_eq!(pair[0].end, pair[1].start, "slots must be contiguous");
        }
        for timing in timings {
            assert!(timing.end <= duration);
            assert_eq!(timing.source, TimingSource::Estimated);
        }
    }

    #[test]
    fn splits_sentence_into_two_words() {
        let timings = TimingEstimator::default().estimate("Hello world.", 1.5);
        let words: Vec<&str> = timings.iter().map(|t| t.word.as_str()).collect();
        assert_eq!(words, vec!["Hello", "world."]);
        assert_tiles(&timings, 1.5);
        let total: f64 = timings.iter().map(WordTiming::duration).sum();
        assert!((total - 1.5).abs() < 1e-12);
    }

    #[test]
    fn longer_words_get_longer_slots() {
        let timings = TimingEstimator::default().estimate("a extraordinary b", 3.0);
        assert_eq!(timings.len(), 3);
        assert!(timings[1].duration() > timings[0].duration());
        assert!(timings[1].duration() > timings[2].duration());
        assert_tiles(&timings, 3.0);
    }

    #[test]
    fn punctuation_tokens_fold_into_previous_word() {
        let words = TimingEstimator::tokenize("Wait - what ?");
        assert_eq!(words, vec!["Wait", "what"]);
    }

    #[test]
    fn strips_ssml_before_tokenizing() {
        let words =
            TimingEstimator::tokenize("<speak>Hello <break time=\"1s\"/> <emphasis>you</emphasis></speak>");
        assert_eq!(words, vec!["Hello", "you"]);
    }

    #[test]
    fn empty_inputs_produce_no_timings() {
        let estimator = TimingEstimator::default();
        assert!(estimator.estimate("", 1.0).is_empty());
        assert!(estimator.estimate("  ... ", 1.0).is_empty());
        assert!(estimator.estimate("words here", 0.0).is_empty());
        assert!(estimator.estimate("words here", f64::NAN).is_empty());
    }

    #[test]
    fn never_exceeds_audio_duration() {
        let estimator = TimingEstimator::new(400, 0.5);
        let text = "The quick brown fox jumps over the lazy dog, again and again!";
        for duration in [0.01, 0.333, 2.0, 17.25] {
            let timings = estimator.estimate(text, duration);
            assert_tiles(&timings, duration);
        }
    }

    #[test]
    fn natural_duration_follows_rate() {
        let slow = TimingEstimator::new(100, 1.0).natural_duration("hello world again");
        let fast = TimingEstimator::new(200, 1.0).natural_duration("hello world again");
        assert!(slow > fast);
        assert!((slow - 2.0 * fast).abs() < 1e-9);
    }

    #[test]
    fn normalizes_overlapping_native_timings() {
        let timings = vec![
            WordTiming::native("b", 0.4, 0.9),
            WordTiming::native("a", 0.0, 0.6),
            WordTiming::native("dup", 0.4, 0.5),
            WordTiming::native("c", 0.8, 5.0),
        ];
        let normalized = normalize_native(timings, 1.0);
        let words: Vec<&str> = normalized.iter().map(|t| t.word.as_str()).collect();
        assert_eq!(words, vec!["a", "b", "c"]);
        assert_eq!(normalized[0].end, 0.4);
        assert_eq!(normalized[1].end, 0.8);
        assert_eq!(normalized[2].end, 1.0);
    }

    #[test]
    fn completes_ends_from_next_start() {
        let timings = complete_from_starts(
            vec![(0.0, "This".to_string()), (0.5, "is".to_string()), (0.8, "it".to_string())],
            1.2,
        );
        assert_eq!(timings.len(), 3);
        assert_eq!(timings[0].end, 0.5);
        assert_eq!(timings[1].end, 0.8);
        assert_eq!(timings[2].end, 1.2);
        assert!(timings.iter().all(|t| t.source == TimingSource::Native));
    }
}
