use std::sync::Arc;

use serde::Serialize;

use crate::lrc::{parse_lrc, LineCue, WordCue};

/// Slack allowed past a cue's end before it stops being active.
pub const ACTIVE_EPSILON: f64 = 0.001;

pub trait Cue {
    fn start(&self) -> f64;
    fn end(&self) -> f64;
}

impl Cue for LineCue {
    fn start(&self) -> f64 {
        self.start
    }

    fn end(&self) -> f64 {
        self.end
    }
}

impl Cue for WordCue {
    fn start(&self) -> f64 {
        self.start
    }

    fn end(&self) -> f64 {
        self.end
    }
}

/// Index of the cue active at `t`, if any.
///
/// `cues` must be sorted by start. Picks the last cue starting at or before
/// `t` and rejects it when `t` has run past its end (a gap between cues).
pub fn find_active<C: Cue>(cues: &[C], t: f64) -> Option<usize> {
    let idx = cues.partition_point(|c| c.start() <= t).checked_sub(1)?;
    (t <= cues[idx].end() + ACTIVE_EPSILON).then_some(idx)
}

pub fn find_active_line(cues: &[LineCue], t: f64) -> Option<usize> {
    find_active(cues, t)
}

pub fn find_active_word(words: &[WordCue], t: f64) -> Option<usize> {
    find_active(words, t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActiveCue {
    pub line: usize,
    pub word: Option<usize>,
}

/// Parsed lyrics for one song; immutable and cheap to share between readers.
#[derive(Debug, Clone)]
pub struct LyricTrack {
    lines: Arc<[LineCue]>,
}

impl LyricTrack {
    pub fn parse(raw: &str) -> Self {
        Self {
            lines: parse_lrc(raw).into(),
        }
    }

    /// False when the text had no usable timestamps.
    pub fn is_synced(&self) -> bool {
        !self.lines.is_empty()
    }

    pub fn lines(&self) -> &[LineCue] {
        &self.lines
    }

    pub fn active_at(&self, t: f64) -> Option<ActiveCue> {
        let line = find_active_line(&self.lines, t)?;
        let word = self.lines[line]
            .words
            .as_deref()
            .and_then(|words| find_active_word(words, t));
        Some(ActiveCue { line, word })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_line() {
        let cues = parse_lrc("[00:01.00]Hello\n[00:03.00]World");

        assert_eq!(find_active_line(&cues, 0.5), None);
        assert_eq!(find_active_line(&cues, 1.0), Some(0));
        assert_eq!(find_active_line(&cues, 1.5), Some(0));
        assert_eq!(find_active_line(&cues, 2.98), Some(0));
        assert_eq!(find_active_line(&cues, 2.99), None);
        assert_eq!(find_active_line(&cues, 3.0), Some(1));
        assert_eq!(find_active_line(&cues, 8.0), Some(1));
        assert_eq!(find_active_line(&cues, 8.5), None);
    }

    #[test]
    fn test_empty_and_nan() {
        assert_eq!(find_active_line(&[], 1.0), None);
        let cues = parse_lrc("[00:01.00]Hello");
        assert_eq!(find_active_line(&cues, f64::NAN), None);
    }

    #[test]
    fn test_active_word() {
        let cues = parse_lrc("[00:01.00]<00:01.00>Hi <00:01.50>there");
        let words = cues[0].words.as_deref().unwrap();

        assert_eq!(find_active_word(words, 1.2), Some(0));
        assert_eq!(find_active_word(words, 1.49), None);
        assert_eq!(find_active_word(words, 1.5), Some(1));
        assert_eq!(find_active_word(words, 3.5), None);
    }

    #[test]
    fn test_track_active_at() {
        let track = LyricTrack::parse("[00:01.00]<00:01.00>Hi <00:01.50>there\n[00:10.00]Plain");
        assert!(track.is_synced());
        assert_eq!(track.lines().len(), 2);

        assert_eq!(track.active_at(1.6), Some(ActiveCue { line: 0, word: Some(1) }));
        // line still active after its last word ended
        assert_eq!(track.active_at(5.0), Some(ActiveCue { line: 0, word: None }));
        assert_eq!(track.active_at(10.0), Some(ActiveCue { line: 1, word: None }));
        assert_eq!(track.active_at(0.0), None);
    }

    #[test]
    fn test_track_shared_across_threads() {
        let track = LyricTrack::parse("[00:01.00]a\n[00:02.00]b\n[00:03.00]c");
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let track = track.clone();
                std::thread::spawn(move || track.active_at(1.0 + i as f64 * 0.5).map(|a| a.line))
            })
            .collect();
        let got: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(got, vec![Some(0), Some(0), Some(1), Some(1)]);
    }

    #[test]
    fn test_unsynced_track() {
        let track = LyricTrack::parse("just some words");
        assert!(!track.is_synced());
        assert_eq!(track.active_at(1.0), None);
    }
}
