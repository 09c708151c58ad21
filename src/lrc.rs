//! LRC lyric parsing.
//!
//! Line timestamps look like `[mm:ss]`, `[mm:ss.xx]` or `[mm:ss.xxx]`; a line
//! may carry several of them. Word timings use the enhanced `<mm:ss.xx>word`
//! markup. Malformed input never fails the parse, it just yields fewer cues.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

/// Gap left between a cue's end and its successor's start.
pub const LINE_EPSILON: f64 = 0.02;
/// Duration given to the last line, which has no successor to bound it.
pub const LAST_LINE_DURATION: f64 = 5.0;
pub const MAX_WORD_DURATION: f64 = 1.5;

lazy_static! {
    static ref LINE_TS_RE: Regex =
        Regex::new(r"\[([0-9]{1,2}:[0-9]{1,2}(?:[.:][0-9]{1,3})?)\]").unwrap();
    static ref WORD_TOKEN_RE: Regex =
        Regex::new(r"<([0-9]{1,2}:[0-9]{1,2}(?:[.:][0-9]{1,3})?)>(\S+)").unwrap();
    static ref WORD_TS_RE: Regex =
        Regex::new(r"<([0-9]{1,2}:[0-9]{1,2}(?:[.:][0-9]{1,3})?)>").unwrap();
    static ref TIME_RE: Regex =
        Regex::new(r"^([0-9]{1,2}):([0-9]{1,2})(?:[.:]([0-9]{1,3}))?$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WordCue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineCue {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordCue>>,
}

/// Convert `mm:ss[.fraction]` to seconds.
///
/// A one or two digit fraction is hundredths, three digits are thousandths.
pub fn timestamp_to_seconds(ts: &str) -> Option<f64> {
    let caps = TIME_RE.captures(ts)?;
    let minutes: f64 = caps[1].parse().ok()?;
    let seconds: f64 = caps[2].parse().ok()?;
    let fraction = match caps.get(3) {
        Some(m) => {
            let value: f64 = m.as_str().parse().ok()?;
            if m.as_str().len() == 3 {
                value / 1000.0
            } else {
                value / 100.0
            }
        }
        None => 0.0,
    };
    Some(minutes * 60.0 + seconds + fraction)
}

fn parse_words(text: &str) -> Vec<WordCue> {
    let tokens: Vec<(f64, &str)> = WORD_TOKEN_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let start = timestamp_to_seconds(caps.get(1)?.as_str())?;
            Some((start, caps.get(2)?.as_str()))
        })
        .collect();

    tokens
        .iter()
        .enumerate()
        .map(|(i, &(start, word))| WordCue {
            start,
            // provisional, tightened once the owning line's end is known
            end: tokens.get(i + 1).map_or(start + 1.0, |next| next.0),
            text: word.to_string(),
        })
        .collect()
}

/// Parse raw LRC text into line cues sorted by start time.
///
/// An empty result means the text carries no synchronized lyrics.
pub fn parse_lrc(raw: &str) -> Vec<LineCue> {
    let mut cues = Vec::new();

    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let starts: Vec<f64> = LINE_TS_RE
            .captures_iter(line)
            .filter_map(|caps| timestamp_to_seconds(&caps[1]))
            .collect();
        if starts.is_empty() {
            continue;
        }

        let without_ts = LINE_TS_RE.replace_all(line, "");
        let without_ts = without_ts.trim();

        let words = parse_words(without_ts);
        let text = if words.is_empty() {
            without_ts.to_string()
        } else {
            WORD_TS_RE.replace_all(without_ts, "").trim().to_string()
        };
        let words = (!words.is_empty()).then_some(words);

        for start in starts {
            cues.push(LineCue {
                start,
                end: start,
                text: text.clone(),
                words: words.clone(),
            });
        }
    }

    cues.sort_by(|a, b| a.start.total_cmp(&b.start));
    settle_ends(&mut cues);
    cues
}

fn settle_ends(cues: &mut [LineCue]) {
    let next_starts: Vec<Option<f64>> = (0..cues.len())
        .map(|i| cues.get(i + 1).map(|next| next.start))
        .collect();

    for (cue, next_start) in cues.iter_mut().zip(next_starts) {
        cue.end = match next_start {
            Some(next) => cue.start.max(next - LINE_EPSILON),
            None => cue.start + LAST_LINE_DURATION,
        };

        let line_end = cue.end;
        if let Some(words) = cue.words.as_mut() {
            // word ends never pass the line end, so words past it are dropped
            words.retain(|w| w.start <= line_end);
            let word_starts: Vec<f64> = words.iter().map(|w| w.start).collect();
            for (j, word) in words.iter_mut().enumerate() {
                let bound = match word_starts.get(j + 1) {
                    Some(&next) => next - LINE_EPSILON,
                    None => line_end,
                };
                word.end = bound
                    .min(word.start + MAX_WORD_DURATION)
                    .min(line_end)
                    .max(word.start);
            }
        }
        if cue.words.as_ref().is_some_and(|w| w.is_empty()) {
            cue.words = None;
        }
    }
}
