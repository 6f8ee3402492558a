//! Token Accumulator (C2)
//!
//! Reconstructs speaker-attributed transcript and translation segments from
//! the upstream's interleaved partial/final token stream. Two independent
//! [`Track`]s (original, translation) share the same append-or-merge rule;
//! ordering and error/`hasReceivedData` bookkeeping live on the owning
//! [`Accumulator`].
//!
//! Grounded on the two-level accumulate/flush shape of a streaming ASR
//! accumulator: per-message `process` folds tokens into per-track state and
//! returns the events to forward live; nothing here discards data on error,
//! since finalization needs whatever was accumulated so far.

use crate::model::{Segment, TokenKind, TranslationResult, UpstreamMessage};

/// Per-track (original or translation) running state.
#[derive(Debug, Default)]
struct Track {
    live: String,
    last_speaker: Option<i64>,
    finals: Vec<Segment>,
}

impl Track {
    fn append_live(&mut self, speaker: Option<i64>, text: &str) {
        if let Some(s) = speaker {
            if self.last_speaker != Some(s) {
                if self.last_speaker.is_some() {
                    self.live.push_str("\n\n");
                }
                self.last_speaker = Some(s);
                self.live.push_str(&format!("Speaker {}: ", s));
            }
        }
        self.live.push_str(text);
    }

    fn append_final(&mut self, speaker: i64, text: &str, timestamp_ms: i64) {
        let role = format!("Speaker {}", speaker);
        if let Some(last) = self.finals.last_mut() {
            if last.role == role {
                last.text.push_str(text);
                return;
            }
        }
        self.finals.push(Segment {
            role,
            text: text.to_string(),
            timestamp_ms,
        });
    }
}

/// Outcome of folding one upstream message into the accumulator.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub live_events: Vec<TranslationResult>,
    pub terminal: Option<TerminalEventKind>,
}

#[derive(Debug, Clone)]
pub enum TerminalEventKind {
    Error(String),
    Finished,
}

/// Per-session accumulator state, owned by exactly one Session.
pub struct Accumulator {
    original: Track,
    translation: Track,
    has_received_data: bool,
    has_error: bool,
    target_language: String,
    source_language: Option<String>,
    vocabularies: Option<serde_json::Value>,
}

impl Accumulator {
    pub fn new(target_language: String, vocabularies: Option<serde_json::Value>) -> Self {
        Self {
            original: Track::default(),
            translation: Track::default(),
            has_received_data: false,
            has_error: false,
            target_language,
            source_language: None,
            vocabularies,
        }
    }

    pub fn target_language(&self) -> &str {
        &self.target_language
    }

    pub fn source_language(&self) -> Option<&str> {
        self.source_language.as_deref()
    }

    pub fn vocabularies(&self) -> Option<&serde_json::Value> {
        self.vocabularies.as_ref()
    }

    pub fn has_received_data(&self) -> bool {
        self.has_received_data
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn final_original_segments(&self) -> &[Segment] {
        &self.original.finals
    }

    pub fn final_translation_segments(&self) -> &[Segment] {
        &self.translation.finals
    }

    pub fn live_original(&self) -> &str {
        &self.original.live
    }

    pub fn live_translation(&self) -> &str {
        &self.translation.live
    }

    /// Fold one upstream message into the accumulator. `elapsed_ms` is the
    /// recording-relative timestamp to stamp new final segments with (0 if
    /// recording has not started).
    pub fn process(&mut self, msg: &UpstreamMessage, elapsed_ms: i64) -> ProcessOutcome {
        let mut out = ProcessOutcome::default();

        if let Some(code) = &msg.error_code {
            self.has_error = true;
            let message = msg
                .error_message
                .clone()
                .unwrap_or_else(|| code.clone());
            out.terminal = Some(TerminalEventKind::Error(message));
            return out;
        }

        for token in &msg.tokens {
            if token.text.is_empty() || token.text == "<end>" {
                continue;
            }

            let kind = if token.translation_status.as_deref() == Some("translation") {
                TokenKind::Translation
            } else {
                TokenKind::Original
            };

            self.has_received_data = true;

            let track = match kind {
                TokenKind::Original => &mut self.original,
                TokenKind::Translation => &mut self.translation,
            };
            track.append_live(token.speaker, &token.text);

            if token.is_final {
                if let Some(speaker) = token.speaker {
                    track.append_final(speaker, &token.text, elapsed_ms);
                }
            }

            if let Some(lang) = &msg.detected_language {
                if self.source_language.is_none() && kind == TokenKind::Original {
                    self.source_language = Some(lang.clone());
                }
            }

            out.live_events.push(TranslationResult {
                text: token.text.clone(),
                kind,
                language: msg.detected_language.clone(),
                source_language: self.source_language.clone(),
                timestamp: elapsed_ms,
                is_final: token.is_final,
                speaker: token.speaker.map(|s| s.to_string()),
            });
        }

        if msg.finished {
            out.terminal = Some(TerminalEventKind::Finished);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpstreamToken;

    fn token(text: &str, is_final: bool, speaker: Option<i64>) -> UpstreamToken {
        UpstreamToken {
            text: text.to_string(),
            translation_status: None,
            is_final,
            speaker,
        }
    }

    fn msg(tokens: Vec<UpstreamToken>) -> UpstreamMessage {
        UpstreamMessage {
            tokens,
            detected_language: None,
            error_code: None,
            error_message: None,
            finished: false,
        }
    }

    #[test]
    fn consecutive_finals_same_speaker_merge() {
        let mut acc = Accumulator::new("id".into(), None);
        acc.process(&msg(vec![token("Hello", true, Some(1))]), 0);
        acc.process(&msg(vec![token(" world", true, Some(1))]), 10);

        let segs = acc.final_original_segments();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].role, "Speaker 1");
        assert_eq!(segs[0].text, "Hello world");
    }

    #[test]
    fn speaker_change_starts_new_segment() {
        let mut acc = Accumulator::new("id".into(), None);
        acc.process(
            &msg(vec![
                token("A", true, Some(1)),
                token("B", true, Some(1)),
                token("C", true, Some(2)),
                token("D", true, Some(1)),
            ]),
            0,
        );

        let segs = acc.final_original_segments();
        let texts: Vec<_> = segs.iter().map(|s| (s.role.as_str(), s.text.as_str())).collect();
        assert_eq!(
            texts,
            vec![("Speaker 1", "AB"), ("Speaker 2", "C"), ("Speaker 1", "D")]
        );
    }

    #[test]
    fn partial_tokens_do_not_produce_final_segments() {
        let mut acc = Accumulator::new("id".into(), None);
        acc.process(&msg(vec![token("partial", false, Some(1))]), 0);
        assert!(acc.final_original_segments().is_empty());
        assert!(acc.has_received_data());
    }

    #[test]
    fn translation_status_routes_to_translation_track() {
        let mut acc = Accumulator::new("id".into(), None);
        let mut tok = token("Halo", true, Some(1));
        tok.translation_status = Some("translation".into());
        acc.process(&msg(vec![tok]), 0);

        assert!(acc.final_original_segments().is_empty());
        assert_eq!(acc.final_translation_segments().len(), 1);
        assert_eq!(acc.final_translation_segments()[0].text, "Halo");
    }

    #[test]
    fn error_envelope_sets_flag_and_preserves_data() {
        let mut acc = Accumulator::new("id".into(), None);
        acc.process(&msg(vec![token("kept", true, Some(1))]), 0);
        let mut err = msg(vec![]);
        err.error_code = Some("AUTH_REFUSED".into());
        let outcome = acc.process(&err, 0);

        assert!(acc.has_error());
        assert_eq!(acc.final_original_segments().len(), 1);
        assert!(matches!(outcome.terminal, Some(TerminalEventKind::Error(_))));
    }

    #[test]
    fn empty_and_end_marker_tokens_are_skipped() {
        let mut acc = Accumulator::new("id".into(), None);
        acc.process(&msg(vec![token("", true, Some(1)), token("<end>", true, Some(1))]), 0);
        assert!(!acc.has_received_data());
        assert!(acc.final_original_segments().is_empty());
    }

    #[test]
    fn detected_language_is_captured_once_from_original_track() {
        let mut acc = Accumulator::new("id".into(), None);
        let mut m = msg(vec![token("hi", true, Some(1))]);
        m.detected_language = Some("en".into());
        acc.process(&m, 0);
        assert_eq!(acc.source_language(), Some("en"));

        let mut m2 = msg(vec![token("more", true, Some(1))]);
        m2.detected_language = Some("fr".into());
        acc.process(&m2, 0);
        assert_eq!(acc.source_language(), Some("en"));
    }
}
