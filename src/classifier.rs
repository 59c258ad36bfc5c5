//! Keyword/pattern message classifier.
//!
//! Deliberately not NLP: deterministic, case-insensitive substring matching
//! against injected phrase tables, plus two tone heuristics. The classifier is
//! a total function over strings and never errors.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::lexicon::Lexicon;
use crate::models::{Classification, MessageRecord, Severity};

pub const REASON_THREAT: &str = "threatening language";
pub const REASON_INSULT: &str = "harsh insult";
pub const REASON_MOCKING: &str = "mocking language";
pub const REASON_EXCLUSION: &str = "social exclusion";
pub const REASON_HARASSMENT: &str = "harassment";
pub const REASON_SHOUTING: &str = "shouting";
pub const REASON_INTENSITY: &str = "high message intensity";

const INTENSITY_THRESHOLD: f64 = 4.0;

pub struct Classifier {
    lexicon: Lexicon,
}

impl Classifier {
    pub fn new(lexicon: Lexicon) -> Classifier {
        Classifier { lexicon }
    }

    /// Classify one message. Every matched category contributes its reason and
    /// phrases; severity is the max of the matched categories' floors, so a
    /// threat stays critical no matter what else matched.
    pub fn classify(&self, content: &str) -> Classification {
        let normalized = content.trim().to_lowercase();

        let mut reasons = BTreeSet::new();
        let mut flagged_phrases = BTreeSet::new();
        let mut severity: Option<Severity> = None;
        let mut phrase_match = false;

        let categories: [(&[String], &str, Severity); 5] = [
            (&self.lexicon.threat, REASON_THREAT, Severity::Critical),
            (&self.lexicon.insult, REASON_INSULT, Severity::High),
            (&self.lexicon.mocking, REASON_MOCKING, Severity::High),
            (&self.lexicon.exclusion, REASON_EXCLUSION, Severity::Medium),
            (&self.lexicon.harassment, REASON_HARASSMENT, Severity::Medium),
        ];

        for (table, reason, floor) in categories {
            let mut hit = false;
            for phrase in table {
                if normalized.contains(phrase.as_str()) {
                    hit = true;
                    flagged_phrases.insert(phrase.clone());
                }
            }
            if hit {
                phrase_match = true;
                reasons.insert(reason.to_string());
                severity = Some(severity.map_or(floor, |s| s.max(floor)));
            }
        }

        // Tone heuristics contribute reasons only; they never flag a message
        // on their own and never move severity.
        if is_shouting(content) {
            reasons.insert(REASON_SHOUTING.to_string());
        }
        if intensity_score(content) > INTENSITY_THRESHOLD {
            reasons.insert(REASON_INTENSITY.to_string());
        }

        Classification {
            is_flagged: phrase_match,
            severity: if phrase_match { severity } else { None },
            reasons,
            flagged_phrases,
        }
    }

    /// Mask insult and mocking phrases, all occurrences, case-insensitive.
    /// Threat and exclusion text is left intact so reviewers see the original
    /// wording as evidence.
    pub fn sanitize(&self, content: &str) -> String {
        let mut output = content.to_string();
        for phrase in self.lexicon.insult.iter().chain(self.lexicon.mocking.iter()) {
            output = mask_all(&output, phrase, &self.lexicon.mask);
        }
        output
    }
}

/// True when the trailing window holds more than five messages from the
/// sender. Stateless; the caller supplies whatever history it has.
pub fn detect_repetitive_messaging(
    history: &[MessageRecord],
    sender_id: Uuid,
    now: DateTime<Utc>,
    window_minutes: i64,
) -> bool {
    let cutoff = now - Duration::minutes(window_minutes.max(1));
    let count = history
        .iter()
        .filter(|m| m.sender_id == sender_id && m.sent_at > cutoff && m.sent_at <= now)
        .count();
    count > 5
}

fn is_shouting(content: &str) -> bool {
    if content.trim().len() < 5 {
        return false;
    }
    let tokens: Vec<&str> = content.split_whitespace().collect();
    if tokens.is_empty() {
        return false;
    }
    let upper = tokens
        .iter()
        .filter(|t| {
            t.chars().any(|c| c.is_alphabetic())
                && t.chars().filter(|c| c.is_alphabetic()).all(|c| c.is_uppercase())
        })
        .count();
    (upper as f64) / (tokens.len() as f64) > 0.5
}

fn intensity_score(content: &str) -> f64 {
    let exclamations = content.matches('!').count() as f64;
    let questions = content.matches('?').count() as f64;
    let ellipses = content.matches("...").count() as f64;
    2.0 * exclamations + 1.5 * questions + ellipses
}

fn mask_all(content: &str, phrase: &str, mask: &str) -> String {
    if phrase.is_empty() {
        return content.to_string();
    }
    // Lowercase one character at a time, recording each lowered byte's source
    // char span, so matches map back to the original bytes even when case
    // folding changes lengths.
    let mut lower = String::with_capacity(content.len());
    let mut spans = Vec::with_capacity(content.len());
    for (start, ch) in content.char_indices() {
        let end = start + ch.len_utf8();
        for folded in ch.to_lowercase() {
            for _ in 0..folded.len_utf8() {
                spans.push((start, end));
            }
            lower.push(folded);
        }
    }

    let mut output = String::with_capacity(content.len());
    let mut lower_cursor = 0;
    let mut content_cursor = 0;
    while let Some(pos) = lower[lower_cursor..].find(phrase) {
        let match_start = lower_cursor + pos;
        let match_end = match_start + phrase.len();
        let (orig_start, _) = spans[match_start];
        let (_, orig_end) = spans[match_end - 1];
        if orig_start >= content_cursor {
            output.push_str(&content[content_cursor..orig_start]);
            output.push_str(mask);
            content_cursor = orig_end;
        }
        lower_cursor = match_end;
    }
    output.push_str(&content[content_cursor..]);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::DEFAULT_MASK;

    fn classifier() -> Classifier {
        Classifier::new(Lexicon::builtin())
    }

    #[test]
    fn threat_is_always_critical() {
        let result = classifier().classify("you are STUPID and i will hurt you");
        assert!(result.is_flagged);
        assert_eq!(result.severity, Some(Severity::Critical));
        assert!(result.reasons.contains(REASON_THREAT));
        assert!(result.reasons.contains(REASON_INSULT));
        assert!(result.flagged_phrases.contains("hurt you"));
        assert!(result.flagged_phrases.contains("stupid"));
    }

    #[test]
    fn insult_alone_is_high() {
        let result = classifier().classify("what an idiot");
        assert_eq!(result.severity, Some(Severity::High));
        assert!(result.is_flagged);
    }

    #[test]
    fn exclusion_alone_is_medium() {
        let result = classifier().classify("you can't play with us");
        assert_eq!(result.severity, Some(Severity::Medium));
        assert_eq!(
            result.reasons.iter().collect::<Vec<_>>(),
            vec![REASON_EXCLUSION]
        );
    }

    #[test]
    fn spanish_phrases_match_too() {
        let result = classifier().classify("eres un IDIOTA y te voy a pegar");
        assert_eq!(result.severity, Some(Severity::Critical));
        assert!(result.reasons.contains(REASON_THREAT));
        assert!(result.reasons.contains(REASON_INSULT));
    }

    #[test]
    fn clean_text_is_not_flagged() {
        let result = classifier().classify("good game, want to play again tomorrow?");
        assert!(!result.is_flagged);
        assert_eq!(result.severity, None);
        assert!(result.flagged_phrases.is_empty());
    }

    #[test]
    fn shouting_adds_reason_but_never_flags() {
        let result = classifier().classify("WHY DID YOU DO THAT");
        assert!(result.reasons.contains(REASON_SHOUTING));
        assert!(!result.is_flagged);
        assert_eq!(result.severity, None);
    }

    #[test]
    fn intensity_adds_reason_without_raising_severity() {
        let result = classifier().classify("you can't play!!! why???");
        assert!(result.reasons.contains(REASON_INTENSITY));
        assert_eq!(result.severity, Some(Severity::Medium));
    }

    #[test]
    fn intensity_needs_score_above_threshold() {
        assert!(intensity_score("hey!!") <= INTENSITY_THRESHOLD);
        assert!(intensity_score("hey!!!") > INTENSITY_THRESHOLD);
        assert!(intensity_score("so... what... now?") <= INTENSITY_THRESHOLD);
    }

    #[test]
    fn sanitize_masks_insults_but_not_threats() {
        let c = classifier();
        let sanitized = c.sanitize("you are Stupid and i will hurt you, STUPID");
        assert_eq!(
            sanitized,
            format!("you are {m} and i will hurt you, {m}", m = DEFAULT_MASK)
        );
        assert!(sanitized.contains("hurt you"));
    }

    #[test]
    fn sanitize_leaves_exclusion_untouched() {
        let c = classifier();
        assert_eq!(c.sanitize("you can't play"), "you can't play");
    }

    #[test]
    fn sanitize_keeps_text_intact_when_folding_changes_length() {
        // 'İ' lowercases to two chars, so the folded copy has a different
        // byte length than the input.
        let c = classifier();
        let content = "You are İNCREDİBLE at this game";
        assert_eq!(c.sanitize(content), content);
    }

    #[test]
    fn sanitize_masks_across_length_changing_case_folds() {
        let mut lexicon = Lexicon::builtin();
        lexicon.insult.push("großmaul".to_string());
        let c = Classifier::new(lexicon);
        assert_eq!(
            c.sanitize("what a GROẞMAUL"),
            format!("what a {DEFAULT_MASK}")
        );
    }

    #[test]
    fn every_lexicon_phrase_flags_with_a_severity() {
        let c = classifier();
        let lexicon = Lexicon::builtin();
        let tables = [
            &lexicon.threat,
            &lexicon.insult,
            &lexicon.mocking,
            &lexicon.exclusion,
            &lexicon.harassment,
        ];
        for phrase in tables.into_iter().flatten() {
            let result = c.classify(phrase);
            assert!(result.is_flagged, "{phrase} should flag");
            assert!(result.severity.is_some(), "{phrase} should set a severity");
        }
    }

    #[test]
    fn repetitive_messaging_needs_more_than_five() {
        let sender = Uuid::new_v4();
        let other = Uuid::new_v4();
        let now = Utc::now();
        let mut history: Vec<MessageRecord> = (0..5)
            .map(|i| MessageRecord {
                sender_id: sender,
                sent_at: now - Duration::minutes(i),
            })
            .collect();
        history.push(MessageRecord {
            sender_id: other,
            sent_at: now,
        });
        assert!(!detect_repetitive_messaging(&history, sender, now, 30));

        history.push(MessageRecord {
            sender_id: sender,
            sent_at: now - Duration::minutes(29),
        });
        assert!(detect_repetitive_messaging(&history, sender, now, 30));

        // Messages outside the window do not count.
        history.pop();
        history.push(MessageRecord {
            sender_id: sender,
            sent_at: now - Duration::minutes(45),
        });
        assert!(!detect_repetitive_messaging(&history, sender, now, 30));
    }
}
