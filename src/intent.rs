//! Keyword intent and sentiment detection
//!
//! Caller utterances are short ("yes that works", "I need to move it"), so a
//! lexical pass is enough to drive record updates and the offline reply table.

use serde::{Deserialize, Serialize};

/// What the caller wants to do with the appointment or follow-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Confirm,
    Reschedule,
    Cancel,
    Unclear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

const CANCEL_PHRASES: &[&str] = &[
    "cancel",
    "call it off",
    "not coming",
    "won't be coming",
    "won't make it",
    "can't make it at all",
    "don't need it",
];

const RESCHEDULE_PHRASES: &[&str] = &[
    "reschedule",
    "another time",
    "another day",
    "different time",
    "different day",
    "change the time",
    "change the date",
    "move it",
    "move the appointment",
    "postpone",
    "later date",
    "next week",
    "can't make it",
];

const AFFIRMATIVE_WORDS: &[&str] = &[
    "yes", "yeah", "yep", "yup", "sure", "ok", "okay", "confirm", "confirmed", "correct", "right",
    "absolutely", "definitely", "fine",
];

const AFFIRMATIVE_PHRASES: &[&str] = &["i will be there", "i'll be there", "sounds good", "that works"];

const NEGATIVE_WORDS: &[&str] = &["no", "nope", "not", "don't", "can't", "won't", "never"];

const POSITIVE_CUES: &[&str] = &[
    "thank", "great", "good", "better", "well", "fine", "happy", "wonderful", "perfect", "improving",
];

const NEGATIVE_CUES: &[&str] = &[
    "pain", "worse", "bad", "hurt", "hurts", "sick", "terrible", "awful", "upset", "angry", "dizzy",
    "bleeding", "fever", "worried",
];

fn normalise(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' || c.is_whitespace() { c } else { ' ' })
        .collect()
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
}

fn has_word(text: &str, list: &[&str]) -> bool {
    words(text).any(|w| list.contains(&w))
}

fn has_phrase(text: &str, list: &[&str]) -> bool {
    list.iter().any(|p| text.contains(p))
}

/// Affirmative keyword present ("yes", "sure", "I'll be there")
pub fn is_affirmative(text: &str) -> bool {
    let text = normalise(text);
    has_word(&text, AFFIRMATIVE_WORDS) || has_phrase(&text, AFFIRMATIVE_PHRASES)
}

/// Negative keyword present ("no", "can't")
pub fn is_negative(text: &str) -> bool {
    has_word(&normalise(text), NEGATIVE_WORDS)
}

/// Classify an utterance. Cancel beats reschedule beats confirm, so
/// "yes, please cancel it" is a cancellation.
pub fn detect_intent(text: &str) -> Intent {
    let text = normalise(text);
    if text.trim().is_empty() {
        return Intent::Unclear;
    }

    if has_phrase(&text, CANCEL_PHRASES) {
        Intent::Cancel
    } else if has_phrase(&text, RESCHEDULE_PHRASES) {
        Intent::Reschedule
    } else if (has_word(&text, AFFIRMATIVE_WORDS) || has_phrase(&text, AFFIRMATIVE_PHRASES))
        && !has_word(&text, NEGATIVE_WORDS)
    {
        Intent::Confirm
    } else {
        Intent::Unclear
    }
}

/// Rough mood of the caller from cue words
pub fn detect_sentiment(text: &str) -> Sentiment {
    let text = normalise(text);
    let positive = words(&text)
        .filter(|w| POSITIVE_CUES.iter().any(|cue| w.starts_with(cue)))
        .count();
    let negative = words(&text)
        .filter(|w| NEGATIVE_CUES.iter().any(|cue| w.starts_with(cue)))
        .count();

    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Sentiment::Positive,
        std::cmp::Ordering::Less => Sentiment::Negative,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_intents() {
        assert_eq!(detect_intent("yes I confirm"), Intent::Confirm);
        assert_eq!(detect_intent("Yeah, that works."), Intent::Confirm);
        assert_eq!(detect_intent("I'll be there"), Intent::Confirm);
    }

    #[test]
    fn test_reschedule_and_cancel() {
        assert_eq!(detect_intent("Can we reschedule to next week?"), Intent::Reschedule);
        assert_eq!(detect_intent("I can't make it on Tuesday"), Intent::Reschedule);
        assert_eq!(detect_intent("Please cancel my appointment"), Intent::Cancel);
        assert_eq!(detect_intent("yes, please cancel it"), Intent::Cancel);
    }

    #[test]
    fn test_unclear() {
        assert_eq!(detect_intent(""), Intent::Unclear);
        assert_eq!(detect_intent("who is this?"), Intent::Unclear);
        assert_eq!(detect_intent("no not really"), Intent::Unclear);
    }

    #[test]
    fn test_sentiment() {
        assert_eq!(detect_sentiment("I'm feeling much better, thank you"), Sentiment::Positive);
        assert_eq!(detect_sentiment("the pain is worse today"), Sentiment::Negative);
        assert_eq!(detect_sentiment("it's on Tuesday"), Sentiment::Neutral);
    }

    #[test]
    fn test_lexical_cues() {
        assert!(is_affirmative("Sure!"));
        assert!(!is_affirmative("maybe"));
        assert!(is_negative("No, I can't"));
        assert!(!is_negative("notes"));
    }
}
