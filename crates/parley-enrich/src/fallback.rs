//! Deterministic rule-based fallbacks. Always available, never fail —
//! the coordinator degrades to these whenever the model backend is
//! unavailable or returns an unusable result.

use parley_core::protocol::Sentiment;

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "love", "happy", "awesome", "nice", "thanks", "thank",
    "wonderful", "excellent", "amazing", "glad", "cool", "fun", "best",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "hate", "sad", "angry", "terrible", "awful", "horrible", "worst",
    "annoying", "sorry", "problem", "wrong", "broken", "ugh", "no",
];

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Lexicon-based sentiment. Undecidable input is neutral at 0.5.
pub fn sentiment(text: &str) -> Sentiment {
    let mut positive = 0usize;
    let mut negative = 0usize;
    for word in words(text) {
        if POSITIVE_WORDS.contains(&word.as_str()) {
            positive += 1;
        } else if NEGATIVE_WORDS.contains(&word.as_str()) {
            negative += 1;
        }
    }

    if positive == negative {
        return Sentiment::neutral();
    }

    let (label, hits) = if positive > negative {
        ("positive", positive - negative)
    } else {
        ("negative", negative - positive)
    };
    let confidence = (0.5 + 0.1 * hits as f64).min(0.9);

    Sentiment {
        label: label.into(),
        confidence,
    }
}

const SPANISH_WORDS: &[&str] = &["hola", "como", "que", "es", "el", "la", "de", "y"];
const FRENCH_WORDS: &[&str] = &["bonjour", "comment", "que", "est", "le", "la", "de", "et"];
const GERMAN_WORDS: &[&str] = &["hallo", "wie", "was", "ist", "der", "die", "das", "und"];

/// Common-word language detection. English is the default when nothing
/// else scores at least two hits.
pub fn detect_language(text: &str) -> String {
    let tokens: Vec<String> = words(text).collect();
    // Count distinct marker words present, not occurrences — "la la la"
    // is one hit, not three.
    let count = |list: &[&str]| {
        list.iter()
            .filter(|w| tokens.iter().any(|t| t == *w))
            .count()
    };

    let spanish = count(SPANISH_WORDS);
    let french = count(FRENCH_WORDS);
    let german = count(GERMAN_WORDS);

    let best = spanish.max(french).max(german);
    if best < 2 {
        "en".into()
    } else if spanish == best {
        "es".into()
    } else if french == best {
        "fr".into()
    } else {
        "de".into()
    }
}

/// Extractive summary: the first three sentences of the transcript.
pub fn extractive_summary(transcript: &str) -> String {
    let sentences: Vec<&str> = transcript
        .split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(3)
        .collect();
    if sentences.is_empty() {
        return transcript.trim().to_string();
    }
    format!("{}.", sentences.join(". "))
}

/// Canned openers for a conversation with no history yet.
pub fn opener_replies() -> Vec<String> {
    vec!["Hello!".into(), "How are you?".into(), "That's great!".into()]
}

/// Canned acknowledgements when no model candidate survives filtering.
pub fn ack_replies() -> Vec<String> {
    vec!["Okay.".into(), "Sure.".into(), "Got it.".into()]
}

/// Drop unusable reply candidates: too short, non-ASCII, letterless, or
/// an echo of the context.
pub fn filter_replies(candidates: Vec<String>, context: &str, max: usize) -> Vec<String> {
    let context_lower = context.to_lowercase();
    candidates
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| {
            c.len() > 5
                && c.is_ascii()
                && c.chars().any(|ch| ch.is_alphabetic())
                && c.to_lowercase() != context_lower
        })
        .take(max)
        .collect()
}
