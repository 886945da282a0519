//! Keyword-based reply sentiment classifier.

use super::model::ReplyClassification;

const OUT_OF_OFFICE: &[&str] = &[
    "automatic reply",
    "out of office",
    "vacation",
    "auto-reply",
    "away from my email",
    "limited access",
    "returning on",
    "contact my colleague",
];

const NEGATIVE: &[&str] = &[
    "unsubscribe",
    "remove me",
    "not interested",
    "stop emailing",
    "take me off",
    "spam",
    "do not contact",
    "wrong person",
    "no thanks",
    "not for us",
];

const POSITIVE: &[&str] = &[
    "interested",
    "call",
    "book a time",
    "schedule",
    "calendar",
    "demo",
    "send more info",
    "sounds good",
    "let's talk",
    "discuss further",
    "available on",
    "meeting",
    "pricing",
];

/// Classify a reply. Auto-replies win over opt-outs, opt-outs over interest.
pub fn classify_reply(subject: &str, body: &str) -> ReplyClassification {
    let text = format!("{subject} {body}").to_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|kw| text.contains(kw));

    if matches(OUT_OF_OFFICE) {
        ReplyClassification::OutOfOffice
    } else if matches(NEGATIVE) {
        ReplyClassification::Negative
    } else if matches(POSITIVE) {
        ReplyClassification::Positive
    } else {
        ReplyClassification::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_office_first() {
        assert_eq!(
            classify_reply("Automatic reply: Re: intro", "I'm not interested in calls right now"),
            ReplyClassification::OutOfOffice
        );
    }

    #[test]
    fn negative_beats_positive() {
        // "not interested" contains "interested"
        assert_eq!(
            classify_reply("Re: intro", "Not interested, please remove me"),
            ReplyClassification::Negative
        );
    }

    #[test]
    fn positive_and_default() {
        assert_eq!(
            classify_reply("Re: intro", "Sounds good, can we book a time?"),
            ReplyClassification::Positive
        );
        assert_eq!(
            classify_reply("Re: intro", "Who is this?"),
            ReplyClassification::Info
        );
    }
}
