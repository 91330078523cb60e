//! Locally synthesized replies for when the LLM is unavailable.
//!
//! The reply is picked from the topic and mood of the user's recent messages.
//! Pure string work: no I/O, never fails.

use crate::session::{Message, Role};

/// User messages inspected for mood, newest first.
const SENTIMENT_LOOKBACK: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Permissions,
    Battery,
    Steps,
    Sleep,
    HeartRate,
    Workouts,
    Sync,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentiment {
    Frustrated,
    Neutral,
}

/// Keyword stems per topic, most specific topics first.
const TOPIC_KEYWORDS: &[(Topic, &[&str])] = &[
    (
        Topic::Permissions,
        &["permission", "access", "allow", "authori", "consent", "privacy"],
    ),
    (Topic::Battery, &["battery", "charg", "drain", "power"]),
    (Topic::Steps, &["step", "pedometer", "walk"]),
    (Topic::Sleep, &["sleep", "slept", "bedtime", "nap"]),
    (Topic::HeartRate, &["heart", "bpm", "pulse", "hrv"]),
    (
        Topic::Workouts,
        &["workout", "exercise", "run", "cycl", "swim", "training", "activit"],
    ),
    (
        Topic::Sync,
        &["sync", "connect", "bluetooth", "pair", "transfer", "upload", "missing", "import"],
    ),
];

const FRUSTRATION_MARKERS: &[&str] = &[
    "frustrat", "annoy", "angry", "ridiculous", "useless", "terrible", "awful", "hate", "broken",
    "again", "still", "seriously", "wtf", "fed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackContext {
    pub topic: Topic,
    pub sentiment: Sentiment,
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

fn topic_of(text: &str) -> Option<Topic> {
    let words: Vec<String> = words(text).collect();
    TOPIC_KEYWORDS.iter().find_map(|(topic, stems)| {
        words
            .iter()
            .any(|w| stems.iter().any(|stem| w.starts_with(stem)))
            .then_some(*topic)
    })
}

fn sounds_frustrated(text: &str) -> bool {
    text.contains("!!")
        || words(text).any(|w| FRUSTRATION_MARKERS.iter().any(|m| w.starts_with(m)))
}

/// Topic of the most recent user message that has one, and mood over the
/// last few user messages. `current` is the turn being answered.
pub fn analyze(history: &[Message], current: &str) -> FallbackContext {
    let user_texts = std::iter::once(current).chain(
        history
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str()),
    );

    let mut topic = None;
    let mut sentiment = Sentiment::Neutral;
    for (i, text) in user_texts.enumerate() {
        if topic.is_none() {
            topic = topic_of(text);
        }
        if i < SENTIMENT_LOOKBACK && sounds_frustrated(text) {
            sentiment = Sentiment::Frustrated;
        }
        if topic.is_some() && i + 1 >= SENTIMENT_LOOKBACK {
            break;
        }
    }

    FallbackContext {
        topic: topic.unwrap_or(Topic::General),
        sentiment,
    }
}

fn advice(topic: Topic) -> &'static str {
    match topic {
        Topic::Permissions => {
            "open your phone's health settings, check that the fitness app is allowed to read \
             and write the data types you need, then reopen the app"
        }
        Topic::Battery => {
            "turn off battery optimisation for the fitness app so it can sync in the \
             background, and keep your wearable charged above 20%"
        }
        Topic::Steps => {
            "make sure step counting is enabled in both the wearable's app and your phone's \
             health platform, then force a manual sync from the wearable's app"
        }
        Topic::Sleep => {
            "wear the device snugly overnight, confirm sleep tracking is on, and sync in the \
             morning before opening your health platform"
        }
        Topic::HeartRate => {
            "check that continuous heart-rate monitoring is enabled on the wearable and that \
             the heart-rate data type is shared with your health platform"
        }
        Topic::Workouts => {
            "finish and save the workout on the device first, then sync it manually; workouts \
             still in progress are not exported"
        }
        Topic::Sync => {
            "toggle Bluetooth off and on, keep the wearable close to your phone, and trigger a \
             manual sync from its app; if that fails, sign out and back in"
        }
        Topic::General => {
            "restart the app, check for updates to both the app and your phone, and trigger a \
             manual sync"
        }
    }
}

/// Compose the fallback reply for this turn.
pub fn compose(history: &[Message], current: &str) -> String {
    let context = analyze(history, current);
    let opener = match context.sentiment {
        Sentiment::Frustrated => "I'm sorry this keeps getting in your way. ",
        Sentiment::Neutral => "",
    };
    format!(
        "{opener}I can't reach the assistant service right now, but here is what usually \
         helps: {}. Please try again in a few minutes if the problem continues.",
        advice(context.topic)
    )
}
