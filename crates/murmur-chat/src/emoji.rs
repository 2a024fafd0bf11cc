//! `:shortcode:` to emoji substitution for outgoing text.

use std::sync::LazyLock;

use regex::{Captures, Regex};

#[allow(clippy::expect_used)]
static SHORTCODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":([a-z0-9_+\-]+):").expect("shortcode pattern is valid"));

const SHORTCODES: &[(&str, &str)] = &[
    ("+1", "👍"),
    ("-1", "👎"),
    ("thumbsup", "👍"),
    ("thumbsdown", "👎"),
    ("smile", "😄"),
    ("grin", "😁"),
    ("joy", "😂"),
    ("wink", "😉"),
    ("heart", "❤️"),
    ("fire", "🔥"),
    ("rocket", "🚀"),
    ("tada", "🎉"),
    ("eyes", "👀"),
    ("thinking", "🤔"),
    ("wave", "👋"),
    ("clap", "👏"),
    ("cry", "😢"),
    ("skull", "💀"),
    ("100", "💯"),
    ("check", "✅"),
    ("x", "❌"),
    ("warning", "⚠️"),
    ("lock", "🔒"),
    ("key", "🔑"),
    ("robot", "🤖"),
    ("coffee", "☕"),
    ("shrug", "🤷"),
];

fn lookup(name: &str) -> Option<&'static str> {
    SHORTCODES
        .iter()
        .find(|(code, _)| *code == name)
        .map(|(_, emoji)| *emoji)
}

/// Replace known `:name:` shortcodes. Unknown ones are left as typed.
pub fn substitute_shortcodes(text: &str) -> String {
    SHORTCODE
        .replace_all(text, |caps: &Captures<'_>| {
            lookup(&caps[1]).map_or_else(|| caps[0].to_string(), ToString::to_string)
        })
        .into_owned()
}
