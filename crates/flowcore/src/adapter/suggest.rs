use super::ArgKind;
use crate::operator::{to_suggestions, Suggestions};

const DURATION_LADDER: &[&str] = &[
    "100ms", "200ms", "500ms", "1s", "2s", "5s", "10s", "20s", "50s", "100s", "1m", "10m", "1h",
];

fn looks_like_duration(arg: &str) -> bool {
    let arg = arg.to_lowercase();
    ["duration", "time", "age"].iter().any(|hint| arg.contains(hint))
}

/// Last-resort suggestions derived only from the field kind
pub fn fallback_suggestions(kind: ArgKind, arg: &str) -> Suggestions {
    match kind {
        ArgKind::Bool => to_suggestions(["true", "false"]),
        ArgKind::Float => to_suggestions((0..=10).map(|i| format!("{:.1}", f64::from(i) * 0.5))),
        ArgKind::Int64 if looks_like_duration(arg) => to_suggestions(DURATION_LADDER.iter().copied()),
        ArgKind::Int | ArgKind::Int64 => {
            to_suggestions((0..=10).chain([100, 1000]).map(|i: i64| i.to_string()))
        }
        ArgKind::String => Suggestions::new(),
    }
}
