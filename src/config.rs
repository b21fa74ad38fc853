use std::env;
use std::str::FromStr;

pub const DEFAULT_INTENT_TASK_LIMIT: usize = 50;
pub const DEFAULT_CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    /// How many tasks (in board order) are summarized for the intent service.
    pub intent_task_limit: usize,
    pub change_feed_capacity: usize,
    /// Refetch the affected slice when a superseded mutation fails instead of
    /// restoring its outdated snapshot.
    pub resync_on_stale: bool,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            intent_task_limit: DEFAULT_INTENT_TASK_LIMIT,
            change_feed_capacity: DEFAULT_CHANGE_FEED_CAPACITY,
            resync_on_stale: true,
        }
    }
}

impl BoardConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            intent_task_limit: parse_or(
                &lookup,
                "BOARD_INTENT_TASK_LIMIT",
                defaults.intent_task_limit,
            )
            .max(1),
            change_feed_capacity: parse_or(
                &lookup,
                "BOARD_CHANGE_FEED_CAPACITY",
                defaults.change_feed_capacity,
            )
            .max(1),
            resync_on_stale: lookup("BOARD_RESYNC_ON_STALE")
                .map(|value| flag_value(&value))
                .unwrap_or(defaults.resync_on_stale),
        }
    }
}

pub fn env_flag(name: &str) -> bool {
    env::var(name).map(|value| flag_value(&value)).unwrap_or(false)
}

fn flag_value(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes"
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, fallback = %default, "ignoring invalid config value");
            default
        }),
        None => default,
    }
}
