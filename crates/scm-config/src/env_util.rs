//! Small env parsing helpers shared by the config structs.
//!
//! Unparseable values are ignored (the default wins) rather than failing
//! process startup; a typo'd tuning knob must not take the fleet down.

use std::env;

pub fn env_str(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

pub fn env_u32(name: &str) -> Option<u32> {
    env_str(name)?.trim().parse().ok()
}

pub fn env_u64(name: &str) -> Option<u64> {
    env_str(name)?.trim().parse().ok()
}

pub fn env_f64(name: &str) -> Option<f64> {
    env_str(name)?.trim().parse().ok()
}

/// String booleans, `true` / `false` (case-insensitive; `1`/`0` accepted).
pub fn env_bool(name: &str) -> Option<bool> {
    match env_str(name)?.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Comma-separated list; entries are trimmed, empties dropped.
pub fn env_list(name: &str) -> Option<Vec<String>> {
    let raw = env_str(name)?;
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
