//! Human-like pauses around sends.

use std::time::Duration;

use {
    chatrelay_config::{DelayRange, PacingConfig},
    rand::Rng,
};

/// Typing window for a text, picked by character count.
#[must_use]
pub fn typing_range(cfg: &PacingConfig, text: &str) -> DelayRange {
    let len = text.chars().count();
    if len <= cfg.short_max_chars {
        cfg.short_typing
    } else if len <= cfg.medium_max_chars {
        cfg.medium_typing
    } else {
        cfg.long_typing
    }
}

/// Uniform draw from an inclusive range. Inverted ranges collapse to `min_ms`.
#[must_use]
pub fn draw(range: DelayRange) -> Duration {
    if range.max_ms <= range.min_ms {
        return Duration::from_millis(range.min_ms);
    }
    Duration::from_millis(rand::rng().random_range(range.min_ms..=range.max_ms))
}

#[must_use]
pub fn typing_delay(cfg: &PacingConfig, text: &str) -> Duration {
    draw(typing_range(cfg, text))
}

/// Pause between marking a chat seen and acting on it.
#[must_use]
pub fn seen_pause(cfg: &PacingConfig) -> Duration {
    draw(cfg.seen_pause)
}
