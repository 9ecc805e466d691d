//! Reconnect delay schedule.
//!
//! The schedule is attempt-based rather than purely exponential: a couple
//! of fast retries, then progressively long holds so a dead server is not
//! hammered. Each delay is jittered by up to +20% so a fleet of clients
//! does not redial in lockstep.

/// Jitter factor applied on top of the base delay (up to +20%).
pub const JITTER_FACTOR: f64 = 0.2;

/// Base reconnect delay for a given attempt count, in milliseconds.
///
/// | attempts so far | delay  |
/// |-----------------|--------|
/// | 0               | 0.5 s  |
/// | 1–2             | 15 s   |
/// | 3–4             | 45 s   |
/// | 5–9             | 600 s  |
/// | 10+             | 3600 s |
#[must_use]
pub fn reconnect_delay_ms(attempt: u32) -> u64 {
    match attempt {
        0 => 500,
        1..=2 => 15_000,
        3..=4 => 45_000,
        5..=9 => 600_000,
        _ => 3_600_000,
    }
}

/// Reconnect delay with jitter applied.
///
/// `random` must be in `[0.0, 1.0)`; callers supply it from their PRNG so
/// the schedule itself stays deterministic and testable.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn reconnect_delay_with_jitter(attempt: u32, random: f64) -> u64 {
    let base = reconnect_delay_ms(attempt);
    let jitter = 1.0 + random.clamp(0.0, 1.0) * JITTER_FACTOR;
    ((base as f64) * jitter).round() as u64
}
