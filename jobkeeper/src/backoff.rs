//! Retry delays for failed one-off jobs.
//!
//! When a one-off job fails and still has retries left it is put back in the
//! [`crate::job::JobState::Scheduled`] state, delayed by the configured [`Strategy`] applied to
//! its number of consecutive failures. Recurring jobs ignore this and follow their cron
//! expression.
//!
//! Three strategies are provided, each of which can be combined with a [`Jitter`] and clamped:
//!
//! 1. [`BackoffStrategy::constant`]
//! 2. [`BackoffStrategy::linear`]
//! 3. [`BackoffStrategy::exponential`]
//!
//! # Example
//!
//! ```
//! # use jobkeeper::backoff::{BackoffStrategy, Jitter, Strategy};
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(5))
//!     .with_max(TimeDelta::minutes(5))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(1)));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::seconds(4));
//! assert!(strategy.backoff(1) <= TimeDelta::seconds(6));
//! assert!(strategy.backoff(20) <= TimeDelta::minutes(5) + TimeDelta::seconds(1));
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// Ceiling on every backoff, whatever the strategy, bounds and jitter.
pub const MAX_BACKOFF: TimeDelta = TimeDelta::days(365);

/// Maps a number of consecutive failures to the delay before the next attempt.
pub trait Strategy {
    fn backoff(&self, consecutive_failures: u32) -> TimeDelta;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _consecutive_failures: u32) -> TimeDelta {
        self.delay
    }
}

/// `step * consecutive_failures`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    step: TimeDelta,
}

impl Strategy for Linear {
    fn backoff(&self, consecutive_failures: u32) -> TimeDelta {
        let factor = i32::try_from(consecutive_failures).unwrap_or(i32::MAX);
        self.step.checked_mul(factor).unwrap_or(MAX_BACKOFF)
    }
}

/// `base * 2^(consecutive_failures - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
}

impl Strategy for Exponential {
    fn backoff(&self, consecutive_failures: u32) -> TimeDelta {
        let exponent = consecutive_failures.saturating_sub(1);
        2_i32
            .checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(MAX_BACKOFF)
    }
}

/// A random offset applied on top of a computed backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Uniformly distributed in `-delta..=delta`.
    Absolute(TimeDelta),
    /// Uniformly distributed in `-ratio * backoff..=ratio * backoff`. The ratio is clamped to
    /// `0.0..=1.0`.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, value: TimeDelta) -> TimeDelta {
        let ceiling = MAX_BACKOFF.num_milliseconds();
        let spread = match self {
            Self::Absolute(delta) => delta.num_milliseconds().abs().min(ceiling),
            Self::Relative(ratio) => {
                let ratio = if ratio.is_finite() { ratio.abs().min(1.0) } else { 0.0 };
                let value = value.num_milliseconds().clamp(-ceiling, ceiling);
                (value as f64 * ratio).abs().round() as i64
            }
        };
        if spread == 0 {
            return value;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        value
            .checked_add(&TimeDelta::milliseconds(offset))
            .unwrap_or(value)
    }
}

/// A [`Strategy`] together with optional jitter and bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
    max: Option<TimeDelta>,
}

impl BackoffStrategy<Constant> {
    /// Always waits `delay`.
    ///
    /// ```
    /// # use jobkeeper::backoff::{BackoffStrategy, Strategy};
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::constant(TimeDelta::seconds(15));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(15));
    /// assert_eq!(strategy.backoff(7), TimeDelta::seconds(15));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Linear> {
    /// Waits `step` longer after every consecutive failure.
    ///
    /// ```
    /// # use jobkeeper::backoff::{BackoffStrategy, Strategy};
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::linear(TimeDelta::seconds(10)).with_max(TimeDelta::seconds(25));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
    /// assert_eq!(strategy.backoff(2), TimeDelta::seconds(20));
    /// assert_eq!(strategy.backoff(3), TimeDelta::seconds(25));
    /// ```
    pub const fn linear(step: TimeDelta) -> Self {
        Self::new(Linear { step })
    }
}

impl BackoffStrategy<Exponential> {
    /// Doubles the wait after every consecutive failure, starting at `base`.
    ///
    /// ```
    /// # use jobkeeper::backoff::{BackoffStrategy, Strategy};
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
    /// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
    /// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base })
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
            max: None,
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Lower bound, applied after jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }

    /// Upper bound, applied before jitter. Never above [`MAX_BACKOFF`].
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = Some(max);
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, consecutive_failures: u32) -> TimeDelta {
        let max = self.max.map_or(MAX_BACKOFF, |max| max.min(MAX_BACKOFF));
        let mut backoff = self
            .strategy
            .backoff(consecutive_failures)
            .clamp(TimeDelta::zero(), max.max(TimeDelta::zero()));
        if let Some(jitter) = self.jitter {
            backoff = jitter.apply(backoff);
        }
        backoff.max(self.min).min(MAX_BACKOFF)
    }
}
