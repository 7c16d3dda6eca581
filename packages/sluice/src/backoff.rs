//! Backoff policies for pacing writers and retries.
//!
//! A [`Backoff`] maps a count (an attempt number, or the number of values still pending in a
//! channel) to an optional delay. `None` means "no delay", and every policy returns `None` for
//! counts up to its threshold:
//!
//! - [`BackoffBuilder::constant_delay`]: `d` once active;
//! - [`BackoffBuilder::linear_delay`]: `d × (count - n)`;
//! - [`BackoffBuilder::exponential_delay`]: `d × 2^(count - n - 1)`;
//! - [`BackoffBuilder::jitter_delay`]: random in `[d × 3^(k-1), d × 3^k]` with `k = count - n`.
//!
//! Policies compose: [`Backoff::capped_to`] clamps, [`Backoff::with_jitter`] randomizes downward
//! and [`Backoff::plus`] adds two policies, each applying its own threshold. The delay for a
//! count is derived from the count alone, so jitter never feeds back into later delays.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use sluice::Backoff;
//!
//! let backoff = Backoff::after_count(2).linear_delay(Duration::from_millis(10));
//!
//! assert_eq!(backoff.delay(2), None);
//! assert_eq!(backoff.delay(3), Some(Duration::from_millis(10)));
//! assert_eq!(backoff.delay(5), Some(Duration::from_millis(30)));
//!
//! let capped = backoff.capped_to(Duration::from_millis(20));
//! assert_eq!(capped.delay(5), Some(Duration::from_millis(20)));
//! ```

use rand::Rng;
use std::time::Duration;

/// Composable policy computing a delay from a count.
///
/// Immutable; the builder-style methods consume and return a new policy. Implements `Eq` and
/// `Hash` so that configurations containing it can key a
/// [`RoutineCache`](crate::routine::RoutineCache).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Backoff(Kind);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Kind {
    NoDelay,
    Constant { after: u32, delay: Duration },
    Linear { after: u32, delay: Duration },
    Exponential { after: u32, delay: Duration },
    Jitter { after: u32, delay: Duration },
    Capped { inner: Box<Kind>, max: Duration },
    // jitter fraction kept in permille so the policy stays Eq + Hash
    Jittered { inner: Box<Kind>, permille: u16 },
    Sum(Box<Kind>, Box<Kind>),
}

/// Threshold stage of building a [`Backoff`], see [`Backoff::after_count`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BackoffBuilder {
    after: u32,
}

impl Default for Backoff {
    /// Returns [`Backoff::no_delay`].
    fn default() -> Self {
        Backoff::no_delay()
    }
}

impl Backoff {
    /// Policy which never delays
    pub fn no_delay() -> Self {
        Backoff(Kind::NoDelay)
    }

    /// Start building a policy which stays inactive for counts up to `count`
    pub fn after_count(count: u32) -> BackoffBuilder {
        BackoffBuilder { after: count }
    }

    /// Constant delay for every count above zero
    ///
    /// Shorthand for `Backoff::after_count(0).constant_delay(delay)`.
    ///
    /// # Panics
    /// If `delay` is zero.
    pub fn constant(delay: Duration) -> Self {
        Backoff::after_count(0).constant_delay(delay)
    }

    /// Clamp every active delay to `max`
    ///
    /// # Panics
    /// If `max` is zero.
    pub fn capped_to(self, max: Duration) -> Self {
        assert!(!max.is_zero(), "backoff cap must be positive");
        Backoff(Kind::Capped { inner: Box::new(self.0), max })
    }

    /// Randomize every active delay into `[(1 - fraction) × delay, delay]`
    ///
    /// # Panics
    /// If `fraction` is not within `[0, 1]`.
    pub fn with_jitter(self, fraction: f32) -> Self {
        assert!(
            (0.0..=1.0).contains(&fraction),
            "backoff jitter fraction must be within [0, 1], got {}", fraction,
        );
        let permille = (fraction * 1000.0).round() as u16;
        Backoff(Kind::Jittered { inner: Box::new(self.0), permille })
    }

    /// Sum this policy and `other` per count
    ///
    /// Each operand applies its own threshold, so the sum only grows once the later-starting
    /// policy becomes active.
    pub fn plus(self, other: Backoff) -> Self {
        Backoff(Kind::Sum(Box::new(self.0), Box::new(other.0)))
    }

    /// Whether this policy never delays
    pub fn is_no_delay(&self) -> bool {
        matches!(self.0, Kind::NoDelay)
    }

    /// Compute the delay for the given count, or `None` for no delay
    pub fn delay(&self, count: u32) -> Option<Duration> {
        self.0.delay(count)
    }
}

impl BackoffBuilder {
    /// Constant delay once active
    ///
    /// # Panics
    /// If `delay` is zero.
    pub fn constant_delay(self, delay: Duration) -> Backoff {
        check_delay(delay);
        Backoff(Kind::Constant { after: self.after, delay })
    }

    /// Delay growing linearly with each count past the threshold
    ///
    /// # Panics
    /// If `delay` is zero.
    pub fn linear_delay(self, delay: Duration) -> Backoff {
        check_delay(delay);
        Backoff(Kind::Linear { after: self.after, delay })
    }

    /// Delay doubling with each count past the threshold
    ///
    /// # Panics
    /// If `delay` is zero.
    pub fn exponential_delay(self, delay: Duration) -> Backoff {
        check_delay(delay);
        Backoff(Kind::Exponential { after: self.after, delay })
    }

    /// Randomized delay tripling its range with each count past the threshold
    ///
    /// The delay for the `k`-th active count is uniform in `[d × 3^(k-1), d × 3^k]`, so it is
    /// never below the un-jittered base and increases with the count.
    ///
    /// # Panics
    /// If `delay` is zero.
    pub fn jitter_delay(self, delay: Duration) -> Backoff {
        check_delay(delay);
        Backoff(Kind::Jitter { after: self.after, delay })
    }
}

fn check_delay(delay: Duration) {
    assert!(!delay.is_zero(), "backoff delay must be positive");
}

impl Kind {
    fn delay(&self, count: u32) -> Option<Duration> {
        match self {
            &Kind::NoDelay => None,
            &Kind::Constant { after, delay } => active(count, after).map(|_| delay),
            &Kind::Linear { after, delay } => {
                active(count, after).map(|k| delay.saturating_mul(k))
            }
            &Kind::Exponential { after, delay } => {
                active(count, after).map(|k| scale_pow(delay, 2, k - 1))
            }
            &Kind::Jitter { after, delay } => active(count, after).map(|k| {
                let low = scale_pow(delay, 3, k - 1);
                random_between(low, low.saturating_mul(3))
            }),
            &Kind::Capped { ref inner, max } => inner.delay(count).map(|d| d.min(max)),
            &Kind::Jittered { ref inner, permille } => inner.delay(count).map(|d| {
                let keep = (1000 - permille.min(1000)) as u128;
                let low_nanos = d.as_nanos() * keep / 1000;
                random_between(from_nanos_saturating(low_nanos), d)
            }),
            &Kind::Sum(ref a, ref b) => match (a.delay(count), b.delay(count)) {
                (None, None) => None,
                (Some(d), None) | (None, Some(d)) => Some(d),
                (Some(d1), Some(d2)) => Some(d1.saturating_add(d2)),
            },
        }
    }
}

// number of counts past the threshold, if past it.
fn active(count: u32, after: u32) -> Option<u32> {
    count.checked_sub(after).filter(|&k| k > 0)
}

// delay × base^exp, saturating.
fn scale_pow(delay: Duration, base: u32, exp: u32) -> Duration {
    match base.checked_pow(exp) {
        Some(factor) => delay.saturating_mul(factor),
        None => Duration::MAX,
    }
}

fn from_nanos_saturating(nanos: u128) -> Duration {
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

// uniform random delay in [low, high].
fn random_between(low: Duration, high: Duration) -> Duration {
    if low >= high {
        return low;
    }
    let low_nanos = low.as_nanos().min(u64::MAX as u128) as u64;
    let high_nanos = high.as_nanos().min(u64::MAX as u128) as u64;
    if low_nanos >= high_nanos {
        return low;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(low_nanos..=high_nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn no_delay_below_threshold() {
        let policies = [
            Backoff::after_count(3).constant_delay(ms(10)),
            Backoff::after_count(3).linear_delay(ms(10)),
            Backoff::after_count(3).exponential_delay(ms(10)),
            Backoff::after_count(3).jitter_delay(ms(10)),
            Backoff::after_count(3).linear_delay(ms(10)).capped_to(ms(5)),
            Backoff::after_count(3).linear_delay(ms(10)).with_jitter(0.5),
        ];
        for policy in &policies {
            for count in 0..=3 {
                assert_eq!(policy.delay(count), None, "{:?} at {}", policy, count);
            }
            assert!(policy.delay(4).is_some(), "{:?} inactive at 4", policy);
        }
        assert_eq!(Backoff::no_delay().delay(u32::MAX), None);
        assert!(Backoff::default().is_no_delay());
    }

    #[test]
    fn constant_delay() {
        let policy = Backoff::after_count(1).constant_delay(ms(7));
        assert_eq!(policy.delay(1), None);
        for count in 2..20 {
            assert_eq!(policy.delay(count), Some(ms(7)));
        }
        assert_eq!(Backoff::constant(ms(3)).delay(1), Some(ms(3)));
    }

    #[test]
    fn linear_delay() {
        let policy = Backoff::after_count(2).linear_delay(ms(10));
        assert_eq!(policy.delay(3), Some(ms(10)));
        assert_eq!(policy.delay(4), Some(ms(20)));
        assert_eq!(policy.delay(12), Some(ms(100)));
    }

    #[test]
    fn exponential_delay() {
        let policy = Backoff::after_count(0).exponential_delay(ms(100));
        assert_eq!(policy.delay(1), Some(ms(100)));
        assert_eq!(policy.delay(2), Some(ms(200)));
        assert_eq!(policy.delay(3), Some(ms(400)));
        assert_eq!(policy.delay(5), Some(ms(1600)));
    }

    #[test]
    fn monotonic_after_threshold() {
        let linear = Backoff::after_count(4).linear_delay(ms(3));
        let exponential = Backoff::after_count(4).exponential_delay(ms(3));
        for count in 5..200 {
            assert!(linear.delay(count) <= linear.delay(count + 1));
            assert!(exponential.delay(count) <= exponential.delay(count + 1));
        }
    }

    #[test]
    fn huge_counts_saturate() {
        let policy = Backoff::after_count(0).exponential_delay(ms(100));
        assert_eq!(policy.delay(u32::MAX), Some(Duration::MAX));
        let policy = Backoff::after_count(0).jitter_delay(ms(100));
        assert_eq!(policy.delay(u32::MAX), Some(Duration::MAX));
        let policy = Backoff::after_count(0).exponential_delay(ms(100)).capped_to(ms(500));
        assert_eq!(policy.delay(u32::MAX), Some(ms(500)));
    }

    #[test]
    fn jitter_delay_bounds() {
        let policy = Backoff::after_count(1).jitter_delay(ms(10));
        for _ in 0..100 {
            let first = policy.delay(2).unwrap();
            assert!(first >= ms(10) && first <= ms(30), "{:?}", first);
            let third = policy.delay(4).unwrap();
            assert!(third >= ms(90) && third <= ms(270), "{:?}", third);
        }
    }

    #[test]
    fn capped_never_exceeds_max() {
        let policy = Backoff::after_count(0).linear_delay(ms(10)).capped_to(ms(35));
        assert_eq!(policy.delay(1), Some(ms(10)));
        for count in 0..100 {
            assert!(policy.delay(count).unwrap_or_default() <= ms(35));
        }
        // applies from the first active count
        let policy = Backoff::after_count(2).constant_delay(ms(50)).capped_to(ms(20));
        assert_eq!(policy.delay(3), Some(ms(20)));
    }

    #[test]
    fn with_jitter_bounds() {
        let policy = Backoff::after_count(0).constant_delay(ms(1000)).with_jitter(0.25);
        for _ in 0..100 {
            let delay = policy.delay(1).unwrap();
            assert!(delay >= ms(750) && delay <= ms(1000), "{:?}", delay);
        }
        let exact = Backoff::after_count(0).constant_delay(ms(1000)).with_jitter(0.0);
        assert_eq!(exact.delay(1), Some(ms(1000)));
    }

    #[test]
    fn plus_sums_independent_thresholds() {
        let short = Backoff::after_count(1).linear_delay(ms(10));
        let long = Backoff::after_count(5).constant_delay(ms(100));
        let sum = short.clone().plus(long.clone());
        for count in 0..20 {
            let expect = match (short.delay(count), long.delay(count)) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or_default() + b.unwrap_or_default()),
            };
            assert_eq!(sum.delay(count), expect, "at {}", count);
        }
        assert_eq!(sum.delay(1), None);
        assert_eq!(sum.delay(3), Some(ms(20)));
        assert_eq!(sum.delay(6), Some(ms(150)));
    }

    #[test]
    #[should_panic(expected = "backoff delay must be positive")]
    fn zero_delay_panics() {
        let _ = Backoff::after_count(1).linear_delay(Duration::ZERO);
    }

    #[test]
    #[should_panic(expected = "jitter fraction")]
    fn jitter_fraction_out_of_range_panics() {
        let _ = Backoff::constant(ms(1)).with_jitter(1.5);
    }

    #[test]
    fn value_equality() {
        let a = Backoff::after_count(2).linear_delay(ms(10)).with_jitter(0.5);
        let b = Backoff::after_count(2).linear_delay(ms(10)).with_jitter(0.5);
        assert_eq!(a, b);
        assert_ne!(a, Backoff::after_count(2).linear_delay(ms(10)));
    }
}
