use std::time::Duration;

/// Randomizes expiries around a base value so entries written together do not
/// expire together.
#[derive(Debug, Clone, Copy)]
pub struct Unstable {
    deviation: f64,
}

impl Unstable {
    /// `deviation` is clamped into `[0, 1)`.
    pub fn new(deviation: f64) -> Self {
        let deviation = if deviation.is_finite() {
            deviation.clamp(0.0, 0.999)
        } else {
            0.0
        };
        Self { deviation }
    }

    pub fn deviation(&self) -> f64 {
        self.deviation
    }

    /// Returns a duration uniformly drawn from `base * [1 - deviation, 1 + deviation]`.
    pub fn around(&self, base: Duration) -> Duration {
        let factor = 1.0 + self.deviation - 2.0 * self.deviation * fastrand::f64();
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn around_stays_within_bounds() {
        let unstable = Unstable::new(0.05);
        let base = Duration::from_secs(1000);
        for _ in 0..1000 {
            let value = unstable.around(base);
            assert!(value >= Duration::from_millis(949_999), "{value:?} below bound");
            assert!(value <= Duration::from_millis(1_050_001), "{value:?} above bound");
        }
    }

    #[test]
    fn zero_deviation_is_exact() {
        let base = Duration::from_secs(60);
        assert_eq!(Unstable::new(0.0).around(base), base);
    }

    #[test]
    fn out_of_range_deviation_is_clamped() {
        assert_eq!(Unstable::new(-1.0).deviation(), 0.0);
        assert!(Unstable::new(3.0).deviation() < 1.0);
        assert_eq!(Unstable::new(f64::NAN).deviation(), 0.0);
    }
}
