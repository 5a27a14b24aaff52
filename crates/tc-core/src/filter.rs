//! Exponential moving-average smoothing of delay samples.
//!
//! The filter ramps in: the k-th sample is averaged with divisor
//! `min(k, length)`, so the first `length` samples form a straight
//! arithmetic mean before the filter settles into a fixed-coefficient EWMA.

use anyhow::{ensure, Result};

use crate::tmv::Tmv;

/// First-order EWMA over [`Tmv`] samples.
#[derive(Debug, Clone)]
pub struct Ewma {
    div: i64,
    cnt: i64,
    sum: Tmv,
}

impl Ewma {
    /// `length` is the steady-state divisor; must be at least 1.
    pub fn new(length: i64) -> Result<Ewma> {
        ensure!(length >= 1, "ewma length must be >= 1, got {}", length);
        Ok(Ewma { div: length, cnt: 0, sum: Tmv::ZERO })
    }

    /// Folds in one sample and returns the updated average.
    pub fn sample(&mut self, val: Tmv) -> Tmv {
        self.cnt += 1;
        let div = self.div.min(self.cnt);
        self.sum = self.sum + (val - self.sum) / div;
        self.sum
    }

    /// Current smoothed value.
    pub fn value(&self) -> Tmv {
        self.sum
    }

    /// Discards all accumulated state.
    pub fn reset(&mut self) {
        self.sum = Tmv::ZERO;
        self.cnt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_must_be_positive() {
        assert!(Ewma::new(0).is_err());
        assert!(Ewma::new(-3).is_err());
        assert!(Ewma::new(1).is_ok());
    }

    #[test]
    fn test_first_sample_passes_through() {
        let mut f = Ewma::new(8).unwrap();
        assert_eq!(f.sample(Tmv::from_nanos(1234)), Tmv::from_nanos(1234));
    }

    #[test]
    fn test_constant_input_is_steady_state() {
        let mut f = Ewma::new(4).unwrap();
        let v = Tmv::from_nanos(500);
        for _ in 0..100 {
            assert_eq!(f.sample(v), v);
        }
        assert_eq!(f.value(), v);
    }

    #[test]
    fn test_ramp_in_is_arithmetic_mean() {
        // Until `length` samples arrive the divisor tracks the count, so the
        // output is the plain mean of what has been seen.
        let mut f = Ewma::new(16).unwrap();
        f.sample(Tmv::from_nanos(100));
        let s2 = f.sample(Tmv::from_nanos(300));
        assert_eq!(s2, Tmv::from_nanos(200));
        let s3 = f.sample(Tmv::from_nanos(800));
        assert_eq!(s3, Tmv::from_nanos(400));
    }

    #[test]
    fn test_steady_state_coefficient() {
        let mut f = Ewma::new(2).unwrap();
        f.sample(Tmv::from_nanos(0));
        f.sample(Tmv::from_nanos(0));
        // cnt > div: sum += (val - sum) / 2
        assert_eq!(f.sample(Tmv::from_nanos(100)), Tmv::from_nanos(50));
        assert_eq!(f.sample(Tmv::from_nanos(100)), Tmv::from_nanos(75));
    }

    #[test]
    fn test_preserves_sign_of_difference() {
        let mut f = Ewma::new(4).unwrap();
        for _ in 0..8 {
            f.sample(Tmv::from_nanos(1000));
        }
        let below = f.sample(Tmv::from_nanos(-3000));
        assert!(below < Tmv::from_nanos(1000));
        let mut g = Ewma::new(4).unwrap();
        for _ in 0..8 {
            g.sample(Tmv::from_nanos(-1000));
        }
        assert!(g.value() == Tmv::from_nanos(-1000));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut f = Ewma::new(4).unwrap();
        f.sample(Tmv::from_nanos(400));
        f.sample(Tmv::from_nanos(400));
        f.reset();
        assert_eq!(f.value(), Tmv::ZERO);
        // After reset the ramp-in restarts: first sample passes through.
        assert_eq!(f.sample(Tmv::from_nanos(-70)), Tmv::from_nanos(-70));
    }
}
