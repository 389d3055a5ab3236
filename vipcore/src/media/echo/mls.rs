//! Maximum-length sequence used as the calibration probe.
//!
//! An MLS of period `N` has a two-valued circular autocorrelation
//! (`N` at lag zero, `-1` elsewhere), which turns cross-correlation of the
//! microphone signal against the probe into a direct impulse response
//! estimate.

use once_cell::sync::Lazy;

const ORDER: u32 = 9;
pub const MLS_LENGTH: usize = (1 << ORDER) - 1;

static SEQUENCE: Lazy<Vec<f32>> = Lazy::new(|| generate(ORDER));

/// The probe as +1/-1 chips.
pub fn mls_sequence() -> &'static [f32] {
    &SEQUENCE
}

/// Fibonacci LFSR with recurrence `a[n+9] = a[n] ^ a[n+4]`.
fn generate(order: u32) -> Vec<f32> {
    let len = (1usize << order) - 1;
    let mut state: u32 = (1 << order) - 1;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let bit = state & 1;
        out.push(if bit == 1 { 1.0 } else { -1.0 });
        let feedback = (state ^ (state >> 4)) & 1;
        state = (state >> 1) | (feedback << (order - 1));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_with_one_extra_positive_chip() {
        let seq = mls_sequence();
        assert_eq!(seq.len(), MLS_LENGTH);
        let sum: f32 = seq.iter().sum();
        assert_eq!(sum, 1.0);
    }

    #[test]
    fn circular_autocorrelation_is_two_valued() {
        let seq = mls_sequence();
        let n = seq.len();
        for lag in [0usize, 1, 7, 100, 510] {
            let r: f32 = (0..n).map(|i| seq[i] * seq[(i + lag) % n]).sum();
            if lag == 0 {
                assert_eq!(r, n as f32);
            } else {
                assert_eq!(r, -1.0, "lag {lag}");
            }
        }
    }
}
