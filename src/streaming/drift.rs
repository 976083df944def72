// Transmission-skew compensation between the two electrode channels
//
// Estimates a constant integer lag by normalized cross-correlation of the
// de-meaned channels, then shifts the reference channel by that lag. This is
// applied once per aligned block; it does not track per-sample jitter.

/// Lag (in samples) of `reference` relative to `front` that maximizes their
/// normalized cross-correlation, searched over `[-max_lag, max_lag]`.
///
/// A positive lag means the reference trails the front channel: `front[i]`
/// lines up with `reference[i + lag]`. Flat or too-short inputs return 0.
pub fn estimate_lag(front: &[f32], reference: &[f32], max_lag: usize) -> isize {
    let n = front.len().min(reference.len());
    if n < 2 {
        return 0;
    }
    let max_lag = max_lag.min(n / 4) as isize;

    let demean = |x: &[f32]| -> Vec<f64> {
        let mean = x[..n].iter().map(|&v| v as f64).sum::<f64>() / n as f64;
        x[..n].iter().map(|&v| v as f64 - mean).collect()
    };
    let f = demean(front);
    let r = demean(reference);

    let mut best_lag = 0isize;
    let mut best_score = f64::NEG_INFINITY;

    for lag in -max_lag..=max_lag {
        let (f_start, r_start) = if lag >= 0 {
            (0usize, lag as usize)
        } else {
            ((-lag) as usize, 0usize)
        };
        let overlap = n - lag.unsigned_abs();

        let mut dot = 0.0;
        let mut f_energy = 0.0;
        let mut r_energy = 0.0;
        for i in 0..overlap {
            let a = f[f_start + i];
            let b = r[r_start + i];
            dot += a * b;
            f_energy += a * a;
            r_energy += b * b;
        }

        let denom = (f_energy * r_energy).sqrt();
        if denom <= f64::EPSILON {
            continue;
        }

        let score = dot / denom;
        // Ties resolve toward the smallest shift
        if score > best_score + 1e-12
            || ((score - best_score).abs() <= 1e-12 && lag.unsigned_abs() < best_lag.unsigned_abs())
        {
            best_score = score;
            best_lag = lag;
        }
    }

    best_lag
}

/// Apply `lag` (as returned by [`estimate_lag`]) to a pair of equal-length
/// channels and their timestamps, truncating to the overlapping region.
pub fn apply_lag(
    front: Vec<f32>,
    reference: Vec<f32>,
    timestamps: Vec<f64>,
    lag: isize,
) -> (Vec<f32>, Vec<f32>, Vec<f64>) {
    if lag == 0 {
        return (front, reference, timestamps);
    }

    let n = front.len().min(reference.len()).min(timestamps.len());
    let shift = lag.unsigned_abs().min(n);
    let overlap = n - shift;

    if lag > 0 {
        (
            front[..overlap].to_vec(),
            reference[shift..shift + overlap].to_vec(),
            timestamps[..overlap].to_vec(),
        )
    } else {
        (
            front[shift..shift + overlap].to_vec(),
            reference[..overlap].to_vec(),
            timestamps[shift..shift + overlap].to_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chirp(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let t = i as f32 / 250.0;
                (2.0 * std::f32::consts::PI * (3.0 + 20.0 * t) * t).sin() + 0.3 * (i % 7) as f32
            })
            .collect()
    }

    #[test]
    fn test_recovers_known_shift() {
        let base = chirp(300);
        let front = base[10..260].to_vec();

        // Reference trails by 3 samples
        let trailing = base[7..257].to_vec();
        assert_eq!(estimate_lag(&front, &trailing, 10), 3);

        // Reference leads by 4 samples
        let leading = base[14..264].to_vec();
        assert_eq!(estimate_lag(&front, &leading, 10), -4);
    }

    #[test]
    fn test_flat_input_has_no_lag() {
        assert_eq!(estimate_lag(&[1.0; 50], &[2.0; 50], 5), 0);
        assert_eq!(estimate_lag(&[1.0], &[2.0], 5), 0);
    }

    #[test]
    fn test_apply_lag_truncates() {
        let front = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let reference = vec![10.0, 11.0, 12.0, 13.0, 14.0];
        let ts = vec![0.0, 4.0, 8.0, 12.0, 16.0];

        let (f, r, t) = apply_lag(front.clone(), reference.clone(), ts.clone(), 2);
        assert_eq!(f, vec![0.0, 1.0, 2.0]);
        assert_eq!(r, vec![12.0, 13.0, 14.0]);
        assert_eq!(t, vec![0.0, 4.0, 8.0]);

        let (f, r, t) = apply_lag(front, reference, ts, -1);
        assert_eq!(f, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(r, vec![10.0, 11.0, 12.0, 13.0]);
        assert_eq!(t, vec![4.0, 8.0, 12.0, 16.0]);
    }
}
