//! Integration-time search.
//!
//! Finds an exposure for which the peak intensity of the spectrum lands
//! within a tolerance of a target fraction of the saturation level. The
//! search samples candidate times spread geometrically over the allowed
//! range, fits a straight line through the (time, peak) samples and solves
//! it for the target intensity, iterating a bounded number of rounds.

use crate::error::Result;
use tracing::{debug, info};

/// Acceptable deviation from the target intensity, percent.
pub(crate) const TARGET_TOLERANCE_PCT: f64 = 10.0;
/// Outer rounds before the search gives up.
pub(crate) const NUM_ATTEMPTS: usize = 5;
/// Geometrically spaced candidate times per round.
pub(crate) const CANDIDATE_POINTS: usize = 20;
/// Fraction of saturation above which a sample is discarded as clipped.
const CLIP_FRACTION: f64 = 0.9;

#[derive(Clone, Copy, Debug)]
pub(crate) struct SearchParams {
    /// Integration time currently configured for the channel; tried first.
    pub current_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub saturation: f64,
    /// Target peak intensity as a percentage of saturation, in (0, 100).
    pub target_pct: f64,
}

/// Run the search. `read_peak` acquires one spectrum at the given
/// integration time and reports its peak intensity.
///
/// Returns `Ok(Some(t))` with the chosen time on success (including the
/// clamped-to-maximum case), `Ok(None)` when every round was exhausted.
pub(crate) fn search(
    params: SearchParams,
    mut read_peak: impl FnMut(f64) -> Result<f64>,
) -> Result<Option<f64>> {
    let target_intensity = params.target_pct / 100.0 * params.saturation;
    let clip = CLIP_FRACTION * params.saturation;

    for attempt in 0..NUM_ATTEMPTS {
        info!(attempt, total = NUM_ATTEMPTS, "autointegration attempt");
        let mut times: Vec<f64> = Vec::new();
        let mut peaks: Vec<f64> = Vec::new();

        let mut candidates = vec![params.current_ms];
        candidates.extend(logspace(params.min_ms, params.max_ms, CANDIDATE_POINTS));

        for (i, &t) in candidates.iter().enumerate() {
            let peak = read_peak(t)?;
            if peak > clip {
                if i == 0 {
                    // The configured time clips; fall through to the sweep.
                    continue;
                }
                break;
            }
            times.push(t);
            peaks.push(peak);

            let Some((a, b)) = fit_line(&times, &peaks) else {
                continue;
            };
            debug!(slope = a, intercept = b, "fitted intensity line");
            let auto_time = (target_intensity - b) / a;
            if !auto_time.is_finite() {
                continue;
            }
            let auto_time = auto_time.clamp(params.min_ms, params.max_ms);

            let peak_at = read_peak(auto_time)?;
            let percentage = (peak_at - target_intensity).abs() / target_intensity * 100.0;
            info!(
                auto_time,
                peak = peak_at,
                percentage,
                "test integration time"
            );
            if percentage < TARGET_TOLERANCE_PCT
                || (auto_time - params.max_ms).abs() < 1e-6
            {
                return Ok(Some(auto_time));
            }
            if peak_at < clip {
                // Keep the sample to sharpen the next fit.
                times.push(auto_time);
                peaks.push(peak_at);
            }
        }
    }
    Ok(None)
}

/// `n` points spaced geometrically between `min` and `max`.
fn logspace(min: f64, max: f64, n: usize) -> Vec<f64> {
    let min = min.max(1e-3);
    let max = max.max(min);
    let (lo, hi) = (min.log10(), max.log10());
    (0..n)
        .map(|i| {
            let f = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
            10f64.powf(lo + f * (hi - lo))
        })
        .collect()
}

/// Least-squares straight line `y = a*x + b`. Needs at least two distinct
/// x values.
fn fit_line(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    if xs.len() < 2 {
        return None;
    }
    let n = xs.len() as f64;
    let sx: f64 = xs.iter().sum();
    let sy: f64 = ys.iter().sum();
    let sxx: f64 = xs.iter().map(|x| x * x).sum();
    let sxy: f64 = xs.iter().zip(ys).map(|(x, y)| x * y).sum();
    let denom = n * sxx - sx * sx;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let a = (n * sxy - sx * sy) / denom;
    let b = (sy - a * sx) / n;
    Some((a, b))
}

/// Peak intensity of a spectrum: the largest prominence among peaks at
/// least `width` samples wide, falling back to the raw maximum when no
/// such peak exists (flat or clipped spectra).
pub(crate) fn peak_intensity(pixels: &[f64]) -> f64 {
    max_prominence(pixels, 5)
        .unwrap_or_else(|| pixels.iter().cloned().fold(0.0, f64::max))
}

fn max_prominence(pixels: &[f64], min_width: usize) -> Option<f64> {
    let mut best: Option<f64> = None;
    for i in 1..pixels.len().saturating_sub(1) {
        let peak = pixels[i];
        if !(pixels[i - 1] < peak && peak > pixels[i + 1]) {
            continue;
        }
        // Walk outwards to the bases: the lowest point before terrain
        // rises above the peak again (or the edge).
        let mut left_min = peak;
        for j in (0..i).rev() {
            if pixels[j] > peak {
                break;
            }
            left_min = left_min.min(pixels[j]);
        }
        let mut right_min = peak;
        for &p in &pixels[i + 1..] {
            if p > peak {
                break;
            }
            right_min = right_min.min(p);
        }
        let prominence = peak - left_min.max(right_min);
        if prominence <= 0.0 {
            continue;
        }
        // Width at half prominence.
        let half = peak - prominence / 2.0;
        let mut width = 1;
        for j in (0..i).rev() {
            if pixels[j] < half {
                break;
            }
            width += 1;
        }
        for &p in &pixels[i + 1..] {
            if p < half {
                break;
            }
            width += 1;
        }
        if width >= min_width {
            best = Some(best.map_or(prominence, |b: f64| b.max(prominence)));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian(amplitude: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let x = (i as f64 - n as f64 / 2.0) / 20.0;
                amplitude * (-0.5 * x * x).exp()
            })
            .collect()
    }

    #[test]
    fn test_logspace_endpoints() {
        let pts = logspace(1.0, 10_000.0, 20);
        assert_eq!(pts.len(), 20);
        assert!((pts[0] - 1.0).abs() < 1e-9);
        assert!((pts[19] - 10_000.0).abs() < 1e-6);
        assert!(pts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_fit_line_exact() {
        let xs = [1.0, 2.0, 3.0];
        let ys = [2.5, 4.5, 6.5];
        let (a, b) = fit_line(&xs, &ys).unwrap();
        assert!((a - 2.0).abs() < 1e-9);
        assert!((b - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_fit_line_degenerate() {
        assert!(fit_line(&[1.0], &[2.0]).is_none());
        assert!(fit_line(&[3.0, 3.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_peak_intensity_prefers_prominence() {
        let mut pixels = gaussian(1000.0, 200);
        // A one-sample spike must not win over the wide line.
        pixels[10] = 5000.0;
        let peak = peak_intensity(&pixels);
        assert!((peak - 1000.0).abs() / 1000.0 < 0.1, "peak = {peak}");
    }

    #[test]
    fn test_peak_intensity_falls_back_to_max() {
        // Monotone ramp: no interior peak at all.
        let pixels: Vec<f64> = (0..100).map(|i| i as f64).collect();
        assert_eq!(peak_intensity(&pixels), 99.0);
    }

    #[test]
    fn test_search_converges_on_linear_device() {
        // peak = 0.5 counts/ms * t; target 80% of 200000 => t* = 320000.
        let params = SearchParams {
            current_ms: 1.0,
            min_ms: 1.0,
            max_ms: 1_000_000.0,
            saturation: 200_000.0,
            target_pct: 80.0,
        };
        let t = search(params, |t| Ok(0.5 * t)).unwrap().unwrap();
        assert!((t - 320_000.0).abs() / 320_000.0 < 0.05, "t = {t}");
    }

    #[test]
    fn test_search_clamped_to_max_is_success() {
        let params = SearchParams {
            current_ms: 1.0,
            min_ms: 1.0,
            max_ms: 10_000.0,
            saturation: 200_000.0,
            target_pct: 80.0,
        };
        let t = search(params, |t| Ok(0.5 * t)).unwrap().unwrap();
        assert!((t - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_search_gives_up_on_flat_response() {
        let params = SearchParams {
            current_ms: 1.0,
            min_ms: 1.0,
            max_ms: 10_000.0,
            saturation: 200_000.0,
            target_pct: 80.0,
        };
        assert!(search(params, |_| Ok(0.0)).unwrap().is_none());
    }

    #[test]
    fn test_search_breaks_on_clipped_sweep() {
        // Everything beyond the first candidate saturates; after the first
        // clipped sweep sample the round ends, and rounds repeat until the
        // attempts run out.
        let params = SearchParams {
            current_ms: 1.0,
            min_ms: 1.0,
            max_ms: 10_000.0,
            saturation: 200_000.0,
            target_pct: 80.0,
        };
        let mut reads = 0usize;
        let result = search(params, |_| {
            reads += 1;
            Ok(195_000.0)
        })
        .unwrap();
        assert!(result.is_none());
        // One clipped current + one clipped sweep sample per round.
        assert_eq!(reads, 2 * NUM_ATTEMPTS);
    }
}
