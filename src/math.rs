use std::cmp::Ordering;

use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use num_traits::Float;

/// A straight line `y = slope * x + intercept`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    #[must_use]
    pub fn evaluate(&self, x: f64) -> f64 {
        self.slope.mul_add(x, self.intercept)
    }

    /// The abscissa at which the line reaches `y`
    #[must_use]
    pub fn invert(&self, y: f64) -> f64 {
        (y - self.intercept) / self.slope
    }
}

/// Ordinary least-squares line through `(x, y)`
///
/// Minimises the sum of squared vertical distances. Returns `None` when fewer than two points are
/// given, or when all `x` coincide and the slope is undetermined.
///
/// # Examples
///
/// ```
/// use adc_calib::math::least_squares_line;
/// use ndarray::arr1;
///
/// let fit = least_squares_line(arr1(&[1., 2., 3.]).view(), arr1(&[3., 5., 7.]).view()).unwrap();
/// approx::assert_relative_eq!(fit.slope, 2.);
/// approx::assert_relative_eq!(fit.intercept, 1.);
/// ```
#[must_use]
pub fn least_squares_line(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Option<LinearFit> {
    assert_eq!(x.len(), y.len(), "abscissa and ordinate lengths differ");
    if x.len() < 2 {
        return None;
    }
    let x_mean = x.mean()?;
    let y_mean = y.mean()?;

    // Centred sums keep the normal equations well conditioned for ADC counts in the thousands
    let dx: Array1<f64> = x.mapv(|xi| xi - x_mean);
    let dy: Array1<f64> = y.mapv(|yi| yi - y_mean);
    let sxx = dx.dot(&dx);
    let sxy = dx.dot(&dy);

    if sxx <= f64::EPSILON * x_mean.abs().max(1.0) * x_mean.abs().max(1.0) {
        return None;
    }
    let slope = sxy / sxx;
    let fit = LinearFit {
        slope,
        intercept: slope.mul_add(-x_mean, y_mean),
    };
    (fit.slope.is_finite() && fit.intercept.is_finite()).then_some(fit)
}

/// Theil-Sen line through `(x, y)`
///
/// The slope is the median of the slopes of all point pairs with distinct abscissae and the
/// intercept the median of `y - slope * x`. Up to roughly 29% of the points may be arbitrarily
/// corrupted without dragging the line, which makes this the fallback when a least-squares line is
/// captured by a high-leverage outlier.
#[must_use]
pub fn theil_sen_line(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Option<LinearFit> {
    assert_eq!(x.len(), y.len(), "abscissa and ordinate lengths differ");
    let mut slopes = (0..x.len())
        .tuple_combinations()
        .filter(|&(ii, jj)| x[ii] != x[jj])
        .map(|(ii, jj)| (y[jj] - y[ii]) / (x[jj] - x[ii]))
        .collect::<Vec<_>>();
    let slope = median(&mut slopes)?;

    let mut intercepts = x
        .iter()
        .zip(y.iter())
        .map(|(xi, yi)| slope.mul_add(-xi, *yi))
        .collect::<Vec<_>>();
    let intercept = median(&mut intercepts)?;

    Some(LinearFit { slope, intercept })
}

/// Median of `values`, reordering them in place. `None` for an empty slice.
pub fn median<T: Float>(values: &mut [T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        let two = T::one() + T::one();
        Some((values[mid - 1] + values[mid]) / two)
    } else {
        Some(values[mid])
    }
}

/// Root mean square of `values`, zero for an empty slice
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}
