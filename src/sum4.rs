//! SUM4: the standard analytical background-subtraction technique using two
//! flat edge samples (Lindstrom 1994).

use crate::error::{PeakFitError, Result};
use crate::weighted_data::WeightedData;

/// A value with its statistical uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ValueUncert {
    pub value: f64,
    pub sigma: f64,
}

impl ValueUncert {
    pub fn new(value: f64, sigma: f64) -> Self {
        Self { value, sigma }
    }

    pub fn zero() -> Self {
        Self {
            value: 0.0,
            sigma: 0.0,
        }
    }
}

/// A contiguous left or right sample flanking a peak.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Sum4Edge {
    pub left: f64,
    pub right: f64,
    pub min: f64,
    pub max: f64,
    pub sum: ValueUncert,
    pub average: ValueUncert,
}

impl Sum4Edge {
    pub fn empty() -> Self {
        Self {
            left: 0.0,
            right: -1.0,
            min: 0.0,
            max: 0.0,
            sum: ValueUncert::zero(),
            average: ValueUncert::zero(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.right < self.left
    }

    /// Variance of the edge's average count, used to propagate background
    /// uncertainty under a peak (`sum4.cpp`'s `SUM4Edge::variance`).
    pub fn variance(&self) -> f64 {
        self.average.sigma * self.average.sigma
    }

    /// Construct from a weighted-data slice (empty slice yields an empty edge).
    pub fn from_data(data: &WeightedData) -> Self {
        if data.is_empty() {
            return Self::empty();
        }
        let min = data.count.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = data
            .count
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = data.count.iter().sum();
        // Poisson-style propagated uncertainty: sqrt(sum of squared channel weights).
        let sum_var: f64 = data.weight.iter().map(|w| w * w).sum();
        let n = data.len() as f64;
        let average = sum / n;
        let average_sigma = sum_var.sqrt() / n;
        Self {
            left: data.channel[0],
            right: *data.channel.last().unwrap(),
            min,
            max,
            sum: ValueUncert::new(sum, sum_var.sqrt()),
            average: ValueUncert::new(average, average_sigma),
        }
    }
}

/// Linear background derived from two edges, purely derived (no state).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Sum4Background {
    pub x_offset: f64,
    pub base: f64,
    pub slope: f64,
}

impl Sum4Background {
    /// Derive base/slope from two edges flanking a peak.
    pub fn from_edges(left: &Sum4Edge, right: &Sum4Edge) -> Result<Self> {
        if left.is_empty() || right.is_empty() {
            return Err(PeakFitError::invalid_shape(
                "SUM4 background requires two non-empty edges",
            ));
        }
        let x1 = (left.left + left.right) / 2.0;
        let x2 = (right.left + right.right) / 2.0;
        if (x2 - x1).abs() < f64::EPSILON {
            return Err(PeakFitError::invalid_shape(
                "SUM4 background edges must not coincide",
            ));
        }
        let y1 = left.average.value;
        let y2 = right.average.value;
        let slope = (y2 - y1) / (x2 - x1);
        let x_offset = x1;
        let base = y1;
        Ok(Self {
            x_offset,
            base,
            slope,
        })
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.base + self.slope * (x - self.x_offset)
    }
}

/// Per-peak SUM4 area.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Sum4Area {
    pub left: f64,
    pub right: f64,
    /// Channel width of the sample, inclusive of endpoints (`right - left + 1`).
    pub peak_width: f64,
    pub gross: ValueUncert,
    pub background: ValueUncert,
    pub peak: ValueUncert,
    pub centroid: ValueUncert,
    pub fwhm: ValueUncert,
}

impl Sum4Area {
    /// `sum4.cpp`'s `SUM4` constructor: trapezoidal background under the
    /// sample, second-moment centroid/FWHM, and error propagation from the
    /// two flanking edges.
    pub fn compute(
        data: &WeightedData,
        background: &Sum4Background,
        left_edge: &Sum4Edge,
        right_edge: &Sum4Edge,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(PeakFitError::invalid_shape(
                "SUM4 area requires a non-empty sample",
            ));
        }
        let lchan = data.channel[0];
        let rchan = *data.channel.last().unwrap();
        let peak_width = if rchan < lchan { 0.0 } else { rchan - lchan + 1.0 };

        let gross: f64 = data.count.iter().sum();
        let gross_var: f64 = data.weight.iter().map(|w| w * w).sum();

        let bkg_var = (0.5 * peak_width).powi(2) * (left_edge.variance() + right_edge.variance());
        let bkg = 0.5 * peak_width * (background.eval(rchan) + background.eval(lchan));

        let peak = gross - bkg;
        let peak_var = gross_var + bkg_var;

        let mut sum_y_net = 0.0;
        let mut c_sum = 0.0;
        let mut c2_sum = 0.0;
        for (&x, &c) in data.channel.iter().zip(data.count.iter()) {
            let yn = c - background.eval(x);
            sum_y_net += yn;
            c_sum += x * yn;
            c2_sum += x * x * yn;
        }
        let centroid = c_sum / sum_y_net;
        let centroid_variance = c2_sum / sum_y_net - centroid * centroid;
        let fwhm = 2.0 * (centroid_variance * 4.0_f64.ln()).sqrt();

        Ok(Self {
            left: lchan,
            right: rchan,
            peak_width,
            gross: ValueUncert::new(gross, gross_var.sqrt()),
            background: ValueUncert::new(bkg, bkg_var.sqrt()),
            peak: ValueUncert::new(peak, peak_var.sqrt()),
            centroid: ValueUncert::new(centroid, centroid_variance.sqrt()),
            fwhm: ValueUncert::new(fwhm, f64::NAN),
        })
    }

    /// Currie (1968) 1-5 detection-quality indicator, derived from the net
    /// peak area at a fixed background variance. Constants follow the
    /// original implementation's `get_currie_quality_indicator`.
    pub fn currie_quality(&self) -> u8 {
        let var = self.background.sigma * self.background.sigma;
        let lq = 50.0 * (1.0 + (1.0 + var / 12.5).sqrt());
        let ld = 2.71 + 4.65 * var.sqrt();
        let lc = 2.33 * var.sqrt();
        let net = self.peak.value;
        if net >= lq {
            1
        } else if net >= ld {
            2
        } else if net >= lc {
            3
        } else if net > 0.0 {
            4
        } else {
            5
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_edge(channels: &[f64], value: f64) -> Sum4Edge {
        let data = WeightedData::new(
            channels.to_vec(),
            vec![value; channels.len()],
            vec![1.0; channels.len()],
        )
        .unwrap();
        Sum4Edge::from_data(&data)
    }

    #[test]
    fn empty_edge_is_empty() {
        let data = WeightedData::new(vec![], vec![], vec![]).unwrap();
        let edge = Sum4Edge::from_data(&data);
        assert!(edge.is_empty());
    }

    #[test]
    fn background_derived_from_two_flat_edges_is_flat() {
        let left = flat_edge(&[0.0, 1.0, 2.0], 10.0);
        let right = flat_edge(&[20.0, 21.0, 22.0], 10.0);
        let bkg = Sum4Background::from_edges(&left, &right).unwrap();
        assert!(bkg.slope.abs() < 1e-9);
        assert!((bkg.eval(11.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn gross_minus_background_equals_peak_area_identically() {
        let left = flat_edge(&[0.0, 1.0, 2.0], 5.0);
        let right = flat_edge(&[20.0, 21.0, 22.0], 5.0);
        let bkg = Sum4Background::from_edges(&left, &right).unwrap();
        let data = WeightedData::new(
            vec![10.0, 11.0, 12.0],
            vec![100.0, 200.0, 100.0],
            vec![1.0, 1.0, 1.0],
        )
        .unwrap();
        let area = Sum4Area::compute(&data, &bkg, &left, &right).unwrap();
        assert!((area.gross.value - area.background.value - area.peak.value).abs() < 1e-9);
    }

    #[test]
    fn peak_width_is_right_minus_left_plus_one() {
        let left = flat_edge(&[0.0, 1.0], 1.0);
        let right = flat_edge(&[20.0, 21.0], 1.0);
        let bkg = Sum4Background::from_edges(&left, &right).unwrap();
        let data =
            WeightedData::new(vec![10.0, 11.0, 12.0, 13.0], vec![1.0; 4], vec![1.0; 4]).unwrap();
        let area = Sum4Area::compute(&data, &bkg, &left, &right).unwrap();
        assert!((area.peak_width - 4.0).abs() < 1e-9);
    }

    #[test]
    fn fwhm_is_a_second_moment_statistic_not_the_sample_width() {
        // A narrow Gaussian-like bump sampled over a much wider window: the
        // statistical FWHM should come out well under the sample width.
        let left = flat_edge(&[0.0, 1.0], 0.0);
        let right = flat_edge(&[40.0, 41.0], 0.0);
        let bkg = Sum4Background::from_edges(&left, &right).unwrap();
        let channel: Vec<f64> = (10..=30).map(|i| i as f64).collect();
        let count: Vec<f64> = channel
            .iter()
            .map(|&x| {
                let spread = (x - 20.0) / 2.0;
                (-spread * spread).exp() * 100.0
            })
            .collect();
        let weight = vec![1.0; channel.len()];
        let data = WeightedData::new(channel, count, weight).unwrap();
        let area = Sum4Area::compute(&data, &bkg, &left, &right).unwrap();
        assert!(area.fwhm.value > 0.0 && area.fwhm.value < area.peak_width);
    }

    #[test]
    fn currie_quality_is_monotone_nonincreasing_in_net_area() {
        let mut areas = Vec::new();
        for net in [0.0, 5.0, 50.0, 500.0, 5000.0] {
            areas.push(Sum4Area {
                left: 0.0,
                right: 1.0,
                peak_width: 1.0,
                gross: ValueUncert::new(net, 0.0),
                background: ValueUncert::new(0.0, 2.0),
                peak: ValueUncert::new(net, 0.0),
                centroid: ValueUncert::new(0.0, 0.0),
                fwhm: ValueUncert::new(1.0, 0.0),
            });
        }
        let qualities: Vec<u8> = areas.iter().map(|a| a.currie_quality()).collect();
        for w in qualities.windows(2) {
            assert!(w[1] <= w[0]);
        }
    }
}
