//! A region of spectrum as three parallel sequences: channel abscissa,
//! counts, and per-channel statistical weight.

use crate::error::{PeakFitError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WeightStrategy {
    /// `√count`.
    True,
    /// `count ≥ 25` uses true; else `max(√((c[n-1]+c[n]+c[n+1])/3), 1)`.
    PhillipsMarlow,
    /// `√(count + 1)`.
    RevayStudent,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WeightedData {
    pub channel: Vec<f64>,
    pub count: Vec<f64>,
    pub weight: Vec<f64>,
}

impl WeightedData {
    pub fn new(channel: Vec<f64>, count: Vec<f64>, weight: Vec<f64>) -> Result<Self> {
        if channel.len() != count.len() || channel.len() != weight.len() {
            return Err(PeakFitError::invalid_shape(format!(
                "channel/count/weight length mismatch: {} vs {} vs {}",
                channel.len(),
                count.len(),
                weight.len()
            )));
        }
        Ok(Self {
            channel,
            count,
            weight,
        })
    }

    /// Build from channel/count, computing weights with the given strategy.
    pub fn with_strategy(
        channel: Vec<f64>,
        count: Vec<f64>,
        strategy: WeightStrategy,
    ) -> Result<Self> {
        if channel.len() != count.len() {
            return Err(PeakFitError::invalid_shape(format!(
                "channel/count length mismatch: {} vs {}",
                channel.len(),
                count.len()
            )));
        }
        let n = count.len();
        let weight = match strategy {
            WeightStrategy::True => count.iter().map(|&c| c.max(0.0).sqrt()).collect(),
            WeightStrategy::RevayStudent => count.iter().map(|&c| (c + 1.0).sqrt()).collect(),
            WeightStrategy::PhillipsMarlow => (0..n)
                .map(|i| {
                    let c = count[i];
                    if c >= 25.0 {
                        c.sqrt()
                    } else {
                        let lo = if i == 0 { count[i] } else { count[i - 1] };
                        let hi = if i + 1 >= n { count[i] } else { count[i + 1] };
                        (((lo + count[i] + hi) / 3.0).sqrt()).max(1.0)
                    }
                })
                .collect(),
        };
        Ok(Self {
            channel,
            count,
            weight,
        })
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    /// A subset by left/right channel bounds (inclusive), matched by nearest
    /// index since channels need only be monotonically increasing.
    pub fn subset_range(&self, left_channel: f64, right_channel: f64) -> WeightedData {
        let l = self
            .channel
            .iter()
            .position(|&c| c >= left_channel)
            .unwrap_or(self.channel.len());
        let r = self
            .channel
            .iter()
            .rposition(|&c| c <= right_channel)
            .map(|i| i + 1)
            .unwrap_or(0);
        if l >= r {
            return WeightedData {
                channel: vec![],
                count: vec![],
                weight: vec![],
            };
        }
        WeightedData {
            channel: self.channel[l..r].to_vec(),
            count: self.count[l..r].to_vec(),
            weight: self.weight[l..r].to_vec(),
        }
    }

    /// Left prefix of `n` samples.
    pub fn left_prefix(&self, n: usize) -> WeightedData {
        let n = n.min(self.len());
        WeightedData {
            channel: self.channel[..n].to_vec(),
            count: self.count[..n].to_vec(),
            weight: self.weight[..n].to_vec(),
        }
    }

    /// Right prefix of `n` samples.
    pub fn right_prefix(&self, n: usize) -> WeightedData {
        let len = self.len();
        let n = n.min(len);
        WeightedData {
            channel: self.channel[len - n..].to_vec(),
            count: self.count[len - n..].to_vec(),
            weight: self.weight[len - n..].to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_lengths() {
        let err = WeightedData::new(vec![1.0, 2.0], vec![1.0], vec![1.0, 1.0]);
        assert!(err.is_err());
    }

    #[test]
    fn true_weight_is_sqrt_count() {
        let wd =
            WeightedData::with_strategy(vec![0.0, 1.0], vec![4.0, 9.0], WeightStrategy::True)
                .unwrap();
        assert!((wd.weight[0] - 2.0).abs() < 1e-12);
        assert!((wd.weight[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn revay_student_is_sqrt_count_plus_one() {
        let wd = WeightedData::with_strategy(vec![0.0], vec![3.0], WeightStrategy::RevayStudent)
            .unwrap();
        assert!((wd.weight[0] - 4.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn phillips_marlow_uses_true_above_threshold() {
        let wd =
            WeightedData::with_strategy(vec![0.0], vec![30.0], WeightStrategy::PhillipsMarlow)
                .unwrap();
        assert!((wd.weight[0] - 30.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn phillips_marlow_floors_at_one_below_threshold() {
        let wd = WeightedData::with_strategy(
            vec![0.0, 1.0, 2.0],
            vec![0.0, 0.0, 0.0],
            WeightStrategy::PhillipsMarlow,
        )
        .unwrap();
        assert!(wd.weight.iter().all(|&w| w >= 1.0));
    }

    #[test]
    fn subset_range_picks_inclusive_bounds() {
        let wd = WeightedData::new(
            vec![0.0, 1.0, 2.0, 3.0, 4.0],
            vec![1.0; 5],
            vec![1.0; 5],
        )
        .unwrap();
        let sub = wd.subset_range(1.0, 3.0);
        assert_eq!(sub.channel, vec![1.0, 2.0, 3.0]);
    }
}
