//! Dense rendering of background, per-peak curves and the residual, sampled
//! at a configurable subdivision of the channel grid (§6).

use crate::region::Region;

#[derive(Debug, Clone, PartialEq)]
pub struct PeakRendering {
    pub id: u64,
    pub curve: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionRendering {
    pub channel: Vec<f64>,
    pub energy: Vec<f64>,
    pub background: Vec<f64>,
    pub full_fit: Vec<f64>,
    pub peaks: Vec<PeakRendering>,
    pub subdivisions: u8,
}

impl RegionRendering {
    pub fn compute(region: &Region, subdivisions: u8, energy_at: impl Fn(f64) -> f64) -> Self {
        let subdivisions = subdivisions.max(1);
        let left = region.left_channel();
        let right = region.right_channel();
        let step = 1.0 / subdivisions as f64;

        let mut channel = Vec::new();
        let mut x = left;
        while x <= right {
            channel.push(x);
            x += step;
        }

        let v = region.variables_cached();
        let energy: Vec<f64> = channel.iter().map(|&c| energy_at(c)).collect();
        let background: Vec<f64> = channel
            .iter()
            .map(|&c| region.background.eval_at(c, &v))
            .collect();
        let full_fit: Vec<f64> = channel.iter().map(|&c| region.eval_at(c, &v)).collect();

        let peaks = region
            .peaks
            .values()
            .map(|peak| {
                let curve = channel
                    .iter()
                    .map(|&c| {
                        region.background.eval_at(c, &v)
                            + peak.eval_at(c, &v, &region.default_peak.width)
                    })
                    .collect();
                PeakRendering { id: peak.id, curve }
            })
            .collect();

        Self {
            channel,
            energy,
            background,
            full_fit,
            peaks,
            subdivisions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weighted_data::WeightedData;

    #[test]
    fn rendering_subdivides_the_channel_grid() {
        let channel: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let count = vec![10.0; 40];
        let weight = vec![1.0; 40];
        let data = WeightedData::new(channel, count, weight).unwrap();
        let region = Region::create(data, 5).unwrap();
        let rendering = RegionRendering::compute(&region, 2, |c| c);
        // step = 0.5, span = 39, so we expect roughly 2x+1 samples.
        assert!(rendering.channel.len() > 40);
    }

    #[test]
    fn rendering_includes_one_curve_per_peak() {
        let channel: Vec<f64> = (0..60).map(|i| i as f64).collect();
        let count = vec![10.0; 60];
        let weight = vec![1.0; 60];
        let data = WeightedData::new(channel, count, weight).unwrap();
        let mut region = Region::create(data, 5).unwrap();
        region.add_peak(20.0, 30.0, 100.0).unwrap();
        region.add_peak(35.0, 45.0, 50.0).unwrap();
        region.reindex();
        let rendering = RegionRendering::compute(&region, 1, |c| c);
        assert_eq!(rendering.peaks.len(), 2);
    }
}
