//! Robust normalization of representations into 8-bit RGB grids.
//!
//! Channels are summed in contiguous groups down to three display channels,
//! each sample is stretched between its 1st and 99th percentile, and the
//! samples are tiled into one image.

use crate::error::NormalizeError;
use crate::params::{GRID_IMAGES_PER_ROW, GRID_PADDING, ROBUST_MAX_PERCENTILE, ROBUST_MIN_PERCENTILE};
use crate::tensor::Representation;
use rayon::prelude::*;

/// Channel-planar 8-bit RGB image, (3, H, W)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GridImage {
    pub height: usize,
    pub width: usize,
    pub data: Vec<u8>,
}

impl GridImage {
    pub fn pixel(&self, channel: usize, y: usize, x: usize) -> u8 {
        self.data[(channel * self.height + y) * self.width + x]
    }

    /// Pixel-interleaved RGB bytes, as image encoders expect
    pub fn to_rgb_interleaved(&self) -> Vec<u8> {
        let plane = self.height * self.width;
        (0..plane).flat_map(|i| [self.data[i], self.data[plane + i], self.data[2 * plane + i]]).collect()
    }
}

/// 1-based rank `k` of the `q`-th percentile among `m` values:
/// `1 + round(0.01 · q · (m - 1))` with ties to even
pub fn percentile_rank(q: f64, m: usize) -> usize {
    let rank = 1 + (0.01 * q * (m.saturating_sub(1)) as f64).round_ties_even() as usize;
    rank.clamp(1, m.max(1))
}

/// `k`-th smallest of `values` with `k = percentile_rank(q, len)`
pub fn percentile(values: &[f32], q: f64) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    let k = percentile_rank(q, values.len());
    let mut scratch = values.to_vec();
    let (_, kth, _) = scratch.select_nth_unstable_by(k - 1, f32::total_cmp);
    *kth
}

/// Sum channels `j·k .. (j+1)·k` into display channel `j`, with `k = C / 3`
pub fn group_channels(rep: &Representation) -> Result<Representation, NormalizeError> {
    let [batch, channels, h, w] = rep.shape();
    if channels == 0 || channels % 3 != 0 {
        return Err(NormalizeError::ChannelsNotMultipleOfThree(channels));
    }
    let k = channels / 3;
    let mut out = Representation::zeros(batch, 3, h, w);
    let plane = h * w;
    for b in 0..batch {
        for c in 0..channels {
            let src = rep.offset(b, c, 0, 0);
            let dst = out.offset(b, c / k, 0, 0);
            let (src_plane, dst_plane) = (&rep.data()[src..src + plane], dst..dst + plane);
            for (o, &v) in out.data_mut()[dst_plane].iter_mut().zip(src_plane) {
                *o += v;
            }
        }
    }
    Ok(out)
}

/// Stretch one grouped sample to bytes between its robust extremes
pub fn normalize_sample(sample: usize, values: &[f32]) -> Result<Vec<u8>, NormalizeError> {
    let robust_max = percentile(values, ROBUST_MAX_PERCENTILE);
    let robust_min = percentile(values, ROBUST_MIN_PERCENTILE);
    if robust_max == robust_min {
        return Err(NormalizeError::DegenerateRange { sample, value: robust_min });
    }
    let range = robust_max - robust_min;
    Ok(values
        .iter()
        .map(|&v| (255.0 * ((v - robust_min) / range)).clamp(0.0, 255.0) as u8)
        .collect())
}

/// Tile (3, H, W) byte images into rows of up to eight with a 2 px zero
/// border. A single image is returned without padding.
pub fn make_grid(images: &[Vec<u8>], height: usize, width: usize) -> GridImage {
    if images.len() == 1 {
        return GridImage { height, width, data: images[0].clone() };
    }
    let columns = images.len().clamp(1, GRID_IMAGES_PER_ROW);
    let rows = images.len().div_ceil(columns);
    let (cell_h, cell_w) = (height + GRID_PADDING, width + GRID_PADDING);
    let grid_h = rows * cell_h + GRID_PADDING;
    let grid_w = columns * cell_w + GRID_PADDING;
    let mut data = vec![0u8; 3 * grid_h * grid_w];
    for (i, image) in images.iter().enumerate() {
        let top = (i / columns) * cell_h + GRID_PADDING;
        let left = (i % columns) * cell_w + GRID_PADDING;
        for c in 0..3 {
            for y in 0..height {
                let src = (c * height + y) * width;
                let dst = (c * grid_h + top + y) * grid_w + left;
                data[dst..dst + width].copy_from_slice(&image[src..src + width]);
            }
        }
    }
    GridImage { height: grid_h, width: grid_w, data }
}

/// Convert a (B, C, H, W) representation into a tiled RGB image
pub fn create_image(rep: &Representation) -> Result<GridImage, NormalizeError> {
    if rep.batch() == 0 || rep.height() == 0 || rep.width() == 0 {
        return Err(NormalizeError::EmptyRepresentation);
    }
    let grouped = group_channels(rep)?;
    let images = (0..grouped.batch())
        .into_par_iter()
        .map(|b| normalize_sample(b, grouped.sample(b)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(make_grid(&images, grouped.height(), grouped.width()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_rank_stays_in_range() {
        for m in 1..2000 {
            for q in [0.0, 1.0, 50.0, 99.0, 100.0] {
                let k = percentile_rank(q, m);
                assert!((1..=m).contains(&k), "q={q} m={m} k={k}");
            }
        }
    }

    #[test]
    fn percentile_uses_round_half_even_ranks() {
        let values: Vec<f32> = (1..=100).rev().map(|v| v as f32).collect();
        assert_eq!(percentile(&values, 1.0), 2.0);
        assert_eq!(percentile(&values, 99.0), 99.0);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 100.0);
        // 0.01 * 50 * 2 = 1.0 exactly; 0.01 * 25 * 2 = 0.5 rounds to 0
        assert_eq!(percentile_rank(50.0, 3), 2);
        assert_eq!(percentile_rank(25.0, 3), 1);
    }

    #[test]
    fn equal_values_have_equal_robust_extremes() {
        let values = vec![0.25f32; 300];
        assert_eq!(percentile(&values, 1.0), percentile(&values, 99.0));
        assert!(matches!(
            normalize_sample(4, &values),
            Err(NormalizeError::DegenerateRange { sample: 4, .. })
        ));
    }

    #[test]
    fn channel_triplets_are_summed_in_contiguous_blocks() {
        let data: Vec<f32> = (0..9).map(|c| 10f32.powi(c % 3) * (c / 3 + 1) as f32).collect();
        let rep = Representation::from_vec([1, 9, 1, 1], data).unwrap();
        let grouped = group_channels(&rep).unwrap();
        // out j = sum of channels 3j, 3j+1, 3j+2
        assert_eq!(grouped.data(), &[111.0, 222.0, 333.0]);
        let six = Representation::zeros(1, 6, 1, 1);
        assert_eq!(group_channels(&six).unwrap().shape(), [1, 3, 1, 1]);
        let bad = Representation::zeros(1, 4, 1, 1);
        assert!(matches!(group_channels(&bad), Err(NormalizeError::ChannelsNotMultipleOfThree(4))));
    }

    #[test]
    fn normalization_clamps_outside_the_robust_range() {
        let mut values: Vec<f32> = (0..100).map(|v| v as f32).collect();
        values.push(-1000.0);
        values.push(1000.0);
        let bytes = normalize_sample(0, &values).unwrap();
        assert_eq!(bytes[100], 0);
        assert_eq!(bytes[101], 255);
        assert!(bytes[..100].windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn grid_layout_pads_and_tiles() {
        let a = vec![1u8; 3 * 2 * 3];
        let b = vec![2u8; 3 * 2 * 3];
        let grid = make_grid(&[a.clone(), b], 2, 3);
        assert_eq!((grid.height, grid.width), (6, 12));
        assert_eq!(grid.pixel(0, 0, 0), 0);
        assert_eq!(grid.pixel(0, 2, 2), 1);
        assert_eq!(grid.pixel(2, 3, 7), 2);
        assert_eq!(grid.pixel(1, 2, 6), 0);

        let single = make_grid(&[a.clone()], 2, 3);
        assert_eq!((single.height, single.width), (2, 3));
        assert_eq!(single.data, a);

        let many: Vec<Vec<u8>> = (0..9).map(|i| vec![i as u8; 3 * 2 * 3]).collect();
        let grid = make_grid(&many, 2, 3);
        assert_eq!((grid.height, grid.width), (2 * 4 + 2, 8 * 5 + 2));
    }

    #[test]
    fn create_image_end_to_end() {
        let data: Vec<f32> = (0..2 * 6 * 3 * 3).map(|v| (v % 17) as f32).collect();
        let rep = Representation::from_vec([2, 6, 3, 3], data).unwrap();
        let image = create_image(&rep).unwrap();
        assert_eq!((image.height, image.width), (7, 12));
        assert_eq!(image.data.len(), 3 * 7 * 12);
        assert_eq!(image.to_rgb_interleaved().len(), image.data.len());

        let flat = Representation::zeros(1, 3, 2, 2);
        assert!(matches!(create_image(&flat), Err(NormalizeError::DegenerateRange { .. })));
    }
}
