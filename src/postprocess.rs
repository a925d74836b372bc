use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::model::DepthMap;

/// ColorBrewer "Spectral" anchors, low to high.
const SPECTRAL: [[u8; 3]; 11] = [
    [158, 1, 66],
    [213, 62, 79],
    [244, 109, 67],
    [253, 174, 97],
    [254, 224, 139],
    [255, 255, 191],
    [230, 245, 152],
    [171, 221, 164],
    [102, 194, 165],
    [50, 136, 189],
    [94, 79, 162],
];

/// Per-frame min-max scaling of `depth` into `0..=255`.
///
/// Only finite values contribute to the range; non-finite pixels map to 0.
/// A flat map, or one without any finite value, yields an all-zero image.
pub fn normalize_depth(depth: &DepthMap) -> GrayImage {
    let (width, height) = (depth.width() as u32, depth.height() as u32);
    let Some(stats) = depth.stats() else {
        return GrayImage::new(width, height);
    };
    let range = stats.max - stats.min;
    if range <= 0.0 || !range.is_finite() {
        return GrayImage::new(width, height);
    }

    let pixels = depth
        .values()
        .iter()
        .map(|&value| {
            if value.is_finite() {
                ((value - stats.min) / range * 255.0).clamp(0.0, 255.0) as u8
            } else {
                0
            }
        })
        .collect();

    // Dimensions come from the map itself, so the buffer always fits.
    GrayImage::from_raw(width, height, pixels).unwrap_or_else(|| GrayImage::new(width, height))
}

/// Repeats the gray channel into RGB.
pub fn gray_to_rgb(gray: &GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        let Luma([v]) = *gray.get_pixel(x, y);
        Rgb([v, v, v])
    })
}

/// 256-entry lookup table from an 8-bit level to RGB.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Colormap {
    lut: [[u8; 3]; 256],
}

impl Colormap {
    /// Reversed Spectral: low levels are violet-blue, high levels deep red.
    pub fn spectral_r() -> Self {
        let mut anchors = SPECTRAL;
        anchors.reverse();
        Self::from_anchors(&anchors)
    }

    /// Linear interpolation between evenly spaced anchors.
    pub fn from_anchors(anchors: &[[u8; 3]]) -> Self {
        let mut lut = [[0u8; 3]; 256];
        match anchors {
            [] => {}
            [only] => lut.fill(*only),
            _ => {
                let segments = (anchors.len() - 1) as f64;
                for (level, entry) in lut.iter_mut().enumerate() {
                    let position = level as f64 / 255.0 * segments;
                    let index = (position.floor() as usize).min(anchors.len() - 2);
                    let t = position - index as f64;
                    let (lo, hi) = (anchors[index], anchors[index + 1]);
                    for channel in 0..3 {
                        let value = lo[channel] as f64 + (hi[channel] as f64 - lo[channel] as f64) * t;
                        entry[channel] = (value + 1e-9).clamp(0.0, 255.0) as u8;
                    }
                }
            }
        }
        Self { lut }
    }

    pub fn color(&self, level: u8) -> [u8; 3] {
        self.lut[level as usize]
    }

    pub fn apply(&self, gray: &GrayImage) -> RgbImage {
        RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
            let Luma([v]) = *gray.get_pixel(x, y);
            Rgb(self.color(v))
        })
    }
}

impl Default for Colormap {
    fn default() -> Self {
        Self::spectral_r()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(width: usize, height: usize, values: Vec<f32>) -> DepthMap {
        DepthMap::new(width, height, values).unwrap()
    }

    #[test]
    fn normalized_range_spans_full_byte() {
        let depth = map(3, 2, vec![0.5, 1.0, 2.0, 3.5, 4.0, 2.25]);
        let gray = normalize_depth(&depth);
        let min = gray.pixels().map(|p| p.0[0]).min().unwrap();
        let max = gray.pixels().map(|p| p.0[0]).max().unwrap();
        assert_eq!((min, max), (0, 255));
        // (2.25 - 0.5) / 3.5 * 255 = 127.5, truncated.
        assert_eq!(gray.get_pixel(2, 1).0[0], 127);
    }

    #[test]
    fn constant_map_normalizes_to_zero() {
        let gray = normalize_depth(&map(4, 4, vec![7.0; 16]));
        assert!(gray.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn non_finite_values_are_ignored() {
        let depth = map(
            4,
            1,
            vec![1.0, f32::NAN, 3.0, f32::NEG_INFINITY],
        );
        let gray = normalize_depth(&depth);
        assert_eq!(gray.as_raw(), &vec![0, 0, 255, 0]);

        let all_nan = normalize_depth(&map(2, 1, vec![f32::NAN, f32::NAN]));
        assert!(all_nan.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn spectral_r_endpoints_and_midpoint() {
        let cmap = Colormap::spectral_r();
        assert_eq!(cmap.color(0), [94, 79, 162]);
        assert_eq!(cmap.color(255), [158, 1, 66]);
        // Level 51 lands exactly on the third reversed anchor (51 / 255 * 10 = 2).
        assert_eq!(cmap.color(51), [102, 194, 165]);
    }

    #[test]
    fn colormap_apply_keeps_dimensions() {
        let gray = GrayImage::from_fn(5, 3, |x, _| Luma([(x * 60) as u8]));
        let rgb = Colormap::default().apply(&gray);
        assert_eq!(rgb.dimensions(), (5, 3));
        assert_eq!(rgb.get_pixel(0, 0).0, [94, 79, 162]);
    }

    #[test]
    fn gray_repeats_into_three_channels() {
        let gray = GrayImage::from_fn(2, 2, |x, y| Luma([(x + 2 * y) as u8 * 10]));
        let rgb = gray_to_rgb(&gray);
        assert_eq!(rgb.get_pixel(1, 1).0, [30, 30, 30]);
    }
}
