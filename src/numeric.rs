use crate::{Error, Result};

/// A dense row-major 2D grid of `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatMap {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl FloatMap {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != width * height {
            return Err(Error::Analysis(format!(
                "map of {}x{} cannot hold {} values",
                width,
                height,
                data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn values(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn min(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// Bilinear resize with pixel-center alignment and clamped borders.
    pub fn resize_bilinear(&self, width: usize, height: usize) -> FloatMap {
        let scale_x = self.width as f32 / width as f32;
        let scale_y = self.height as f32 / height as f32;
        let xs: Vec<(usize, usize, f32)> = (0..width)
            .map(|x| sample_position(x, scale_x, self.width))
            .collect();

        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            let (y0, y1, fy) = sample_position(y, scale_y, self.height);
            for &(x0, x1, fx) in &xs {
                let top = self.get(x0, y0) * (1.0 - fx) + self.get(x1, y0) * fx;
                let bottom = self.get(x0, y1) * (1.0 - fx) + self.get(x1, y1) * fx;
                data.push(top * (1.0 - fy) + bottom * fy);
            }
        }
        FloatMap { width, height, data }
    }

    /// The `q`-th percentile (0..=100), interpolating linearly between order statistics.
    pub fn percentile(&self, q: f32) -> f32 {
        percentile(&self.data, q)
    }

    /// 8-bit view: values are scaled by 255 when the map maximum is at most 1.0,
    /// otherwise taken as already being in 8-bit range.
    pub fn to_u8(&self) -> Vec<u8> {
        let scale = if self.max() <= 1.0 { 255.0 } else { 1.0 };
        self.data.iter().map(|v| (v * scale) as u8).collect()
    }

    /// 8-bit view stretched so the map maximum lands on 255. An all-zero map stays zero.
    pub fn to_u8_max_normalized(&self) -> Vec<u8> {
        let max = self.max();
        if !(max > 0.0) {
            return vec![0; self.data.len()];
        }
        self.data.iter().map(|v| (v * 255.0 / max) as u8).collect()
    }
}

fn sample_position(dst: usize, scale: f32, src_len: usize) -> (usize, usize, f32) {
    let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(src_len - 1);
    let i1 = (i0 + 1).min(src_len - 1);
    let frac = if i0 == i1 { 0.0 } else { src - i0 as f32 };
    (i0, i1, frac)
}

pub fn percentile(values: &[f32], q: f32) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_wrong_length() {
        assert!(FloatMap::new(3, 3, vec![0.0; 8]).is_err());
    }

    #[test]
    fn percentile_interpolates_like_numpy() {
        let values: Vec<f32> = (1..=10).map(|v| v as f32).collect();
        // numpy.percentile(range(1, 11), 85) == 8.65
        assert!((percentile(&values, 85.0) - 8.65).abs() < 1e-5);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 10.0);
        assert_eq!(percentile(&[4.0], 85.0), 4.0);
    }

    #[test]
    fn resize_preserves_constant_maps_and_bounds() {
        let map = FloatMap::new(28, 28, vec![0.25; 28 * 28]).unwrap();
        let resized = map.resize_bilinear(256, 256);
        assert_eq!((resized.width(), resized.height()), (256, 256));
        assert!(resized.values().iter().all(|v| (v - 0.25).abs() < 1e-6));

        let ramp = FloatMap::new(2, 1, vec![0.0, 1.0]).unwrap();
        let wide = ramp.resize_bilinear(4, 1);
        // Outer samples clamp to the source edges, inner ones interpolate.
        assert_eq!(wide.values(), &[0.0, 0.25, 0.75, 1.0]);
    }

    #[test]
    fn to_u8_scales_normalized_maps_only() {
        let unit = FloatMap::new(2, 1, vec![0.5, 1.0]).unwrap();
        assert_eq!(unit.to_u8(), vec![127, 255]);

        let bytes = FloatMap::new(2, 1, vec![3.0, 200.0]).unwrap();
        assert_eq!(bytes.to_u8(), vec![3, 200]);
    }

    #[test]
    fn max_normalization_handles_zero_maps() {
        let zero = FloatMap::new(2, 2, vec![0.0; 4]).unwrap();
        assert_eq!(zero.to_u8_max_normalized(), vec![0; 4]);

        let map = FloatMap::new(2, 1, vec![1.0, 2.0]).unwrap();
        assert_eq!(map.to_u8_max_normalized(), vec![127, 255]);
    }
}
