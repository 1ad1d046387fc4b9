//! Renderings of an anomaly map for human inspection.
use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{imageops::FilterType, ImageFormat, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::drawing::draw_line_segment_mut;

use crate::config::RenderConfig;
use crate::numeric::FloatMap;
use crate::types::AnomalyResult;
use crate::Result;

pub const CONTOUR_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Jet color map: dark blue for 0 through cyan, yellow to dark red for 255.
pub fn jet(value: u8) -> Rgb<u8> {
    let t = value as f32 / 255.0;
    let channel = |center: f32| -> u8 {
        let v = (1.5 - (4.0 * t - center).abs()).clamp(0.0, 1.0);
        (v * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

fn colorize(values: &[u8], width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| jet(values[(y * width + x) as usize]))
}

/// The anomaly map false-colored after the 8-bit conversion of [`FloatMap::to_u8`].
pub fn heatmap(map: &FloatMap) -> RgbImage {
    colorize(&map.to_u8(), map.width() as u32, map.height() as u32)
}

/// `alpha * base + (1 - alpha) * heat`, where the heat image is stretched to
/// the map's own maximum. `base` must match the map size.
pub fn overlay(base: &RgbImage, map: &FloatMap, alpha: f32) -> RgbImage {
    let heat = colorize(&map.to_u8_max_normalized(), map.width() as u32, map.height() as u32);
    let mut out = base.clone();
    for (dst, src) in out.pixels_mut().zip(heat.pixels()) {
        for c in 0..3 {
            let v = alpha * dst[c] as f32 + (1.0 - alpha) * src[c] as f32;
            dst[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Outer borders of the regions whose value is strictly above the
/// `percentile`-th percentile of the map. A flat map has no such region.
pub fn anomaly_contours(map: &FloatMap, percentile: f32) -> Vec<Contour<i32>> {
    if map.max() - map.min() <= 0.0 {
        return Vec::new();
    }
    let cut = map.percentile(percentile);
    // One pixel of background all around, so regions touching the map edge
    // are still traced as outer borders.
    let (width, height) = (map.width() as u32, map.height() as u32);
    let mask = image::GrayImage::from_fn(width + 2, height + 2, |x, y| {
        let inside = x >= 1 && y >= 1 && x <= width && y <= height;
        if inside && map.get(x as usize - 1, y as usize - 1) > cut {
            image::Luma([255])
        } else {
            image::Luma([0])
        }
    });
    find_contours::<i32>(&mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|mut c| {
            for p in c.points.iter_mut() {
                p.x -= 1;
                p.y -= 1;
            }
            c
        })
        .collect()
}

/// Draws the anomaly contours in red over `base`. `base` must match the map size.
pub fn contour_image(base: &RgbImage, map: &FloatMap, percentile: f32, thickness: u32) -> RgbImage {
    let mut out = base.clone();
    for contour in anomaly_contours(map, percentile) {
        draw_closed_polyline(&mut out, &contour.points, thickness.max(1));
    }
    out
}

fn draw_closed_polyline(image: &mut RgbImage, points: &[imageproc::point::Point<i32>], thickness: u32) {
    if points.is_empty() {
        return;
    }
    let closing = std::iter::once((points[points.len() - 1], points[0]));
    let segments = points.windows(2).map(|w| (w[0], w[1])).chain(closing);
    // Centered on the contour: offsets -t/2 ..< t - t/2.
    let low = -(thickness as i32 / 2);
    let high = low + thickness as i32;
    for (a, b) in segments {
        for dy in low..high {
            for dx in low..high {
                draw_line_segment_mut(
                    image,
                    ((a.x + dx) as f32, (a.y + dy) as f32),
                    ((b.x + dx) as f32, (b.y + dy) as f32),
                    CONTOUR_COLOR,
                );
            }
        }
    }
}

/// PNG bytes of `image`. An image whose brightest channel is at most 1 is
/// treated as normalized and stretched to 8 bits first.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let stretched;
    let image = if image.iter().all(|&v| v <= 1) {
        stretched = RgbImage::from_fn(image.width(), image.height(), |x, y| {
            let p = image.get_pixel(x, y);
            Rgb([p[0] * 255, p[1] * 255, p[2] * 255])
        });
        &stretched
    } else {
        image
    };
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

pub fn to_data_uri(image: &RgbImage) -> Result<String> {
    Ok(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(encode_png(image)?)
    ))
}

/// The four images returned for every analysis, all at the anomaly map size.
#[derive(Debug, Clone)]
pub struct Renderings {
    pub original: RgbImage,
    pub heatmap: RgbImage,
    pub overlay: RgbImage,
    pub contour: RgbImage,
}

impl Renderings {
    pub fn save_all(&self, dir: &std::path::Path, stem: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for (suffix, image) in [
            ("original", &self.original),
            ("heatmap", &self.heatmap),
            ("overlay", &self.overlay),
            ("contour", &self.contour),
        ] {
            let path = dir.join(format!("{}_{}.png", stem, suffix));
            std::fs::write(path, encode_png(image)?)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Renderer {
    overlay_alpha: f32,
    contour_percentile: f32,
    contour_thickness: u32,
}

impl Renderer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            overlay_alpha: config.overlay_alpha.clamp(0.0, 1.0),
            contour_percentile: config.contour_percentile.clamp(0.0, 100.0),
            contour_thickness: config.contour_thickness,
        }
    }

    pub fn render(&self, original: &RgbImage, result: &AnomalyResult) -> Renderings {
        let map = &result.anomaly_map;
        let base = image::imageops::resize(
            original,
            map.width() as u32,
            map.height() as u32,
            FilterType::Triangle,
        );
        Renderings {
            heatmap: heatmap(map),
            overlay: overlay(&base, map, self.overlay_alpha),
            contour: contour_image(&base, map, self.contour_percentile, self.contour_thickness),
            original: base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with_hot_square() -> FloatMap {
        let mut data = vec![0.1f32; 64 * 64];
        for y in 20..30 {
            for x in 20..30 {
                data[y * 64 + x] = 0.8;
            }
        }
        FloatMap::new(64, 64, data).unwrap()
    }

    #[test]
    fn jet_runs_blue_to_red() {
        let low = jet(0);
        let high = jet(255);
        assert!(low[2] > 100 && low[0] == 0 && low[1] == 0, "{:?}", low);
        assert!(high[0] > 100 && high[1] == 0 && high[2] == 0, "{:?}", high);
        let mid = jet(128);
        assert!(mid[1] > 200, "{:?}", mid);
    }

    #[test]
    fn overlay_blends_sixty_forty() {
        let base = RgbImage::from_pixel(2, 1, Rgb([100, 100, 100]));
        let map = FloatMap::new(2, 1, vec![0.0, 0.0]).unwrap();
        let out = overlay(&base, &map, 0.6);
        let heat = jet(0);
        for c in 0..3 {
            let want = (0.6 * 100.0 + 0.4 * heat[c] as f32).round() as u8;
            assert_eq!(out.get_pixel(0, 0)[c], want);
        }
    }

    #[test]
    fn flat_map_has_no_contours() {
        let map = FloatMap::new(16, 16, vec![0.4; 256]).unwrap();
        assert!(anomaly_contours(&map, 85.0).is_empty());

        let base = RgbImage::from_pixel(16, 16, Rgb([7, 7, 7]));
        assert_eq!(contour_image(&base, &map, 85.0, 2), base);
    }

    #[test]
    fn hot_region_gets_one_red_outline() {
        let map = map_with_hot_square();
        let contours = anomaly_contours(&map, 85.0);
        assert_eq!(contours.len(), 1);

        let base = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
        let out = contour_image(&base, &map, 85.0, 2);
        assert_eq!(*out.get_pixel(20, 20), CONTOUR_COLOR);
        assert_eq!(*out.get_pixel(5, 5), Rgb([0, 0, 0]));
        assert_eq!(*out.get_pixel(25, 25), Rgb([0, 0, 0]));
    }

    fn map_with_block(x0: usize, y0: usize, size: usize) -> FloatMap {
        let mut data = vec![0.1f32; 64 * 64];
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                data[y * 64 + x] = 0.8;
            }
        }
        FloatMap::new(64, 64, data).unwrap()
    }

    #[test]
    fn regions_on_the_map_border_are_outlined() {
        for (name, x0, y0) in [
            ("interior", 29, 29),
            ("left", 0, 29),
            ("top-left", 0, 0),
            ("top", 29, 0),
            ("right", 58, 29),
            ("bottom", 29, 58),
            ("bottom-right", 58, 58),
        ] {
            let map = map_with_block(x0, y0, 6);
            let contours = anomaly_contours(&map, 85.0);
            assert_eq!(contours.len(), 1, "{} block: {} contours", name, contours.len());

            // Points are in map coordinates and lie on the block.
            for p in &contours[0].points {
                let (x, y) = (p.x as usize, p.y as usize);
                assert!(
                    (x0..x0 + 6).contains(&x) && (y0..y0 + 6).contains(&y),
                    "{} block: point {:?} off the block",
                    name,
                    p
                );
            }

            let base = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
            let out = contour_image(&base, &map, 85.0, 2);
            assert_eq!(*out.get_pixel(x0 as u32, y0 as u32), CONTOUR_COLOR, "{} block", name);
        }
    }

    #[test]
    fn thick_outline_is_centered_on_the_contour() {
        let map = map_with_hot_square();
        let base = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
        let out = contour_image(&base, &map, 85.0, 2);

        // The square spans 20..30; a 2-px line covers one pixel each side of
        // the border row/column, not two pixels inward.
        assert_eq!(*out.get_pixel(19, 19), CONTOUR_COLOR);
        assert_eq!(*out.get_pixel(20, 20), CONTOUR_COLOR);
        assert_eq!(*out.get_pixel(21, 21), Rgb([0, 0, 0]));
        assert_eq!(*out.get_pixel(29, 29), CONTOUR_COLOR);
        assert_eq!(*out.get_pixel(30, 30), Rgb([0, 0, 0]));
    }

    #[test]
    fn renderings_are_map_sized_whatever_the_input_shape() {
        let map = map_with_hot_square().resize_bilinear(256, 256);
        let result = AnomalyResult {
            anomaly_score: 0.8,
            patch_map: map_with_hot_square(),
            anomaly_map: map,
            is_anomaly: true,
            confidence: 1.0,
            threshold: 0.4,
        };
        let original = RgbImage::from_pixel(300, 90, Rgb([40, 80, 120]));
        let renderings = Renderer::new(&RenderConfig::default()).render(&original, &result);

        for rendered in [
            &renderings.original,
            &renderings.heatmap,
            &renderings.overlay,
            &renderings.contour,
        ] {
            assert_eq!(rendered.dimensions(), (256, 256));
        }
    }

    #[test]
    fn data_uri_is_png() {
        let image = RgbImage::from_pixel(4, 4, Rgb([10, 200, 30]));
        let uri = to_data_uri(&image).unwrap();
        assert!(uri.starts_with("data:image/png;base64,"));

        let payload = STANDARD.decode(&uri["data:image/png;base64,".len()..]).unwrap();
        let decoded = image::load_from_memory(&payload).unwrap().to_rgb8();
        assert_eq!(decoded, image);
    }

    #[test]
    fn normalized_images_are_stretched_before_encoding() {
        let image = RgbImage::from_pixel(2, 2, Rgb([1, 0, 1]));
        let decoded = image::load_from_memory(&encode_png(&image).unwrap())
            .unwrap()
            .to_rgb8();
        assert_eq!(*decoded.get_pixel(0, 0), Rgb([255, 0, 255]));
    }
}
