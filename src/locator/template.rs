use image::imageops::{self, FilterType};
use image::GrayImage;
use std::ops::RangeInclusive;
use std::path::Path;

/// Location of a template inside a screenshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateMatch {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub score: f32,
}

impl TemplateMatch {
    pub fn center(&self) -> (i32, i32) {
        (
            (self.x + self.width / 2) as i32,
            (self.y + self.height / 2) as i32,
        )
    }
}

pub fn load_template(path: &Path) -> image::ImageResult<GrayImage> {
    Ok(image::open(path)?.to_luma8())
}

/// Finds the best normalized cross-correlation match of `needle` in
/// `haystack`, searching a downscaled copy first and refining around the
/// coarse hit at full resolution.
pub fn find_template(
    haystack: &GrayImage,
    needle: &GrayImage,
    threshold: f32,
) -> Option<TemplateMatch> {
    let (hw, hh) = haystack.dimensions();
    let (nw, nh) = needle.dimensions();
    if nw == 0 || nh == 0 || nw > hw || nh > hh {
        return None;
    }

    let factor = coarse_factor(nw, nh);
    let (x_range, y_range) = if factor > 1 {
        let small_hay = imageops::resize(haystack, hw / factor, hh / factor, FilterType::Triangle);
        let small_needle =
            imageops::resize(needle, nw / factor, nh / factor, FilterType::Triangle);
        let (sw, sh) = small_needle.dimensions();
        let (coarse_x, coarse_y, _) = best_match(
            &small_hay,
            &small_needle,
            0..=small_hay.width() - sw,
            0..=small_hay.height() - sh,
        )?;

        let cx = coarse_x * factor;
        let cy = coarse_y * factor;
        (
            cx.saturating_sub(factor)..=(cx + factor).min(hw - nw),
            cy.saturating_sub(factor)..=(cy + factor).min(hh - nh),
        )
    } else {
        (0..=hw - nw, 0..=hh - nh)
    };

    let (x, y, score) = best_match(haystack, needle, x_range, y_range)?;
    if score < threshold {
        return None;
    }

    Some(TemplateMatch {
        x,
        y,
        width: nw,
        height: nh,
        score,
    })
}

fn coarse_factor(width: u32, height: u32) -> u32 {
    let smallest = width.min(height);
    if smallest >= 32 {
        4
    } else if smallest >= 12 {
        2
    } else {
        1
    }
}

/// Summed-area tables of pixel values and squared pixel values.
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sq = vec![0.0; stride * (h + 1)];

        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = img.get_pixel(x as u32, y as u32).0[0] as f64;
                row_sum += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row_sum;
                sq[idx] = sq[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sq }
    }

    fn window(&self, table: &[f64], x: usize, y: usize, w: usize, h: usize) -> f64 {
        let s = self.stride;
        table[(y + h) * s + (x + w)] - table[y * s + (x + w)] - table[(y + h) * s + x]
            + table[y * s + x]
    }
}

fn best_match(
    haystack: &GrayImage,
    needle: &GrayImage,
    xs: RangeInclusive<u32>,
    ys: RangeInclusive<u32>,
) -> Option<(u32, u32, f32)> {
    let (nw, nh) = needle.dimensions();
    let n = (nw * nh) as f64;

    let needle_px: Vec<f64> = needle.pixels().map(|p| p.0[0] as f64).collect();
    let sum_t: f64 = needle_px.iter().sum();
    let mean_t = sum_t / n;
    let var_t: f64 = needle_px.iter().map(|v| (v - mean_t) * (v - mean_t)).sum();

    let integral = Integral::new(haystack);
    let mut best: Option<(u32, u32, f32)> = None;

    for y in ys {
        for x in xs.clone() {
            let (px, py) = (x as usize, y as usize);
            let sum_i = integral.window(&integral.sum, px, py, nw as usize, nh as usize);
            let sq_i = integral.window(&integral.sq, px, py, nw as usize, nh as usize);
            let var_i = (sq_i - sum_i * sum_i / n).max(0.0);

            let score: f64 = if var_t <= f64::EPSILON || var_i <= f64::EPSILON {
                // Flat patches: compare brightness instead of shape.
                let mean_i = sum_i / n;
                if var_t <= f64::EPSILON && var_i <= f64::EPSILON {
                    1.0 - ((mean_i - mean_t).abs() / 255.0)
                } else {
                    0.0
                }
            } else {
                let mut cross = 0.0;
                for ty in 0..nh {
                    let row = (ty * nw) as usize;
                    for tx in 0..nw {
                        let iv = haystack.get_pixel(x + tx, y + ty).0[0] as f64;
                        cross += iv * needle_px[row + tx as usize];
                    }
                }
                (cross - mean_t * sum_i) / (var_i * var_t).sqrt()
            };
            let score = score as f32;

            if best.map_or(true, |(_, _, s)| score > s) {
                best = Some((x, y, score));
            }
        }
    }

    best
}
