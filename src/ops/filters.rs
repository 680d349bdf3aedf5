// ============================================================================
// MASK FILTERS: Gaussian blur and cropping
// ============================================================================

use image::{GrayImage, imageops};
use rayon::prelude::*;

/// Build a 1-D Gaussian kernel truncated at ceil(3*sigma).
pub fn build_gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = kernel_radius(sigma);
    if radius == 0 {
        return vec![1.0];
    }
    let len = radius * 2 + 1;
    let mut kernel = vec![0.0f32; len];
    let s2 = 2.0 * sigma * sigma;
    let mut sum = 0.0f32;
    for (i, slot) in kernel.iter_mut().enumerate() {
        let x = i as f32 - radius as f32;
        let v = (-x * x / s2).exp();
        *slot = v;
        sum += v;
    }
    let inv = 1.0 / sum;
    for v in &mut kernel {
        *v *= inv;
    }
    kernel
}

/// Half-width of the kernel `build_gaussian_kernel` produces.
pub fn kernel_radius(sigma: f32) -> usize {
    if sigma.is_finite() && sigma > 0.0 {
        (sigma * 3.0).ceil() as usize
    } else {
        0
    }
}

/// Rayon-parallel separable Gaussian blur of a single-channel mask.
/// Samples past the border are clamped to the edge pixel, so callers that
/// need a soft edge at the border must pad the canvas first.
pub fn gaussian_blur_gray(src: &GrayImage, sigma: f32) -> GrayImage {
    let w = src.width() as usize;
    let h = src.height() as usize;
    if w == 0 || h == 0 || kernel_radius(sigma) == 0 {
        return src.clone();
    }

    let kernel = build_gaussian_kernel(sigma);
    let radius = kernel.len() / 2;
    let buf_in: Vec<f32> = src.as_raw().iter().map(|&b| b as f32).collect();

    // --- Horizontal pass (parallel by row) ---
    let mut buf_h = vec![0.0f32; w * h];
    buf_h.par_chunks_mut(w).enumerate().for_each(|(y, row_out)| {
        let row_in = &buf_in[y * w..(y + 1) * w];
        for (x, out) in row_out.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = (x as isize + ki as isize - radius as isize).clamp(0, w as isize - 1) as usize;
                acc += row_in[sx] * kv;
            }
            *out = acc;
        }
    });

    // --- Vertical pass (parallel by row) ---
    let mut buf_v = vec![0u8; w * h];
    buf_v.par_chunks_mut(w).enumerate().for_each(|(y, row_out)| {
        for (x, out) in row_out.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y as isize + ki as isize - radius as isize).clamp(0, h as isize - 1) as usize;
                acc += buf_h[sy * w + x] * kv;
            }
            *out = acc.round().clamp(0.0, 255.0) as u8;
        }
    });

    GrayImage::from_raw(w as u32, h as u32, buf_v).unwrap_or_else(|| src.clone())
}

/// Cut the `w`x`h` window starting at `(x, y)` out of a mask.
pub fn crop_gray(src: &GrayImage, x: u32, y: u32, w: u32, h: u32) -> GrayImage {
    imageops::crop_imm(src, x, y, w, h).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn kernel_is_normalised_and_symmetric() {
        let k = build_gaussian_kernel(2.0);
        assert_eq!(k.len(), 13);
        let sum: f32 = k.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert!((k[0] - k[12]).abs() < 1e-6);
    }

    #[test]
    fn zero_sigma_is_identity() {
        let mut img = GrayImage::new(4, 4);
        img.put_pixel(1, 2, Luma([200]));
        assert_eq!(gaussian_blur_gray(&img, 0.0), img);
    }

    #[test]
    fn blur_keeps_uniform_mask_uniform() {
        let img = GrayImage::from_pixel(9, 7, Luma([255]));
        let out = gaussian_blur_gray(&img, 3.0);
        assert!(out.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn blur_spreads_a_hard_edge() {
        let mut img = GrayImage::new(20, 1);
        for x in 10..20 {
            img.put_pixel(x, 0, Luma([255]));
        }
        let out = gaussian_blur_gray(&img, 2.0);
        let left = out.get_pixel(9, 0).0[0];
        let right = out.get_pixel(10, 0).0[0];
        assert!(left > 0 && left < 255);
        assert!(right > left && right < 255);
    }

    #[test]
    fn crop_takes_the_requested_window() {
        let mut img = GrayImage::new(11, 10);
        img.put_pixel(6, 5, Luma([77]));
        let cropped = crop_gray(&img, 4, 4, 3, 2);
        assert_eq!(cropped.dimensions(), (3, 2));
        assert_eq!(cropped.get_pixel(2, 1).0[0], 77);
        assert_eq!(cropped.get_pixel(0, 0).0[0], 0);
    }
}
