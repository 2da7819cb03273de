use image::{imageops, GrayImage, ImageBuffer, Luma, RgbaImage};
use thiserror::Error;
use tracing::debug;

/// Optional post-processing applied to the alpha channel of a cutout.
///
/// Values arrive straight from the command line, so they are kept signed and
/// normalised by the accessors: a threshold is clamped into `0..=255`, a
/// feather or erode value of zero or less disables that stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlphaRefinement {
    pub threshold: Option<i64>,
    pub feather: i64,
    pub erode: i64,
}

impl AlphaRefinement {
    pub fn is_active(&self) -> bool {
        self.threshold.is_some() || self.feather > 0 || self.erode > 0
    }

    pub fn threshold_level(&self) -> Option<u8> {
        self.threshold.map(|value| value.clamp(0, 255) as u8)
    }

    /// Standard deviation of the Gaussian used for feathering, in pixels.
    pub fn feather_sigma(&self) -> Option<f32> {
        (self.feather > 0).then_some(self.feather as f32)
    }

    pub fn erode_radius(&self) -> Option<u32> {
        (self.erode > 0).then(|| u32::try_from(self.erode).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Error)]
pub enum AlphaError {
    #[error("mask is {mask_width}x{mask_height} but image is {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        mask_width: u32,
        mask_height: u32,
    },
}

fn check_dimensions(image: (u32, u32), mask: (u32, u32)) -> Result<(), AlphaError> {
    if image != mask {
        return Err(AlphaError::DimensionMismatch {
            width: image.0,
            height: image.1,
            mask_width: mask.0,
            mask_height: mask.1,
        });
    }
    Ok(())
}

pub fn extract_alpha(image: &RgbaImage) -> GrayImage {
    let (width, height) = image.dimensions();
    ImageBuffer::from_fn(width, height, |x, y| Luma([image.get_pixel(x, y)[3]]))
}

pub fn replace_alpha(image: &mut RgbaImage, alpha: &GrayImage) -> Result<(), AlphaError> {
    check_dimensions(image.dimensions(), alpha.dimensions())?;
    for (px, a) in image.pixels_mut().zip(alpha.pixels()) {
        px[3] = a[0];
    }
    Ok(())
}

/// Hard-edges the mask in place: values at or above `level` become opaque,
/// everything else transparent.
pub fn binarize(alpha: &mut GrayImage, level: u8) {
    let mut lut = [0u8; 256];
    for (value, slot) in lut.iter_mut().enumerate() {
        if value >= level as usize {
            *slot = 255;
        }
    }
    for px in alpha.pixels_mut() {
        px[0] = lut[px[0] as usize];
    }
}

pub fn feather(alpha: &GrayImage, sigma: f32) -> GrayImage {
    imageops::blur(alpha, sigma)
}

/// Grayscale erosion with a `(2 * radius + 1)` square kernel.
///
/// Samples outside the image are ignored, which matches replicating the
/// edge pixels. Runs as a horizontal then a vertical min pass.
pub fn erode(alpha: &GrayImage, radius: u32) -> GrayImage {
    let (width, height) = alpha.dimensions();
    if radius == 0 || width == 0 || height == 0 {
        return alpha.clone();
    }
    let r = radius as usize;
    let w = width as usize;
    let h = height as usize;
    let src = alpha.as_raw();

    let mut rows = vec![0u8; w * h];
    for y in 0..h {
        let row = &src[y * w..(y + 1) * w];
        for x in 0..w {
            let lo = x.saturating_sub(r);
            let hi = x.saturating_add(r).min(w - 1);
            rows[y * w + x] = row[lo..=hi].iter().copied().min().unwrap_or(0);
        }
    }

    ImageBuffer::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let lo = y.saturating_sub(r);
        let hi = y.saturating_add(r).min(h - 1);
        let min = (lo..=hi).map(|yy| rows[yy * w + x]).min().unwrap_or(0);
        Luma([min])
    })
}

/// Runs threshold, feather and erode (in that order) over the alpha channel
/// of `image`. Returns whether any stage was active.
pub fn refine_alpha(image: &mut RgbaImage, refinement: &AlphaRefinement) -> Result<bool, AlphaError> {
    if !refinement.is_active() {
        return Ok(false);
    }
    let mut alpha = extract_alpha(image);
    if let Some(level) = refinement.threshold_level() {
        debug!(level, "binarizing alpha");
        binarize(&mut alpha, level);
    }
    if let Some(sigma) = refinement.feather_sigma() {
        debug!(sigma, "feathering alpha");
        alpha = feather(&alpha, sigma);
    }
    if let Some(radius) = refinement.erode_radius() {
        debug!(radius, "eroding alpha");
        alpha = erode(&alpha, radius);
    }
    replace_alpha(image, &alpha)?;
    Ok(true)
}

/// Composites `image` over a fully transparent canvas through `mask`.
///
/// Every channel, alpha included, is scaled by `mask / 255`, so background
/// colour does not bleed through soft mask edges.
pub fn naive_cutout(image: &RgbaImage, mask: &GrayImage) -> Result<RgbaImage, AlphaError> {
    check_dimensions(image.dimensions(), mask.dimensions())?;
    let mut out = image.clone();
    for (px, m) in out.pixels_mut().zip(mask.pixels()) {
        let m = m[0] as u32;
        for channel in px.0.iter_mut() {
            *channel = ((*channel as u32 * m + 127) / 255) as u8;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn square_mask(size: u32, lo: u32, hi: u32) -> GrayImage {
        ImageBuffer::from_fn(size, size, |x, y| {
            if (lo..hi).contains(&x) && (lo..hi).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    fn gradient_rgba() -> RgbaImage {
        ImageBuffer::from_fn(16, 16, |x, y| Rgba([x as u8 * 10, y as u8 * 10, 40, (x * 16 + y) as u8]))
    }

    fn count(mask: &GrayImage, pred: impl Fn(u8) -> bool) -> usize {
        mask.pixels().filter(|p| pred(p[0])).count()
    }

    #[test]
    fn refinement_accessors_normalise_cli_values() {
        let r = AlphaRefinement {
            threshold: Some(-10),
            feather: -2,
            erode: 0,
        };
        assert!(r.is_active());
        assert_eq!(r.threshold_level(), Some(0));
        assert_eq!(r.feather_sigma(), None);
        assert_eq!(r.erode_radius(), None);

        let r = AlphaRefinement {
            threshold: Some(300),
            feather: 3,
            erode: 2,
        };
        assert_eq!(r.threshold_level(), Some(255));
        assert_eq!(r.feather_sigma(), Some(3.0));
        assert_eq!(r.erode_radius(), Some(2));

        assert!(!AlphaRefinement::default().is_active());
        assert!(!AlphaRefinement {
            threshold: None,
            feather: -1,
            erode: -1,
        }
        .is_active());
    }

    #[test]
    fn inactive_refinement_leaves_alpha_untouched() {
        let mut image = gradient_rgba();
        let before = image.clone();
        let applied = refine_alpha(&mut image, &AlphaRefinement::default()).expect("refine");
        assert!(!applied);
        assert_eq!(image.as_raw(), before.as_raw());
    }

    #[test]
    fn binarize_produces_only_extremes() {
        let mut alpha = extract_alpha(&gradient_rgba());
        binarize(&mut alpha, 128);
        assert!(alpha.pixels().all(|p| p[0] == 0 || p[0] == 255));
        let mut alpha = GrayImage::from_raw(4, 1, vec![0, 127, 128, 255]).expect("raw buffer");
        binarize(&mut alpha, 128);
        assert_eq!(alpha.as_raw(), &vec![0, 0, 255, 255]);
    }

    #[test]
    fn out_of_range_thresholds_clamp() {
        let source = gradient_rgba();
        let run = |threshold| {
            let mut image = source.clone();
            refine_alpha(
                &mut image,
                &AlphaRefinement {
                    threshold: Some(threshold),
                    ..Default::default()
                },
            )
            .expect("refine");
            extract_alpha(&image)
        };
        assert_eq!(run(-10).as_raw(), run(0).as_raw());
        assert_eq!(run(300).as_raw(), run(255).as_raw());
        assert!(run(0).pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn wider_feather_widens_the_soft_border() {
        let mask = square_mask(64, 16, 48);
        let soft = |m: &GrayImage| count(m, |v| v > 0 && v < 255);
        assert_eq!(soft(&mask), 0);
        let narrow = soft(&feather(&mask, 1.0));
        let wide = soft(&feather(&mask, 3.0));
        assert!(narrow > 0);
        assert!(wide > narrow, "sigma 3 band ({wide}) should exceed sigma 1 band ({narrow})");
    }

    #[test]
    fn erode_shrinks_opaque_square_by_radius() {
        let mask = square_mask(40, 10, 30);
        assert_eq!(count(&mask, |v| v == 255), 400);
        let one = erode(&mask, 1);
        let two = erode(&mask, 2);
        assert_eq!(count(&one, |v| v == 255), 18 * 18);
        assert_eq!(count(&two, |v| v == 255), 16 * 16);
        assert_eq!(one.get_pixel(10, 10)[0], 0);
        assert_eq!(one.get_pixel(11, 11)[0], 255);
    }

    #[test]
    fn erode_treats_borders_as_replicated() {
        let opaque = GrayImage::from_pixel(8, 8, Luma([255]));
        assert!(erode(&opaque, 3).pixels().all(|p| p[0] == 255));

        let mut single = GrayImage::from_pixel(9, 9, Luma([200]));
        single.put_pixel(4, 4, Luma([10]));
        let eroded = erode(&single, 1);
        assert_eq!(eroded.get_pixel(3, 5)[0], 10);
        assert_eq!(eroded.get_pixel(2, 4)[0], 200);
        assert_eq!(eroded.get_pixel(0, 0)[0], 200);
    }

    #[test]
    fn erode_radius_larger_than_image_collapses_to_global_min() {
        let mask = square_mask(6, 1, 5);
        assert!(erode(&mask, 50).pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn naive_cutout_scales_channels_by_mask() {
        let image = RgbaImage::from_pixel(2, 1, Rgba([200, 100, 50, 255]));
        let mask = GrayImage::from_raw(2, 1, vec![255, 0]).expect("raw buffer");
        let out = naive_cutout(&image, &mask).expect("cutout");
        assert_eq!(out.get_pixel(0, 0).0, [200, 100, 50, 255]);
        assert_eq!(out.get_pixel(1, 0).0, [0, 0, 0, 0]);

        let half = GrayImage::from_raw(2, 1, vec![128, 128]).expect("raw buffer");
        let out = naive_cutout(&image, &half).expect("cutout");
        assert_eq!(out.get_pixel(0, 0)[3], 128);
        assert_eq!(out.get_pixel(0, 0)[0], 100);
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let mut image = RgbaImage::new(4, 4);
        let mask = GrayImage::new(3, 4);
        assert!(matches!(
            replace_alpha(&mut image, &mask),
            Err(AlphaError::DimensionMismatch { mask_width: 3, .. })
        ));
        assert!(naive_cutout(&image, &mask).is_err());
    }
}
