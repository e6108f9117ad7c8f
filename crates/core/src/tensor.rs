//! Pixel buffer ⇄ tensor conversion around the generator.
//!
//! Input side mirrors `ToTensor` + `Normalize(0.5, 0.5)`: bytes are scaled to
//! `[0, 1]` and then mapped to `[-1, 1]`. Output side rescales the whole tensor
//! by its own min/max, so the darkest output value becomes black and the
//! brightest becomes white regardless of the generator's actual range.

use image::{Rgb, RgbImage};
use ndarray::{Array3, ArrayView3};

use crate::codec::resize_square;
use crate::error::{Error, Result};

pub const NORMALIZE_MEAN: f32 = 0.5;
pub const NORMALIZE_STD: f32 = 0.5;

/// Smallest value range the min-max rescale divides by.
pub const MIN_RANGE_EPSILON: f32 = 1e-5;

/// `[3, H, W]` tensor in `[-1, 1]`, resized to `resolution × resolution` first.
pub fn to_input_tensor(image: &RgbImage, resolution: u32) -> Array3<f32> {
    let resized = resize_square(image, resolution);
    let (w, h) = resized.dimensions();

    let mut tensor = Array3::<f32>::zeros((3, h as usize, w as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let unit = pixel[c] as f32 / 255.0;
            tensor[[c, y as usize, x as usize]] = (unit - NORMALIZE_MEAN) / NORMALIZE_STD;
        }
    }
    tensor
}

/// Global (not per-channel) min and max, ignoring NaN.
fn value_range(tensor: &ArrayView3<'_, f32>) -> (f32, f32) {
    tensor
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Min-max rescale a `[3, H, W]` generator output into an 8-bit RGB image.
///
/// A constant tensor divides by [`MIN_RANGE_EPSILON`] instead of zero and comes
/// out black. So does a tensor with no non-NaN values at all. Individual NaN
/// elements map to 0.
pub fn to_pixel_buffer(tensor: ArrayView3<'_, f32>) -> Result<RgbImage> {
    let (channels, h, w) = tensor.dim();
    if channels != 3 {
        return Err(Error::Shape(format!(
            "expected 3 output channels, got shape {:?}",
            tensor.shape()
        )));
    }
    if h == 0 || w == 0 {
        return Err(Error::Shape(format!(
            "output tensor has an empty spatial extent: {:?}",
            tensor.shape()
        )));
    }

    let (low, high) = value_range(&tensor);
    if low > high {
        return Ok(RgbImage::new(w as u32, h as u32));
    }
    let range = (high - low).max(MIN_RANGE_EPSILON);

    let mut image = RgbImage::new(w as u32, h as u32);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let mut rgb = [0u8; 3];
        for (c, out) in rgb.iter_mut().enumerate() {
            let v = tensor[[c, y as usize, x as usize]].clamp(low, high);
            let unit = (v - low) / range;
            // Truncating cast, same as `mul(255).byte()`.
            *out = (unit * 255.0) as u8;
        }
        *pixel = Rgb(rgb);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn gradient_image(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn input_tensor_is_deterministic() {
        let img = gradient_image(200, 90);
        let a = to_input_tensor(&img, 128);
        let b = to_input_tensor(&img, 128);

        let bits_a: Vec<u32> = a.iter().map(|v| v.to_bits()).collect();
        let bits_b: Vec<u32> = b.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits_a, bits_b);
    }

    #[test]
    fn input_tensor_has_target_resolution() {
        for (w, h) in [(128, 128), (640, 360), (33, 500)] {
            let tensor = to_input_tensor(&gradient_image(w, h), 128);
            assert_eq!(tensor.shape(), &[3, 128, 128], "from {w}x{h}");
        }
    }

    #[test]
    fn input_tensor_maps_bytes_to_unit_interval() {
        let mut img = RgbImage::from_pixel(128, 128, Rgb([0, 255, 10]));
        img.put_pixel(3, 4, Rgb([255, 0, 0]));

        let tensor = to_input_tensor(&img, 128);
        assert_eq!(tensor[[0, 0, 0]], -1.0);
        assert_eq!(tensor[[1, 0, 0]], 1.0);
        let expected = (10.0 / 255.0 - 0.5) / 0.5;
        assert!((tensor[[2, 0, 0]] - expected).abs() < 1e-6);
        // row-major: [c, y, x]
        assert_eq!(tensor[[0, 4, 3]], 1.0);
        assert_eq!(tensor[[1, 4, 3]], -1.0);
    }

    #[test]
    fn constant_tensor_renders_black() {
        for c in [-1.0f32, 0.0, 0.37, 1.0, 1234.5] {
            let tensor = Array3::<f32>::from_elem((3, 8, 8), c);
            let image = to_pixel_buffer(tensor.view()).unwrap();
            assert!(
                image.pixels().all(|p| p.0 == [0, 0, 0]),
                "constant {c} should render black"
            );
        }
    }

    #[test]
    fn all_nan_tensor_renders_black() {
        let tensor = Array3::<f32>::from_elem((3, 4, 4), f32::NAN);
        let image = to_pixel_buffer(tensor.view()).unwrap();
        assert_eq!(image.dimensions(), (4, 4));
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn isolated_nan_maps_to_zero_without_disturbing_range() {
        let mut tensor = Array3::<f32>::zeros((3, 1, 3));
        for c in 0..3 {
            tensor[[c, 0, 0]] = -1.0;
            tensor[[c, 0, 1]] = f32::NAN;
            tensor[[c, 0, 2]] = 1.0;
        }

        let image = to_pixel_buffer(tensor.view()).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(2, 0).0, [255, 255, 255]);
    }

    #[test]
    fn ramp_spans_full_display_range() {
        let w = 256usize;
        let tensor = Array3::from_shape_fn((3, 1, w), |(_, _, x)| {
            -1.0 + 2.0 * x as f32 / (w - 1) as f32
        });
        let image = to_pixel_buffer(tensor.view()).unwrap();

        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(image.get_pixel((w - 1) as u32, 0).0, [255, 255, 255]);

        let reds: Vec<u8> = (0..w as u32).map(|x| image.get_pixel(x, 0)[0]).collect();
        assert!(reds.windows(2).all(|pair| pair[0] <= pair[1]), "not monotonic");

        // v ↦ (v + 1) / 2 · 255, truncated
        let mid = image.get_pixel(128, 0)[0];
        let v: f32 = -1.0 + 2.0 * 128.0 / 255.0;
        assert_eq!(mid, (((v + 1.0) / 2.0) * 255.0) as u8);
    }

    #[test]
    fn rescale_uses_global_not_per_channel_range() {
        let mut tensor = Array3::<f32>::zeros((3, 1, 2));
        tensor[[0, 0, 0]] = 0.0;
        tensor[[0, 0, 1]] = 1.0;
        tensor[[1, 0, 0]] = 0.5;
        tensor[[1, 0, 1]] = 0.5;
        tensor[[2, 0, 0]] = 0.0;
        tensor[[2, 0, 1]] = 0.0;

        let image = to_pixel_buffer(tensor.view()).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [0, 127, 0]);
        assert_eq!(image.get_pixel(1, 0).0, [255, 127, 0]);
    }

    #[test]
    fn output_width_and_height_follow_tensor_layout() {
        let tensor = Array3::<f32>::zeros((3, 5, 9));
        let image = to_pixel_buffer(tensor.view()).unwrap();
        assert_eq!(image.dimensions(), (9, 5));
    }

    #[test]
    fn wrong_channel_count_is_a_shape_error() {
        let tensor = Array3::<f32>::zeros((1, 4, 4));
        assert!(matches!(
            to_pixel_buffer(tensor.view()),
            Err(Error::Shape(_))
        ));
    }
}
