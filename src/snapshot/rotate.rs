//! Drawing frames onto a capture surface: resample, mirror, rotate.

use crate::errors::CameraError;
use crate::types::CameraFrame;
use image::{imageops, Rgb, RgbImage};

/// Surface size after rotation plus the normalised angle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationParams {
    pub width: u32,
    pub height: u32,
    /// Degrees in `0..360`.
    pub angle: i32,
}

/// Normalise `rotate` into `0..360` and swap the surface sides for angles in
/// `[45, 135)` or `[225, 315)`.
pub fn calc_rotation(width: u32, height: u32, rotate: i32) -> RotationParams {
    let mut angle = rotate % 360;
    if angle == 0 {
        return RotationParams {
            width,
            height,
            angle,
        };
    }
    if angle < 0 {
        angle += 360;
    }

    let octant = angle as f64 / 45.0;
    let swap = (1.0..3.0).contains(&octant) || (5.0..7.0).contains(&octant);
    if swap {
        RotationParams {
            width: height,
            height: width,
            angle,
        }
    } else {
        RotationParams {
            width,
            height,
            angle,
        }
    }
}

/// Fit `width`x`height` inside a `max_pixel` square, keeping the aspect.
/// Images already inside are returned unchanged.
pub fn fit_within(width: u32, height: u32, max_pixel: u32) -> (u32, u32) {
    if max_pixel == 0 || (width <= max_pixel && height <= max_pixel) || height == 0 {
        return (width, height);
    }
    let ratio = width as f64 / height as f64;
    if ratio >= 1.0 {
        (max_pixel, ((max_pixel as f64 / ratio) as u32).max(1))
    } else {
        (((max_pixel as f64 * ratio) as u32).max(1), max_pixel)
    }
}

/// A drawn still, ready for encoding.
#[derive(Debug, Clone)]
pub struct CaptureSurface {
    image: RgbImage,
}

impl CaptureSurface {
    /// Draw `frame` scaled to `width`x`height`, mirrored first when `flip_horiz`.
    pub fn draw(
        frame: &CameraFrame,
        width: u32,
        height: u32,
        flip_horiz: bool,
    ) -> Result<Self, CameraError> {
        if width == 0 || height == 0 {
            return Err(CameraError::CaptureFailed(format!(
                "capture surface {}x{} is empty",
                width, height
            )));
        }
        let source = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| {
                CameraError::CaptureFailed(format!(
                    "frame buffer does not match {}x{}",
                    frame.width, frame.height
                ))
            })?;

        let mut image = if source.dimensions() == (width, height) {
            source
        } else {
            imageops::resize(&source, width, height, imageops::FilterType::Triangle)
        };
        if flip_horiz {
            imageops::flip_horizontal_in_place(&mut image);
        }
        Ok(Self { image })
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    /// Rotate clockwise by `rotate` degrees onto a surface sized by
    /// [`calc_rotation`].
    pub fn rotated(self, rotate: i32) -> Self {
        let params = calc_rotation(self.width(), self.height(), rotate);
        let image = match params.angle {
            0 => self.image,
            90 => imageops::rotate90(&self.image),
            180 => imageops::rotate180(&self.image),
            270 => imageops::rotate270(&self.image),
            angle => rotate_about_center(&self.image, angle, params.width, params.height),
        };
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

/// Nearest-neighbour rotation around the centre; uncovered pixels stay black.
fn rotate_about_center(source: &RgbImage, angle: i32, width: u32, height: u32) -> RgbImage {
    let theta = (angle as f64).to_radians();
    let (sin, cos) = theta.sin_cos();
    let (sw, sh) = (source.width() as f64, source.height() as f64);
    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);

    let mut out = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let dx = x as f64 + 0.5 - cx;
        let dy = y as f64 + 0.5 - cy;
        let sx = dx * cos + dy * sin + sw / 2.0;
        let sy = -dx * sin + dy * cos + sh / 2.0;
        if sx >= 0.0 && sy >= 0.0 && sx < sw && sy < sh {
            *pixel = *source.get_pixel(sx as u32, sy as u32);
        }
    }
    out
}
