//! Image operations the worker needs: reading dimensions, painting privacy
//! objects out, and drawing bounding boxes.
//!
//! Images travel as base64 text, the same form they have on the wire. The
//! [`ImageOps`] trait is the seam; [`RasterImageOps`] is the implementation
//! backed by the `image` crate.

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use thiserror::Error;

use crate::frame::{BoundingBox, DetectedObject};

/// Errors that can occur while manipulating images
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Image is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Failed to decode or encode image: {0}")]
    Codec(#[from] image::ImageError),

    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),
}

const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: u32 = 2;

/// Image manipulation capability used by the worker
pub trait ImageOps: Send + Sync {
    /// Width and height in pixels
    fn dimensions(&self, image: &str) -> Result<(u32, u32), ImageError>;

    /// Copy of the image with every privacy object painted black
    fn blur(&self, image: &str, objects: &[DetectedObject]) -> Result<String, ImageError>;

    /// Copy of the image with an outline around each object
    fn draw_boxes(
        &self,
        image: &str,
        objects: &[DetectedObject],
        include_privacy: bool,
    ) -> Result<String, ImageError>;
}

/// Decode base64 image text, dropping a `data:image/...;base64,` prefix
pub fn decode_base64(image: &str) -> Result<Vec<u8>, ImageError> {
    let payload = match image.split_once(',') {
        Some((_, data)) => data,
        None => image,
    };
    Ok(STANDARD.decode(payload.trim())?)
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// [`ImageOps`] backed by the `image` crate
#[derive(Debug, Clone, Copy)]
pub struct RasterImageOps {
    format: ImageFormat,
}

impl RasterImageOps {
    pub fn new(format: ImageFormat) -> Self {
        Self { format }
    }

    /// Output format from a file extension (`jpg`, `jpeg`, `png`)
    pub fn for_extension(extension: &str) -> Result<Self, ImageError> {
        match extension.to_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(Self::new(ImageFormat::Jpeg)),
            "png" => Ok(Self::new(ImageFormat::Png)),
            other => Err(ImageError::UnsupportedFormat(other.to_string())),
        }
    }

    fn load(&self, image: &str) -> Result<RgbImage, ImageError> {
        let bytes = decode_base64(image)?;
        Ok(image::load_from_memory(&bytes)?.into_rgb8())
    }

    fn store(&self, image: RgbImage) -> Result<String, ImageError> {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image).write_to(&mut buffer, self.format)?;
        Ok(encode_base64(buffer.get_ref()))
    }
}

impl Default for RasterImageOps {
    fn default() -> Self {
        Self::new(ImageFormat::Jpeg)
    }
}

impl ImageOps for RasterImageOps {
    fn dimensions(&self, image: &str) -> Result<(u32, u32), ImageError> {
        let bytes = decode_base64(image)?;
        Ok(image::load_from_memory(&bytes)?.dimensions())
    }

    fn blur(&self, image: &str, objects: &[DetectedObject]) -> Result<String, ImageError> {
        let mut canvas = self.load(image)?;
        for object in objects.iter().filter(|o| o.privacy_sensitive) {
            if let Some(rect) = Rect::clamped(&object.bbox, canvas.width(), canvas.height()) {
                fill_rect(&mut canvas, rect, BLACK);
            }
        }
        self.store(canvas)
    }

    fn draw_boxes(
        &self,
        image: &str,
        objects: &[DetectedObject],
        include_privacy: bool,
    ) -> Result<String, ImageError> {
        let mut canvas = self.load(image)?;
        for object in objects
            .iter()
            .filter(|o| include_privacy || !o.privacy_sensitive)
        {
            if let Some(rect) = Rect::clamped(&object.bbox, canvas.width(), canvas.height()) {
                outline_rect(&mut canvas, rect, class_color(&object.kind));
            }
        }
        self.store(canvas)
    }
}

/// Inclusive pixel rectangle inside the image bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl Rect {
    /// `None` when the box lies entirely outside the image
    fn clamped(bbox: &BoundingBox, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let (ax, ay) = bbox.coordinate1;
        let (bx, by) = bbox.coordinate2;
        let (left, right) = (ax.min(bx), ax.max(bx));
        let (top, bottom) = (ay.min(by), ay.max(by));

        if right < 0 || bottom < 0 || left >= width as i32 || top >= height as i32 {
            return None;
        }

        let clamp = |v: i32, max: u32| v.clamp(0, max as i32 - 1) as u32;
        Some(Self {
            x0: clamp(left, width),
            y0: clamp(top, height),
            x1: clamp(right, width),
            y1: clamp(bottom, height),
        })
    }
}

fn fill_rect(canvas: &mut RgbImage, rect: Rect, color: Rgb<u8>) {
    for y in rect.y0..=rect.y1 {
        for x in rect.x0..=rect.x1 {
            canvas.put_pixel(x, y, color);
        }
    }
}

fn outline_rect(canvas: &mut RgbImage, rect: Rect, color: Rgb<u8>) {
    for y in rect.y0..=rect.y1 {
        for x in rect.x0..=rect.x1 {
            let on_edge = x - rect.x0 < BOX_THICKNESS
                || rect.x1 - x < BOX_THICKNESS
                || y - rect.y0 < BOX_THICKNESS
                || rect.y1 - y < BOX_THICKNESS;
            if on_edge {
                canvas.put_pixel(x, y, color);
            }
        }
    }
}

/// Stable, bright colour per class name
fn class_color(class: &str) -> Rgb<u8> {
    // FNV-1a
    let hash = class
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        });
    let channel = |shift: u32| 64 + ((hash >> shift) & 0xff) as u8 % 192;
    Rgb([channel(0), channel(8), channel(16)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(width: u32, height: u32) -> String {
        let canvas = RgbImage::from_pixel(width, height, Rgb([200, 200, 200]));
        // PNG keeps pixel values exact
        RasterImageOps::new(ImageFormat::Png).store(canvas).unwrap()
    }

    fn object(kind: &str, a: (i32, i32), b: (i32, i32)) -> DetectedObject {
        DetectedObject::new(
            kind,
            0.9,
            BoundingBox {
                coordinate1: a,
                coordinate2: b,
            },
        )
    }

    fn pixel(image: &str, x: u32, y: u32) -> Rgb<u8> {
        let bytes = decode_base64(image).unwrap();
        *image::load_from_memory(&bytes)
            .unwrap()
            .into_rgb8()
            .get_pixel(x, y)
    }

    #[test]
    fn test_decode_base64_strips_data_uri() {
        let encoded = encode_base64(b"hello");
        assert_eq!(decode_base64(&encoded).unwrap(), b"hello");
        assert_eq!(
            decode_base64(&format!("data:image/jpeg;base64,{}", encoded)).unwrap(),
            b"hello"
        );
        assert!(decode_base64("***").is_err());
    }

    #[test]
    fn test_dimensions() {
        let ops = RasterImageOps::default();
        assert_eq!(ops.dimensions(&test_image(64, 48)).unwrap(), (64, 48));
        assert!(matches!(
            ops.dimensions(&encode_base64(b"not an image")),
            Err(ImageError::Codec(_))
        ));
    }

    #[test]
    fn test_blur_paints_only_privacy_objects() {
        let ops = RasterImageOps::new(ImageFormat::Png);
        let objects = vec![
            object("face_privacy_filter", (2, 2), (10, 10)),
            object("garbagebag", (20, 20), (30, 30)),
        ];

        let blurred = ops.blur(&test_image(40, 40), &objects).unwrap();
        assert_eq!(pixel(&blurred, 5, 5), BLACK);
        assert_eq!(pixel(&blurred, 25, 25), Rgb([200, 200, 200]));
    }

    #[test]
    fn test_draw_boxes_privacy_toggle() {
        let ops = RasterImageOps::new(ImageFormat::Png);
        let objects = vec![
            object("license_plate_privacy_filter", (2, 2), (10, 10)),
            object("garbagebag", (20, 20), (30, 30)),
        ];
        let source = test_image(40, 40);

        let with_privacy = ops.draw_boxes(&source, &objects, true).unwrap();
        assert_ne!(pixel(&with_privacy, 2, 2), Rgb([200, 200, 200]));
        assert_ne!(pixel(&with_privacy, 20, 20), Rgb([200, 200, 200]));
        // interior untouched
        assert_eq!(pixel(&with_privacy, 25, 25), Rgb([200, 200, 200]));

        let without_privacy = ops.draw_boxes(&source, &objects, false).unwrap();
        assert_eq!(pixel(&without_privacy, 2, 2), Rgb([200, 200, 200]));
        assert_ne!(pixel(&without_privacy, 20, 20), Rgb([200, 200, 200]));
    }

    #[test]
    fn test_out_of_bounds_boxes_are_clamped() {
        let bbox = BoundingBox {
            coordinate1: (30, -5),
            coordinate2: (-10, 500),
        };
        assert_eq!(
            Rect::clamped(&bbox, 20, 20),
            Some(Rect {
                x0: 0,
                y0: 0,
                x1: 19,
                y1: 19
            })
        );

        let outside = BoundingBox {
            coordinate1: (50, 50),
            coordinate2: (60, 60),
        };
        assert_eq!(Rect::clamped(&outside, 20, 20), None);
    }

    #[test]
    fn test_for_extension() {
        assert!(RasterImageOps::for_extension("JPG").is_ok());
        assert!(RasterImageOps::for_extension("png").is_ok());
        assert!(matches!(
            RasterImageOps::for_extension("gif"),
            Err(ImageError::UnsupportedFormat(_))
        ));
    }
}
