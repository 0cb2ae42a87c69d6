use image::{DynamicImage, GrayImage, ImageBuffer, ImageReader, Luma, RgbImage, RgbaImage};
use std::io::Cursor;

use crate::config::Transport;

/// Pixel encodings understood by the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoding {
    Mono8,
    Mono16,
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    /// Raw sensor mosaic (`bayer_rggb8`, `bayer_grbg8`, ...). Saved as `mono8`
    /// once normalized; the original tag is kept for logging.
    Bayer(String),
    /// Anything else. Can still be dumped as `.raw`, but not encoded.
    Other(String),
}

impl Encoding {
    /// Parse a wire tag. Matching is case-insensitive; any tag containing
    /// "bayer" becomes [`Encoding::Bayer`].
    pub fn parse(tag: &str) -> Self {
        let lower = tag.to_ascii_lowercase();
        if lower.contains("bayer") {
            return Encoding::Bayer(tag.to_string());
        }
        match lower.as_str() {
            "mono8" | "8uc1" => Encoding::Mono8,
            "mono16" | "16uc1" => Encoding::Mono16,
            "rgb8" => Encoding::Rgb8,
            "bgr8" | "8uc3" => Encoding::Bgr8,
            "rgba8" => Encoding::Rgba8,
            "bgra8" | "8uc4" => Encoding::Bgra8,
            _ => Encoding::Other(tag.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Encoding::Mono8 => "mono8",
            Encoding::Mono16 => "mono16",
            Encoding::Rgb8 => "rgb8",
            Encoding::Bgr8 => "bgr8",
            Encoding::Rgba8 => "rgba8",
            Encoding::Bgra8 => "bgra8",
            Encoding::Bayer(tag) | Encoding::Other(tag) => tag,
        }
    }

    /// Bytes per pixel, if known.
    pub fn pixel_size(&self) -> Option<usize> {
        match self {
            Encoding::Mono8 => Some(1),
            Encoding::Mono16 => Some(2),
            Encoding::Rgb8 | Encoding::Bgr8 => Some(3),
            Encoding::Rgba8 | Encoding::Bgra8 => Some(4),
            Encoding::Bayer(_) | Encoding::Other(_) => None,
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One image received from the frame topic.
///
/// Binary wire format (raw transport):
///   [0..8]      stamp_ms      (i64 big-endian, Unix millis)
///   [8..12]     width         (u32 big-endian)
///   [12..16]    height        (u32 big-endian)
///   [16]        encoding_len  (u8)
///   [17..17+n]  encoding      (UTF-8 tag, e.g. "bgr8")
///   [17+n..]    data          (pixels, rows tightly packed)
///
/// Compressed transport:
///   [0..8]      stamp_ms      (i64 big-endian)
///   [8..]       encoded image (JPEG, PNG, ...)
#[derive(Clone)]
pub struct ImageFrame {
    data: Vec<u8>,
    encoding: Encoding,
    width: u32,
    height: u32,
    stamp_ms: i64,
}

const HEADER_SIZE: usize = 17; // 8 ts + 4 width + 4 height + 1 encoding_len
const STAMP_SIZE: usize = 8;

impl ImageFrame {
    pub fn new(data: Vec<u8>, encoding: Encoding, width: u32, height: u32, stamp_ms: i64) -> Self {
        Self {
            data,
            encoding,
            width,
            height,
            stamp_ms,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stamp_ms(&self) -> i64 {
        self.stamp_ms
    }

    pub fn captured_at(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.stamp_ms).unwrap_or_else(chrono::Utc::now)
    }

    /// Rewrite a bayer tag to `mono8` so the mosaic can be saved as-is.
    /// Returns true if the encoding changed.
    pub fn normalize_encoding(&mut self) -> bool {
        if matches!(self.encoding, Encoding::Bayer(_)) {
            self.encoding = Encoding::Mono8;
            true
        } else {
            false
        }
    }

    // -- Pixel conversion -------------------------------------------------------

    /// Check that the buffer holds a whole image for its encoding.
    ///
    /// Unknown encodings pass as long as there is data: they can still be
    /// dumped verbatim. Use [`ImageFrame::check_convertible`] when the frame
    /// will be encoded.
    pub fn check_pixels(&self) -> Result<(), PixelError> {
        if self.data.is_empty() {
            return Err(PixelError::Empty);
        }
        match self.encoding.pixel_size() {
            Some(pixel_size) => self.expected_len(pixel_size).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Like [`ImageFrame::check_pixels`], but also rejects encodings that
    /// cannot be turned into RGB.
    pub fn check_convertible(&self) -> Result<(), PixelError> {
        if self.data.is_empty() {
            return Err(PixelError::Empty);
        }
        let pixel_size = self
            .encoding
            .pixel_size()
            .ok_or_else(|| PixelError::Unsupported(self.encoding.to_string()))?;
        self.expected_len(pixel_size).map(|_| ())
    }

    /// Bytes a whole image occupies, checked against the buffer.
    fn expected_len(&self, pixel_size: usize) -> Result<usize, PixelError> {
        if self.width == 0 || self.height == 0 {
            return Err(PixelError::ZeroDimensions {
                width: self.width,
                height: self.height,
            });
        }
        let expected = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|n| n.checked_mul(pixel_size))
            .ok_or(PixelError::TooLarge {
                width: self.width,
                height: self.height,
            })?;
        if self.data.len() < expected {
            return Err(PixelError::Truncated {
                got: self.data.len(),
                expected,
            });
        }
        Ok(expected)
    }

    /// Convert to a 3-channel RGB image for encoding.
    pub fn to_rgb_image(&self) -> Result<RgbImage, PixelError> {
        self.check_convertible()?;
        let pixel_size = self
            .encoding
            .pixel_size()
            .ok_or_else(|| PixelError::Unsupported(self.encoding.to_string()))?;
        let expected = self.expected_len(pixel_size)?;
        let src = &self.data[..expected];
        let (w, h) = (self.width, self.height);
        let truncated = || PixelError::Truncated {
            got: self.data.len(),
            expected,
        };

        let image = match self.encoding {
            Encoding::Mono8 => DynamicImage::ImageLuma8(
                GrayImage::from_raw(w, h, src.to_vec()).ok_or_else(truncated)?,
            ),
            Encoding::Mono16 => {
                // Little-endian samples.
                let samples = src
                    .chunks_exact(2)
                    .map(|px| u16::from_le_bytes([px[0], px[1]]))
                    .collect();
                DynamicImage::ImageLuma16(
                    ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(w, h, samples)
                        .ok_or_else(truncated)?,
                )
            }
            Encoding::Rgb8 => {
                return RgbImage::from_raw(w, h, src.to_vec()).ok_or_else(truncated);
            }
            Encoding::Bgr8 => {
                let mut rgb = src.to_vec();
                swap_red_blue(&mut rgb, 3);
                return RgbImage::from_raw(w, h, rgb).ok_or_else(truncated);
            }
            Encoding::Rgba8 => DynamicImage::ImageRgba8(
                RgbaImage::from_raw(w, h, src.to_vec()).ok_or_else(truncated)?,
            ),
            Encoding::Bgra8 => {
                let mut rgba = src.to_vec();
                swap_red_blue(&mut rgba, 4);
                DynamicImage::ImageRgba8(RgbaImage::from_raw(w, h, rgba).ok_or_else(truncated)?)
            }
            Encoding::Bayer(_) | Encoding::Other(_) => {
                return Err(PixelError::Unsupported(self.encoding.to_string()))
            }
        };
        Ok(image.to_rgb8())
    }

    /// Packed `bgr24` pixels, as fed to a rawvideo encoder.
    pub fn to_bgr24(&self) -> Result<Vec<u8>, PixelError> {
        let mut bytes = self.to_rgb_image()?.into_raw();
        swap_red_blue(&mut bytes, 3);
        Ok(bytes)
    }

    // -- Serialization ----------------------------------------------------------

    /// Serialize to the raw-transport Kafka payload.
    pub fn serialize(&self) -> Vec<u8> {
        let tag = self.encoding.as_str().as_bytes();
        let tag = &tag[..tag.len().min(u8::MAX as usize)];
        let mut buf = Vec::with_capacity(HEADER_SIZE + tag.len() + self.data.len());
        buf.extend_from_slice(&self.stamp_ms.to_be_bytes());
        buf.extend_from_slice(&self.width.to_be_bytes());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.push(tag.len() as u8);
        buf.extend_from_slice(tag);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode a Kafka payload carried over `transport`.
    pub fn from_payload(data: &[u8], transport: Transport) -> Result<Self, FrameError> {
        match transport {
            Transport::Raw => Self::deserialize(data),
            Transport::Compressed => Self::decode_compressed(data),
        }
    }

    /// Deserialize a raw-transport Kafka payload.
    pub fn deserialize(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::TooShort {
                got: data.len(),
                expected: HEADER_SIZE,
            });
        }
        let stamp_ms = read_stamp(data);
        let width = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let height = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let tag_len = data[16] as usize;
        let tag_end = HEADER_SIZE + tag_len;
        if data.len() < tag_end {
            return Err(FrameError::TooShort {
                got: data.len(),
                expected: tag_end,
            });
        }
        let tag = std::str::from_utf8(&data[HEADER_SIZE..tag_end])
            .map_err(|e| FrameError::Encoding(e.to_string()))?;

        Ok(Self {
            data: data[tag_end..].to_vec(),
            encoding: Encoding::parse(tag),
            width,
            height,
            stamp_ms,
        })
    }

    /// Decode a compressed-transport payload into an `rgb8` frame.
    pub fn decode_compressed(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < STAMP_SIZE {
            return Err(FrameError::TooShort {
                got: data.len(),
                expected: STAMP_SIZE,
            });
        }
        let stamp_ms = read_stamp(data);
        let img = ImageReader::new(Cursor::new(&data[STAMP_SIZE..]))
            .with_guessed_format()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .to_rgb8();

        let (width, height) = img.dimensions();
        Ok(Self {
            data: img.into_raw(),
            encoding: Encoding::Rgb8,
            width,
            height,
            stamp_ms,
        })
    }
}

fn swap_red_blue(pixels: &mut [u8], channels: usize) {
    for px in pixels.chunks_exact_mut(channels) {
        px.swap(0, 2);
    }
}

fn read_stamp(data: &[u8]) -> i64 {
    let mut stamp = [0u8; STAMP_SIZE];
    stamp.copy_from_slice(&data[..STAMP_SIZE]);
    i64::from_be_bytes(stamp)
}

impl std::fmt::Debug for ImageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageFrame")
            .field("encoding", &self.encoding)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stamp_ms", &self.stamp_ms)
            .field("data_bytes", &self.data.len())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload too short: got {got} bytes, expected at least {expected}")]
    TooShort { got: usize, expected: usize },
    #[error("encoding tag is not valid UTF-8: {0}")]
    Encoding(String),
    #[error("failed to decode compressed image: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PixelError {
    #[error("no pixel data")]
    Empty,
    #[error("cannot convert {0} image to rgb8")]
    Unsupported(String),
    #[error("image has zero size ({width}x{height})")]
    ZeroDimensions { width: u32, height: u32 },
    #[error("pixel buffer too short: got {got} bytes, expected {expected}")]
    Truncated { got: usize, expected: usize },
    #[error("image dimensions {width}x{height} overflow the address space")]
    TooLarge { width: u32, height: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bayer_tags_parse_case_insensitively() {
        assert_eq!(
            Encoding::parse("bayer_rggb8"),
            Encoding::Bayer("bayer_rggb8".into())
        );
        assert_eq!(
            Encoding::parse("BAYER_GRBG8"),
            Encoding::Bayer("BAYER_GRBG8".into())
        );
        assert_eq!(Encoding::parse("BGR8"), Encoding::Bgr8);
        assert_eq!(Encoding::parse("yuv422"), Encoding::Other("yuv422".into()));
    }

    #[test]
    fn normalize_only_touches_bayer() {
        let mut frame = ImageFrame::new(vec![1; 4], Encoding::parse("bayer_bggr8"), 2, 2, 0);
        assert!(frame.normalize_encoding());
        assert_eq!(frame.encoding(), &Encoding::Mono8);
        assert!(!frame.normalize_encoding());

        let mut rgb = ImageFrame::new(vec![1; 12], Encoding::Rgb8, 2, 2, 0);
        assert!(!rgb.normalize_encoding());
        assert_eq!(rgb.encoding(), &Encoding::Rgb8);
    }

    #[test]
    fn roundtrip_raw_envelope() {
        let frame = ImageFrame::new(vec![9, 8, 7, 6, 5, 4], Encoding::Bgr8, 2, 1, 1708300000000);
        let decoded = ImageFrame::deserialize(&frame.serialize()).unwrap();
        assert_eq!(decoded.stamp_ms(), 1708300000000);
        assert_eq!(decoded.width(), 2);
        assert_eq!(decoded.height(), 1);
        assert_eq!(decoded.encoding(), &Encoding::Bgr8);
        assert_eq!(decoded.data(), &[9, 8, 7, 6, 5, 4]);
    }

    #[test]
    fn deserialize_keeps_empty_buffer() {
        let frame = ImageFrame::new(vec![], Encoding::Mono8, 640, 480, 5);
        let decoded = ImageFrame::deserialize(&frame.serialize()).unwrap();
        assert!(decoded.data().is_empty());
        assert_eq!(decoded.check_pixels(), Err(PixelError::Empty));
    }

    #[test]
    fn deserialize_too_short() {
        assert!(matches!(
            ImageFrame::deserialize(&[0; 10]),
            Err(FrameError::TooShort { got: 10, .. })
        ));
        // Header claims a 5-byte tag but only 2 follow.
        let mut payload = vec![0; HEADER_SIZE];
        payload[16] = 5;
        payload.extend_from_slice(b"bg");
        assert!(matches!(
            ImageFrame::deserialize(&payload),
            Err(FrameError::TooShort { expected: 22, .. })
        ));
    }

    #[test]
    fn bgr_converts_to_rgb() {
        let frame = ImageFrame::new(vec![10, 20, 30, 40, 50, 60], Encoding::Bgr8, 2, 1, 0);
        let img = frame.to_rgb_image().unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [30, 20, 10]);
        assert_eq!(img.get_pixel(1, 0).0, [60, 50, 40]);
        assert_eq!(frame.to_bgr24().unwrap(), vec![10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn mono_expands_to_three_channels() {
        let frame = ImageFrame::new(vec![0, 128, 255, 7], Encoding::Mono8, 2, 2, 0);
        let img = frame.to_rgb_image().unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [128, 128, 128]);

        let wide = ImageFrame::new(vec![0x00, 0x00, 0xFF, 0xFF], Encoding::Mono16, 2, 1, 0);
        let img = wide.to_rgb_image().unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0; 3]);
        assert_eq!(img.get_pixel(1, 0).0, [255; 3]);
    }

    #[test]
    fn alpha_is_dropped() {
        let rgba = ImageFrame::new(vec![1, 2, 3, 255, 4, 5, 6, 0], Encoding::Rgba8, 2, 1, 0);
        let img = rgba.to_rgb_image().unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [1, 2, 3]);
        assert_eq!(img.get_pixel(1, 0).0, [4, 5, 6]);

        let bgra = ImageFrame::new(vec![1, 2, 3, 255], Encoding::Bgra8, 1, 1, 0);
        assert_eq!(bgra.to_rgb_image().unwrap().get_pixel(0, 0).0, [3, 2, 1]);
    }

    #[test]
    fn huge_dimensions_are_rejected_not_overflowed() {
        let frame = ImageFrame::new(vec![1; 4], Encoding::Rgba8, u32::MAX, u32::MAX, 0);
        let err = PixelError::TooLarge {
            width: u32::MAX,
            height: u32::MAX,
        };
        assert_eq!(frame.check_pixels(), Err(err.clone()));
        assert_eq!(frame.check_convertible(), Err(err.clone()));
        assert_eq!(frame.to_rgb_image().unwrap_err(), err);
    }

    #[test]
    fn conversion_errors() {
        let short = ImageFrame::new(vec![0; 5], Encoding::Rgb8, 2, 1, 0);
        assert_eq!(
            short.to_rgb_image().unwrap_err(),
            PixelError::Truncated { got: 5, expected: 6 }
        );

        let unnormalized = ImageFrame::new(vec![0; 4], Encoding::parse("bayer_rggb8"), 2, 2, 0);
        assert!(matches!(
            unnormalized.to_rgb_image(),
            Err(PixelError::Unsupported(_))
        ));

        let flat = ImageFrame::new(vec![0; 4], Encoding::Mono8, 0, 4, 0);
        assert!(matches!(
            flat.to_rgb_image(),
            Err(PixelError::ZeroDimensions { .. })
        ));
    }

    #[test]
    fn check_pixels_validates_known_layouts_only() {
        let empty = ImageFrame::new(vec![], Encoding::Mono8, 2, 2, 0);
        assert_eq!(empty.check_pixels(), Err(PixelError::Empty));

        let whole = ImageFrame::new(vec![0; 12], Encoding::Bgr8, 2, 2, 0);
        assert_eq!(whole.check_pixels(), Ok(()));

        let short = ImageFrame::new(vec![0; 11], Encoding::Bgr8, 2, 2, 0);
        assert!(matches!(short.check_pixels(), Err(PixelError::Truncated { .. })));

        // Unknown layout: anything non-empty can still be dumped.
        let yuv = ImageFrame::new(vec![0; 3], Encoding::parse("yuv422"), 2, 2, 0);
        assert_eq!(yuv.check_pixels(), Ok(()));
        assert!(matches!(yuv.check_convertible(), Err(PixelError::Unsupported(_))));
        assert!(matches!(yuv.to_rgb_image(), Err(PixelError::Unsupported(_))));
        assert_eq!(whole.check_convertible(), Ok(()));
    }

    #[test]
    fn compressed_payload_decodes_to_rgb8() {
        let mut png = Vec::new();
        RgbImage::from_pixel(3, 2, image::Rgb([1, 2, 3]))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let mut payload = 42i64.to_be_bytes().to_vec();
        payload.extend_from_slice(&png);

        let frame = ImageFrame::decode_compressed(&payload).unwrap();
        assert_eq!(frame.stamp_ms(), 42);
        assert_eq!((frame.width(), frame.height()), (3, 2));
        assert_eq!(frame.encoding(), &Encoding::Rgb8);
        assert_eq!(&frame.data()[..3], &[1, 2, 3]);
    }

    #[test]
    fn payload_dispatch_follows_transport() {
        let raw = ImageFrame::new(vec![3; 4], Encoding::Mono8, 2, 2, 11).serialize();
        let frame = ImageFrame::from_payload(&raw, Transport::Raw).unwrap();
        assert_eq!(frame.data(), &[3; 4]);
        // The same bytes are not a decodable compressed image.
        assert!(ImageFrame::from_payload(&raw, Transport::Compressed).is_err());
    }

    #[test]
    fn compressed_garbage_is_rejected() {
        let mut payload = 0i64.to_be_bytes().to_vec();
        payload.extend_from_slice(b"not an image");
        assert!(matches!(
            ImageFrame::decode_compressed(&payload),
            Err(FrameError::Decode(_))
        ));
    }
}
