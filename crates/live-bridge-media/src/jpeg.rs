//! Still-image encoding for inbound video frames.

use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;

use crate::MediaError;
use crate::ingress::{PixelData, VideoFrame};

/// Encode a decoded video frame as a baseline JPEG.
pub fn encode_jpeg(frame: &VideoFrame, quality: u8) -> Result<Vec<u8>, MediaError> {
    let rgb = frame.to_rgb24()?;
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| MediaError::Image(e.to_string()))?;
    Ok(out)
}

/// Convert planar I420 to packed RGB24 (BT.601, limited range).
pub fn i420_to_rgb24(
    y_plane: &[u8],
    u_plane: &[u8],
    v_plane: &[u8],
    width: u32,
    height: u32,
) -> Result<Vec<u8>, MediaError> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    if y_plane.len() < w * h || u_plane.len() < cw * ch || v_plane.len() < cw * ch {
        return Err(MediaError::Image(format!(
            "short I420 planes for {width}x{height}"
        )));
    }

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let y = y_plane[row * w + col] as f32 - 16.0;
            let ci = (row / 2) * cw + col / 2;
            let u = u_plane[ci] as f32 - 128.0;
            let v = v_plane[ci] as f32 - 128.0;

            let r = 1.164 * y + 1.596 * v;
            let g = 1.164 * y - 0.392 * u - 0.813 * v;
            let b = 1.164 * y + 2.017 * u;
            rgb.extend([clamp_u8(r), clamp_u8(g), clamp_u8(b)]);
        }
    }
    Ok(rgb)
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

impl VideoFrame {
    /// Packed RGB24 view of this frame, converting if needed.
    pub fn to_rgb24(&self) -> Result<std::borrow::Cow<'_, [u8]>, MediaError> {
        match &self.pixels {
            PixelData::Rgb24(data) => {
                let expected = self.width as usize * self.height as usize * 3;
                if data.len() != expected {
                    return Err(MediaError::Image(format!(
                        "expected {expected} RGB bytes, got {}",
                        data.len()
                    )));
                }
                Ok(std::borrow::Cow::Borrowed(data.as_slice()))
            }
            PixelData::I420 { y, u, v } => {
                i420_to_rgb24(y, u, v, self.width, self.height).map(std::borrow::Cow::Owned)
            }
        }
    }
}
