//! Video frame metadata and decoders.

use bytes::Bytes;

/// Frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags(pub u32);

impl FrameFlags {
    pub const KEYFRAME: Self = Self(1);
    pub const CORRUPT: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in milliseconds.
    pub timestamp: u64,
    pub flags: FrameFlags,
}

impl FrameInfo {
    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(FrameFlags::KEYFRAME)
    }
}

/// Decoded RGBA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub info: FrameInfo,
    pub rgba: Bytes,
}

/// Which decoder a unit uses, fixed when the unit is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DecoderKind {
    #[default]
    Hardware,
    Software,
}

/// Synchronous frame decoder. A `None` result means the frame was dropped.
pub trait VideoDecoder: Send {
    fn kind(&self) -> DecoderKind;

    fn decode(&mut self, data: &[u8], info: &FrameInfo) -> Option<DecodedFrame>;

    /// True until a keyframe has been decoded since creation or reset.
    fn needs_keyframe(&self) -> bool;

    fn reset(&mut self);
}

/// Converts raw I420 (planar Y, U, V with 2x2 chroma subsampling) to RGBA.
#[derive(Debug, Default)]
pub struct SoftwareDecoder {
    have_keyframe: bool,
}

impl SoftwareDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range conversion.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp_u8((c + 409 * e + 128) >> 8),
        clamp_u8((c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((c + 516 * d + 128) >> 8),
    ]
}

impl VideoDecoder for SoftwareDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Software
    }

    fn decode(&mut self, data: &[u8], info: &FrameInfo) -> Option<DecodedFrame> {
        if info.flags.contains(FrameFlags::CORRUPT) {
            return None;
        }
        if !self.have_keyframe && !info.is_keyframe() {
            return None;
        }
        let (w, h) = (info.width as usize, info.height as usize);
        if w == 0 || h == 0 || w % 2 != 0 || h % 2 != 0 {
            return None;
        }
        let luma = w * h;
        let chroma = luma / 4;
        if data.len() != luma + 2 * chroma {
            return None;
        }
        let (y_plane, rest) = data.split_at(luma);
        let (u_plane, v_plane) = rest.split_at(chroma);

        let mut rgba = Vec::with_capacity(luma * 4);
        for row in 0..h {
            for col in 0..w {
                let ci = (row / 2) * (w / 2) + col / 2;
                let [r, g, b] = yuv_to_rgb(y_plane[row * w + col], u_plane[ci], v_plane[ci]);
                rgba.extend_from_slice(&[r, g, b, 255]);
            }
        }
        self.have_keyframe = true;
        Some(DecodedFrame {
            info: *info,
            rgba: Bytes::from(rgba),
        })
    }

    fn needs_keyframe(&self) -> bool {
        !self.have_keyframe
    }

    fn reset(&mut self) {
        self.have_keyframe = false;
    }
}

/// Picks the decoder for a unit. Hardware decoding needs a platform
/// decoder; without one the software path is used.
pub fn select_decoder(
    kind: DecoderKind,
    platform: Option<Box<dyn VideoDecoder>>,
) -> Box<dyn VideoDecoder> {
    match (kind, platform) {
        (DecoderKind::Hardware, Some(decoder)) => decoder,
        (DecoderKind::Hardware, None) => {
            log::warn!(target: "Media/Video", "no platform decoder, using software decode");
            Box::new(SoftwareDecoder::new())
        }
        (DecoderKind::Software, _) => Box::new(SoftwareDecoder::new()),
    }
}
