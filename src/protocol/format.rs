//! Pixel formats and format negotiation state
//!
//! Formats are DRM fourcc codes. `wl_shm` uses the same codes except for
//! ARGB8888 and XRGB8888, which have the legacy values 0 and 1.

use std::collections::HashMap;
use std::fmt;

/// Modifier meaning "linear, no tiling"
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
/// Modifier meaning "implicit, driver chooses"
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// A DRM fourcc pixel format code
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const ARGB8888: Fourcc = Fourcc::from_chars(*b"AR24");
    pub const XRGB8888: Fourcc = Fourcc::from_chars(*b"XR24");
    pub const ABGR8888: Fourcc = Fourcc::from_chars(*b"AB24");
    pub const XBGR8888: Fourcc = Fourcc::from_chars(*b"XB24");
    pub const NV12: Fourcc = Fourcc::from_chars(*b"NV12");
    pub const YUV420: Fourcc = Fourcc::from_chars(*b"YU12");

    pub const fn from_chars(chars: [u8; 4]) -> Self {
        Fourcc(
            chars[0] as u32
                | (chars[1] as u32) << 8
                | (chars[2] as u32) << 16
                | (chars[3] as u32) << 24,
        )
    }

    /// Whether the format carries an alpha channel
    pub fn has_alpha(&self) -> bool {
        matches!(*self, Fourcc::ARGB8888 | Fourcc::ABGR8888)
    }

    /// Whether the format is planar YUV
    pub fn is_yuv(&self) -> bool {
        matches!(*self, Fourcc::NV12 | Fourcc::YUV420)
    }

    /// Bytes per pixel of the first plane
    pub fn bytes_per_pixel(&self) -> u32 {
        if self.is_yuv() {
            1
        } else {
            4
        }
    }

    /// The opaque variant of an alpha format, or the format itself
    pub fn opaque_variant(&self) -> Fourcc {
        match *self {
            Fourcc::ARGB8888 => Fourcc::XRGB8888,
            Fourcc::ABGR8888 => Fourcc::XBGR8888,
            other => other,
        }
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            write!(
                f,
                "Fourcc({})",
                bytes.iter().map(|b| *b as char).collect::<String>()
            )
        } else {
            write!(f, "Fourcc({:#010x})", self.0)
        }
    }
}

/// Formats advertised by the compositor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatTable {
    shm: Vec<Fourcc>,
    dmabuf: HashMap<Fourcc, Vec<u64>>,
}

impl FormatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `wl_shm.format` event (raw protocol value)
    pub fn add_shm(&mut self, wl_format: u32) {
        let fourcc = super::shm::ShmFormat::from_wayland(wl_format).fourcc();
        if !self.shm.contains(&fourcc) {
            self.shm.push(fourcc);
        }
    }

    /// Record a dma-buf format/modifier pair
    pub fn add_dmabuf(&mut self, fourcc: Fourcc, modifier: u64) {
        let modifiers = self.dmabuf.entry(fourcc).or_default();
        if !modifiers.contains(&modifier) {
            modifiers.push(modifier);
        }
    }

    pub fn supports_shm(&self, fourcc: Fourcc) -> bool {
        self.shm.contains(&fourcc)
    }

    pub fn supports_dmabuf(&self, fourcc: Fourcc) -> bool {
        self.dmabuf.contains_key(&fourcc)
    }

    /// Explicit modifiers advertised for a format
    ///
    /// The implicit (`DRM_FORMAT_MOD_INVALID`) entry is filtered out since it
    /// is not something an allocator can be asked for.
    pub fn modifiers(&self, fourcc: Fourcc) -> Vec<u64> {
        self.dmabuf
            .get(&fourcc)
            .map(|mods| {
                mods.iter()
                    .copied()
                    .filter(|m| *m != DRM_FORMAT_MOD_INVALID)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn shm_formats(&self) -> &[Fourcc] {
        &self.shm
    }

    pub fn is_empty(&self) -> bool {
        self.shm.is_empty() && self.dmabuf.is_empty()
    }

    /// Pick the format for a new buffer
    ///
    /// Opaque content prefers XRGB so the compositor can skip blending; the
    /// alpha variant is used when XRGB is not advertised. With an empty
    /// table the wl_shm mandatory ARGB8888 is assumed.
    pub fn negotiate(&self, opaque: bool, dmabuf: bool) -> Fourcc {
        let supported = |fourcc: Fourcc| {
            if dmabuf {
                self.supports_dmabuf(fourcc)
            } else {
                self.supports_shm(fourcc)
            }
        };
        let preferred = if opaque {
            [Fourcc::XRGB8888, Fourcc::ARGB8888]
        } else {
            [Fourcc::ARGB8888, Fourcc::XRGB8888]
        };
        preferred
            .into_iter()
            .find(|f| supported(*f))
            .unwrap_or(Fourcc::ARGB8888)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_codes() {
        assert_eq!(Fourcc::ARGB8888.0, 0x3432_5241);
        assert_eq!(Fourcc::XRGB8888.0, 0x3432_5258);
        assert_eq!(format!("{:?}", Fourcc::NV12), "Fourcc(NV12)");
        assert_eq!(Fourcc::ARGB8888.opaque_variant(), Fourcc::XRGB8888);
    }

    #[test]
    fn test_negotiate_prefers_opaque_format() {
        let mut table = FormatTable::new();
        table.add_shm(0);
        table.add_shm(1);
        assert_eq!(table.negotiate(true, false), Fourcc::XRGB8888);
        assert_eq!(table.negotiate(false, false), Fourcc::ARGB8888);
    }

    #[test]
    fn test_negotiate_falls_back_to_mandatory_format() {
        let table = FormatTable::new();
        assert_eq!(table.negotiate(true, true), Fourcc::ARGB8888);
    }

    #[test]
    fn test_modifiers_filter_implicit() {
        let mut table = FormatTable::new();
        table.add_dmabuf(Fourcc::XRGB8888, DRM_FORMAT_MOD_INVALID);
        table.add_dmabuf(Fourcc::XRGB8888, DRM_FORMAT_MOD_LINEAR);
        table.add_dmabuf(Fourcc::XRGB8888, DRM_FORMAT_MOD_LINEAR);
        assert_eq!(table.modifiers(Fourcc::XRGB8888), vec![DRM_FORMAT_MOD_LINEAR]);
        assert!(table.supports_dmabuf(Fourcc::XRGB8888));
    }
}
