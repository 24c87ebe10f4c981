//! Decoded picture values handed from the decode worker to the controller.

/// Pixel layout of a published frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar: full-size Y plus quarter-size U and V planes
    Yuv420p,
    /// NV12: full-size Y plus one quarter-size interleaved UV plane
    Nv12,
}

impl PixelFormat {
    /// Number of textures a rendering surface needs for this layout.
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
        }
    }

    /// Short lowercase name, matching the usual libav naming.
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Nv12 => "nv12",
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Texel layout of a single plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneLayout {
    /// One byte per texel (luma, or a single chroma component)
    R8,
    /// Two bytes per texel (interleaved chroma pair)
    Rg8,
}

impl PlaneLayout {
    pub fn bytes_per_texel(self) -> usize {
        match self {
            PlaneLayout::R8 => 1,
            PlaneLayout::Rg8 => 2,
        }
    }
}

/// One tightly packed plane, ready for texture upload.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneImage {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    pub layout: PlaneLayout,
    /// `width * height * bytes_per_texel` bytes, no row padding
    pub data: Vec<u8>,
}

impl PlaneImage {
    pub fn new(width: u32, height: u32, layout: PlaneLayout, data: Vec<u8>) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * layout.bytes_per_texel()
        );
        Self {
            width,
            height,
            layout,
            data,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// One decoded video frame, or the end-of-stream marker.
///
/// A frame is consumed exactly once: the controller pops it and either moves
/// its planes into the rendering surface or drops it.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    format: Option<PixelFormat>,
    pts: f64,
    planes: Vec<PlaneImage>,
}

impl FrameInfo {
    /// Creates a frame shown at `pts` seconds.
    pub fn new(format: PixelFormat, pts: f64, planes: Vec<PlaneImage>) -> Self {
        debug_assert!(pts >= 0.0, "negative presentation time is reserved for EOS");
        debug_assert_eq!(planes.len(), format.plane_count());
        Self {
            format: Some(format),
            pts,
            planes,
        }
    }

    /// The end-of-stream sentinel. Carries no picture data.
    pub fn end_of_stream() -> Self {
        Self {
            format: None,
            pts: -1.0,
            planes: Vec::new(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.pts < 0.0
    }

    /// Presentation time in seconds (negative for the sentinel).
    pub fn pts(&self) -> f64 {
        self.pts
    }

    pub fn format(&self) -> Option<PixelFormat> {
        self.format
    }

    pub fn planes(&self) -> &[PlaneImage] {
        &self.planes
    }

    /// Dimensions of the first (luma) plane.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.planes.first().map(PlaneImage::dimensions)
    }

    /// Gives up the planes; used when handing them to a texture.
    pub fn into_planes(self) -> Vec<PlaneImage> {
        self.planes
    }
}
