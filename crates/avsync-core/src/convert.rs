//! Decoded picture to [`FrameInfo`] conversion.
//!
//! Plane extraction strips decoder row padding and produces tightly packed
//! planes. Device surfaces are first transferred to host memory through the
//! [`HardwareTransfer`] table.

use crate::container::{RawPixelFormat, RawPlane, RawVideoFrame, VideoPayload};
use crate::error::PipelineError;
use crate::frame::{FrameInfo, PixelFormat, PlaneImage, PlaneLayout};
use crate::hw_transfer::HardwareTransfer;

/// Copies `rows` rows of `row_bytes` each out of a padded plane.
fn copy_plane(
    plane: &RawPlane,
    row_bytes: usize,
    rows: usize,
) -> Result<Vec<u8>, PipelineError> {
    if plane.stride < row_bytes {
        return Err(PipelineError::TransientDecode(format!(
            "plane stride {} shorter than row {}",
            plane.stride, row_bytes
        )));
    }
    let needed = if rows == 0 {
        0
    } else {
        plane.stride * (rows - 1) + row_bytes
    };
    if plane.data.len() < needed {
        return Err(PipelineError::TransientDecode(format!(
            "plane holds {} bytes, need {}",
            plane.data.len(),
            needed
        )));
    }

    if plane.stride == row_bytes {
        return Ok(plane.data[..row_bytes * rows].to_vec());
    }
    let mut out = Vec::with_capacity(row_bytes * rows);
    for row in plane.data.chunks(plane.stride).take(rows) {
        out.extend_from_slice(&row[..row_bytes]);
    }
    Ok(out)
}

/// Chroma plane dimensions for 4:2:0 subsampling (rounded up for odd sizes).
fn chroma_dimensions(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(2), height.div_ceil(2))
}

fn plane_at<'a>(
    planes: &'a [RawPlane],
    index: usize,
    format: &str,
) -> Result<&'a RawPlane, PipelineError> {
    planes.get(index).ok_or_else(|| {
        PipelineError::TransientDecode(format!("{format} frame is missing plane {index}"))
    })
}

/// Y, U and V planes of a YUV 4:2:0 planar picture.
pub fn fill_yuv420p(
    width: u32,
    height: u32,
    planes: &[RawPlane],
) -> Result<Vec<PlaneImage>, PipelineError> {
    let (cw, ch) = chroma_dimensions(width, height);
    let y = copy_plane(plane_at(planes, 0, "yuv420p")?, width as usize, height as usize)?;
    let u = copy_plane(plane_at(planes, 1, "yuv420p")?, cw as usize, ch as usize)?;
    let v = copy_plane(plane_at(planes, 2, "yuv420p")?, cw as usize, ch as usize)?;
    Ok(vec![
        PlaneImage::new(width, height, PlaneLayout::R8, y),
        PlaneImage::new(cw, ch, PlaneLayout::R8, u),
        PlaneImage::new(cw, ch, PlaneLayout::R8, v),
    ])
}

/// Y plane and interleaved UV plane of an NV12 picture.
pub fn fill_nv12(
    width: u32,
    height: u32,
    planes: &[RawPlane],
) -> Result<Vec<PlaneImage>, PipelineError> {
    let (cw, ch) = chroma_dimensions(width, height);
    let y = copy_plane(plane_at(planes, 0, "nv12")?, width as usize, height as usize)?;
    let uv = copy_plane(plane_at(planes, 1, "nv12")?, cw as usize * 2, ch as usize)?;
    Ok(vec![
        PlaneImage::new(width, height, PlaneLayout::R8, y),
        PlaneImage::new(cw, ch, PlaneLayout::Rg8, uv),
    ])
}

/// Outcome of converting one decoded picture.
#[derive(Debug)]
pub enum Conversion {
    Frame(FrameInfo),
    /// The picture could not be converted and should be skipped
    Discarded(PipelineError),
}

/// Converts a decoded picture shown at `pts` seconds.
///
/// Malformed planes or a failed device transfer discard the picture. A
/// layout with no conversion path (unknown pixel format or unregistered
/// surface kind) is [`PipelineError::FatalFormat`].
pub fn frame_to_info(
    frame: RawVideoFrame,
    pts: f64,
    transfers: &HardwareTransfer,
) -> Result<Conversion, PipelineError> {
    let RawVideoFrame {
        width,
        height,
        payload,
        ..
    } = frame;

    let (format, planes) = match payload {
        VideoPayload::Host { format, planes } => (format, planes),
        VideoPayload::Surface(surface) => {
            let kind = surface.kind();
            let Some(transfer) = transfers.supports(kind) else {
                return Err(PipelineError::FatalFormat(format!(
                    "no host transfer for {} surfaces",
                    kind.name()
                )));
            };
            match transfer(surface.as_ref()) {
                Ok(picture) => {
                    tracing::trace!("Transferred {} surface to host memory", kind.name());
                    (picture.format, picture.planes)
                }
                Err(e) => {
                    return Ok(Conversion::Discarded(PipelineError::TransientDecode(
                        format!("failed to transfer {} surface: {e}", kind.name()),
                    )));
                }
            }
        }
    };

    let (pixel_format, result) = match format {
        RawPixelFormat::Yuv420p => (PixelFormat::Yuv420p, fill_yuv420p(width, height, &planes)),
        RawPixelFormat::Nv12 => (PixelFormat::Nv12, fill_nv12(width, height, &planes)),
        RawPixelFormat::Other(name) => {
            return Err(PipelineError::FatalFormat(format!("pixel format {name}")));
        }
    };

    Ok(match result {
        Ok(images) => Conversion::Frame(FrameInfo::new(pixel_format, pts, images)),
        Err(e) => Conversion::Discarded(e),
    })
}
