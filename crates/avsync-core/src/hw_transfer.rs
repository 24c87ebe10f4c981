//! Hardware surface readback.
//!
//! A decoder running on a hardware device emits frames that live in device
//! memory. Before plane extraction they are transferred to host memory. The
//! transfer is looked up by surface kind in a [`HardwareTransfer`] table, so
//! new device types are added by registering an entry rather than by
//! branching in the decode worker.

use std::collections::HashMap;

use crate::container::{ContainerError, RawPixelFormat, RawPlane};

/// Device surface families a decoder may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    /// Direct3D 9 DXVA2 surface
    Dxva2Vld,
    /// Direct3D 11 texture
    D3d11,
    /// Apple VideoToolbox CVPixelBuffer
    VideoToolbox,
    /// VA-API surface (Linux)
    Vaapi,
    /// NVIDIA CUDA device memory
    Cuda,
}

impl SurfaceKind {
    pub fn name(self) -> &'static str {
        match self {
            SurfaceKind::Dxva2Vld => "dxva2_vld",
            SurfaceKind::D3d11 => "d3d11",
            SurfaceKind::VideoToolbox => "videotoolbox_vld",
            SurfaceKind::Vaapi => "vaapi",
            SurfaceKind::Cuda => "cuda",
        }
    }
}

/// A decoded picture resident in device memory.
pub trait HardwareSurface: Send {
    fn kind(&self) -> SurfaceKind;

    /// Copies the surface into host memory, in whatever layout the device
    /// downloads to.
    fn download(&self) -> Result<(RawPixelFormat, Vec<RawPlane>), ContainerError>;
}

/// Host-memory result of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct HostPicture {
    pub format: RawPixelFormat,
    pub planes: Vec<RawPlane>,
}

/// Transfer function registered for a surface kind.
pub type TransferFn = fn(&dyn HardwareSurface) -> Result<HostPicture, ContainerError>;

/// Downloads a surface and requires NV12 output, the layout the common
/// Windows and Apple decoders download to.
pub fn transfer_to_nv12(surface: &dyn HardwareSurface) -> Result<HostPicture, ContainerError> {
    let (format, planes) = surface.download()?;
    if format != RawPixelFormat::Nv12 {
        return Err(ContainerError::InvalidData(format!(
            "{} surface downloaded as {}, expected nv12",
            surface.kind().name(),
            format.name()
        )));
    }
    Ok(HostPicture { format, planes })
}

/// Capability table: surface kind to transfer function.
#[derive(Clone)]
pub struct HardwareTransfer {
    entries: HashMap<SurfaceKind, TransferFn>,
}

impl std::fmt::Debug for HardwareTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl HardwareTransfer {
    /// An empty table; every surface is unsupported.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers (or replaces) the transfer for `kind`.
    pub fn register(&mut self, kind: SurfaceKind, transfer: TransferFn) -> &mut Self {
        self.entries.insert(kind, transfer);
        self
    }

    /// Returns the transfer function for `kind`, if the surface is supported.
    pub fn supports(&self, kind: SurfaceKind) -> Option<TransferFn> {
        self.entries.get(&kind).copied()
    }
}

impl Default for HardwareTransfer {
    /// Every surface kind a decoder may emit, each downloaded to NV12.
    fn default() -> Self {
        let mut table = Self::empty();
        table
            .register(SurfaceKind::Dxva2Vld, transfer_to_nv12)
            .register(SurfaceKind::D3d11, transfer_to_nv12)
            .register(SurfaceKind::VideoToolbox, transfer_to_nv12)
            .register(SurfaceKind::Vaapi, transfer_to_nv12)
            .register(SurfaceKind::Cuda, transfer_to_nv12);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSurface {
        kind: SurfaceKind,
        format: RawPixelFormat,
    }

    impl HardwareSurface for FakeSurface {
        fn kind(&self) -> SurfaceKind {
            self.kind
        }

        fn download(&self) -> Result<(RawPixelFormat, Vec<RawPlane>), ContainerError> {
            Ok((
                self.format.clone(),
                vec![RawPlane {
                    data: vec![16; 4],
                    stride: 2,
                }],
            ))
        }
    }

    #[test]
    fn test_default_table_covers_every_surface_kind() {
        let table = HardwareTransfer::default();
        assert!(table.supports(SurfaceKind::Dxva2Vld).is_some());
        assert!(table.supports(SurfaceKind::D3d11).is_some());
        assert!(table.supports(SurfaceKind::VideoToolbox).is_some());
        assert!(table.supports(SurfaceKind::Vaapi).is_some());
        assert!(table.supports(SurfaceKind::Cuda).is_some());
        assert!(HardwareTransfer::empty().supports(SurfaceKind::D3d11).is_none());
    }

    #[test]
    fn test_register_new_kind() {
        let mut table = HardwareTransfer::empty();
        table.register(SurfaceKind::Vaapi, transfer_to_nv12);
        let Some(transfer) = table.supports(SurfaceKind::Vaapi) else {
            panic!("vaapi should be registered");
        };
        let surface = FakeSurface {
            kind: SurfaceKind::Vaapi,
            format: RawPixelFormat::Nv12,
        };
        let Ok(picture) = transfer(&surface) else {
            panic!("transfer should succeed");
        };
        assert_eq!(picture.format, RawPixelFormat::Nv12);
        assert_eq!(picture.planes.len(), 1);
    }

    #[test]
    fn test_transfer_rejects_unexpected_layout() {
        let surface = FakeSurface {
            kind: SurfaceKind::D3d11,
            format: RawPixelFormat::Other("p010le".to_string()),
        };
        match transfer_to_nv12(&surface) {
            Err(ContainerError::InvalidData(msg)) => assert!(msg.contains("p010le")),
            other => panic!("Expected InvalidData, got {other:?}"),
        }
    }
}
