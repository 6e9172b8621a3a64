// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Typed read/write access to the metadata blob behind an opaque
//! graphics-buffer handle.
//!
//! Two backend generations exist in the field: the metadata-based v4 mapper
//! and the legacy "perform op" interface. Only those two exist and the
//! choice is made once at init from the running gralloc major version, so
//! the facade is a tagged enum rather than a trait object.
//!
//! Scalar getters keep the legacy failure convention of the metadata ABI:
//! `-1` for signed scalars, `0` for the u64 ones.

pub mod origin;
pub mod v4;

use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::error::C2Error;
use crate::error::C2Result;
use crate::Rect;

pub use origin::GrallocOrigin;
pub use v4::Gralloc4;

/// Per-plane layout, as the v4 mapper reports it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: u64,
    pub byte_stride: i64,
    pub width_in_samples: i64,
    pub total_size: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalePlane {
    pub offset: u32,
    pub byte_stride: u32,
}

/// Scaling metadata embedded in the buffer, shared with the display path.
///
/// `request_mask == 1` means the display pipeline wants a scaled thumbnail,
/// `2` means it does not; any other value leaves the previous decision
/// unchanged. When the decoder honors a request it fills `reply_mask = 1`
/// and the thumbnail plane layout.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScaleMeta {
    pub request_mask: u32,
    pub reply_mask: u32,
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub thumb_stride: u32,
    pub src_rect: Rect,
    pub format: u32,
    pub modifier: u64,
    pub planes: [ScalePlane; 2],
    pub usage: u64,
}

pub const SCALE_REQUEST_THUMBNAIL: u32 = 1;
pub const SCALE_REQUEST_NONE: u32 = 2;

/// In-process view of an opaque buffer handle together with the metadata
/// blob the backends interpret. The raw plane fds come from the vendor
/// `PLANE_FDS` key; the legacy stride fields are what the origin backend's
/// perform ops would report.
#[derive(Debug)]
pub struct BufferHandle {
    pub(crate) plane_fds: Vec<i32>,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format_requested: u32,
    pub(crate) allocation_size: u32,
    pub(crate) usage: u64,
    pub(crate) buffer_id: u64,
    pub(crate) plane_layouts: Vec<PlaneLayout>,
    pub(crate) legacy_pixel_stride: i32,
    pub(crate) legacy_byte_stride: i32,
    dynamic_hdr_offset: Mutex<Option<i64>>,
    scale_meta: Mutex<ScaleMeta>,
}

/// Plain-data description used to construct a [`BufferHandle`].
#[derive(Clone, Debug, Default)]
pub struct HandleDesc {
    pub plane_fds: Vec<i32>,
    pub width: u32,
    pub height: u32,
    pub format_requested: u32,
    pub allocation_size: u32,
    pub usage: u64,
    pub buffer_id: u64,
    pub plane_layouts: Vec<PlaneLayout>,
    pub pixel_stride: i32,
    pub byte_stride: i32,
}

impl BufferHandle {
    pub fn new(desc: HandleDesc) -> Self {
        Self {
            plane_fds: desc.plane_fds,
            width: desc.width,
            height: desc.height,
            format_requested: desc.format_requested,
            allocation_size: desc.allocation_size,
            usage: desc.usage,
            buffer_id: desc.buffer_id,
            plane_layouts: desc.plane_layouts,
            legacy_pixel_stride: desc.pixel_stride,
            legacy_byte_stride: desc.byte_stride,
            dynamic_hdr_offset: Mutex::new(None),
            scale_meta: Mutex::new(ScaleMeta::default()),
        }
    }

    pub(crate) fn set_hdr_offset(&self, offset: i64) {
        *self.dynamic_hdr_offset.lock().unwrap() = Some(offset);
    }

    pub(crate) fn hdr_offset(&self) -> Option<i64> {
        *self.dynamic_hdr_offset.lock().unwrap()
    }

    pub(crate) fn lock_scale_meta(&self) -> MutexGuard<'_, ScaleMeta> {
        self.scale_meta.lock().unwrap()
    }
}

/// Scoped view over a buffer's writable scaling metadata. Unmap happens on
/// drop, on every exit path; the caller must not retain the pointer beyond
/// the guard.
pub struct ScaleMetaGuard<'a> {
    inner: MutexGuard<'a, ScaleMeta>,
}

impl std::ops::Deref for ScaleMetaGuard<'_> {
    type Target = ScaleMeta;

    fn deref(&self) -> &ScaleMeta {
        &self.inner
    }
}

impl std::ops::DerefMut for ScaleMetaGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScaleMeta {
        &mut self.inner
    }
}

impl<'a> ScaleMetaGuard<'a> {
    fn new(inner: MutexGuard<'a, ScaleMeta>) -> Self {
        Self { inner }
    }
}

/// The facade. Constructed once per component from the gralloc major
/// version reported by the allocator HAL.
pub enum GrallocOps {
    V4(Gralloc4),
    Origin(GrallocOrigin),
}

impl GrallocOps {
    pub fn new(gralloc_major_version: u32) -> Self {
        if gralloc_major_version >= 4 {
            GrallocOps::V4(Gralloc4::new())
        } else {
            GrallocOps::Origin(GrallocOrigin::new())
        }
    }

    /// The first plane's dmabuf fd, or -1.
    pub fn get_share_fd(&self, handle: &BufferHandle) -> i32 {
        match self {
            GrallocOps::V4(b) => b.get_share_fd(handle),
            GrallocOps::Origin(b) => b.get_share_fd(handle),
        }
    }

    pub fn get_width(&self, handle: &BufferHandle) -> i32 {
        match self {
            GrallocOps::V4(b) => b.get_width(handle),
            GrallocOps::Origin(b) => b.get_width(handle),
        }
    }

    pub fn get_height(&self, handle: &BufferHandle) -> i32 {
        match self {
            GrallocOps::V4(b) => b.get_height(handle),
            GrallocOps::Origin(b) => b.get_height(handle),
        }
    }

    pub fn get_format_requested(&self, handle: &BufferHandle) -> i32 {
        match self {
            GrallocOps::V4(b) => b.get_format_requested(handle),
            GrallocOps::Origin(b) => b.get_format_requested(handle),
        }
    }

    pub fn get_allocation_size(&self, handle: &BufferHandle) -> i32 {
        match self {
            GrallocOps::V4(b) => b.get_allocation_size(handle),
            GrallocOps::Origin(b) => b.get_allocation_size(handle),
        }
    }

    pub fn get_pixel_stride(&self, handle: &BufferHandle) -> i32 {
        match self {
            GrallocOps::V4(b) => b.get_pixel_stride(handle),
            GrallocOps::Origin(b) => b.get_pixel_stride(handle),
        }
    }

    pub fn get_byte_stride(&self, handle: &BufferHandle) -> i32 {
        match self {
            GrallocOps::V4(b) => b.get_byte_stride(handle),
            GrallocOps::Origin(b) => b.get_byte_stride(handle),
        }
    }

    /// The usage the buffer was allocated with, or 0.
    pub fn get_usage(&self, handle: &BufferHandle) -> u64 {
        match self {
            GrallocOps::V4(b) => b.get_usage(handle),
            GrallocOps::Origin(b) => b.get_usage(handle),
        }
    }

    /// A buffer id stable for the lifetime of the backing dmabuf, or 0.
    pub fn get_buffer_id(&self, handle: &BufferHandle) -> u64 {
        match self {
            GrallocOps::V4(b) => b.get_buffer_id(handle),
            GrallocOps::Origin(b) => b.get_buffer_id(handle),
        }
    }

    /// Stores the byte offset of the per-frame HDR dynamic metadata inside
    /// the buffer payload, under the vendor metadata key.
    pub fn set_dynamic_hdr_meta(&self, handle: &BufferHandle, offset: i64) -> C2Result<()> {
        match self {
            GrallocOps::V4(b) => b.set_dynamic_hdr_meta(handle, offset),
            GrallocOps::Origin(b) => b.set_dynamic_hdr_meta(handle, offset),
        }
    }

    pub fn get_dynamic_hdr_meta(&self, handle: &BufferHandle) -> C2Result<i64> {
        match self {
            GrallocOps::V4(b) => b.get_dynamic_hdr_meta(handle),
            GrallocOps::Origin(b) => b.get_dynamic_hdr_meta(handle),
        }
    }

    /// Scoped acquisition of the writable scaling metadata. The v4 backend
    /// does not implement this and returns [`C2Error::Omitted`]; callers
    /// that rely on scaling must tolerate that.
    pub fn map_scale_meta<'a>(&self, handle: &'a BufferHandle) -> C2Result<ScaleMetaGuard<'a>> {
        match self {
            GrallocOps::V4(_) => Err(C2Error::Omitted),
            GrallocOps::Origin(_) => Ok(ScaleMetaGuard::new(handle.lock_scale_meta())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::PixelFormat;

    pub(crate) fn nv12_handle(buffer_id: u64, width: u32, height: u32) -> BufferHandle {
        let stride = (width + 15) & !15;
        BufferHandle::new(HandleDesc {
            plane_fds: vec![40 + buffer_id as i32],
            width,
            height,
            format_requested: PixelFormat::Nv12 as u32,
            allocation_size: stride * height * 3 / 2,
            usage: 0x300,
            buffer_id,
            plane_layouts: vec![
                PlaneLayout {
                    offset: 0,
                    byte_stride: stride as i64,
                    width_in_samples: stride as i64,
                    total_size: (stride * height) as u64,
                },
                PlaneLayout {
                    offset: (stride * height) as u64,
                    byte_stride: stride as i64,
                    width_in_samples: (stride / 2) as i64,
                    total_size: (stride * height / 2) as u64,
                },
            ],
            pixel_stride: stride as i32,
            byte_stride: stride as i32,
        })
    }

    #[test]
    fn version_selects_backend() {
        assert!(matches!(GrallocOps::new(4), GrallocOps::V4(_)));
        assert!(matches!(GrallocOps::new(3), GrallocOps::Origin(_)));
    }

    #[test]
    fn scalar_getters_delegate() {
        let handle = nv12_handle(7, 1280, 720);
        for ops in [GrallocOps::new(4), GrallocOps::new(3)] {
            assert_eq!(ops.get_share_fd(&handle), 47);
            assert_eq!(ops.get_width(&handle), 1280);
            assert_eq!(ops.get_height(&handle), 720);
            assert_eq!(ops.get_buffer_id(&handle), 7);
            assert_eq!(ops.get_usage(&handle), 0x300);
        }
    }

    #[test]
    fn hdr_meta_round_trips() {
        let handle = nv12_handle(1, 640, 480);
        let ops = GrallocOps::new(4);
        assert_eq!(ops.get_dynamic_hdr_meta(&handle), Err(C2Error::NotFound));
        ops.set_dynamic_hdr_meta(&handle, 0x1000).unwrap();
        assert_eq!(ops.get_dynamic_hdr_meta(&handle), Ok(0x1000));
    }

    #[test]
    fn scale_meta_guard_releases_on_drop() {
        let handle = nv12_handle(2, 640, 480);
        let ops = GrallocOps::new(3);
        {
            let mut meta = ops.map_scale_meta(&handle).unwrap();
            meta.request_mask = SCALE_REQUEST_THUMBNAIL;
        }
        // A second map after the guard dropped must not deadlock.
        let meta = ops.map_scale_meta(&handle).unwrap();
        assert_eq!(meta.request_mask, SCALE_REQUEST_THUMBNAIL);
    }

    #[test]
    fn v4_scale_meta_is_unimplemented() {
        let handle = nv12_handle(3, 640, 480);
        let ops = GrallocOps::new(4);
        assert!(matches!(ops.map_scale_meta(&handle), Err(C2Error::Omitted)));
    }
}
