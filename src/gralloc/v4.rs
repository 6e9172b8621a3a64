// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Metadata-based backend for gralloc major version 4 and newer.

use crate::error::C2Error;
use crate::error::C2Result;
use crate::gralloc::BufferHandle;
use crate::PixelFormat;

pub struct Gralloc4;

impl Gralloc4 {
    pub fn new() -> Self {
        Self
    }

    pub fn get_share_fd(&self, handle: &BufferHandle) -> i32 {
        match handle.plane_fds.first() {
            Some(fd) => *fd,
            None => {
                log::error!("no plane fds on handle {:#x}", handle.buffer_id);
                -1
            }
        }
    }

    pub fn get_width(&self, handle: &BufferHandle) -> i32 {
        handle.width as i32
    }

    pub fn get_height(&self, handle: &BufferHandle) -> i32 {
        handle.height as i32
    }

    pub fn get_format_requested(&self, handle: &BufferHandle) -> i32 {
        handle.format_requested as i32
    }

    pub fn get_allocation_size(&self, handle: &BufferHandle) -> i32 {
        handle.allocation_size as i32
    }

    /// Stride in samples of the first plane.
    ///
    /// For the 10-bit NV12 compact packing the plane layout is not
    /// descriptive, so the stride falls back to the buffer width.
    pub fn get_pixel_stride(&self, handle: &BufferHandle) -> i32 {
        if handle.format_requested == PixelFormat::Nv12_10bit as u32 {
            return self.get_width(handle);
        }
        match handle.plane_layouts.first() {
            Some(layout) => layout.width_in_samples as i32,
            None => -1,
        }
    }

    /// Stride in bytes of the first plane, with the same 10-bit fallback as
    /// [`Self::get_pixel_stride`]. Per-plane strides are not exposed here;
    /// multi-plane layouts report plane 0.
    pub fn get_byte_stride(&self, handle: &BufferHandle) -> i32 {
        if handle.format_requested == PixelFormat::Nv12_10bit as u32 {
            return self.get_width(handle);
        }
        if handle.plane_layouts.len() > 1 {
            log::warn!(
                "handle {:#x} has {} planes, returning plane 0 byte stride",
                handle.buffer_id,
                handle.plane_layouts.len()
            );
        }
        match handle.plane_layouts.first() {
            Some(layout) => layout.byte_stride as i32,
            None => -1,
        }
    }

    pub fn get_usage(&self, handle: &BufferHandle) -> u64 {
        handle.usage
    }

    pub fn get_buffer_id(&self, handle: &BufferHandle) -> u64 {
        handle.buffer_id
    }

    pub fn set_dynamic_hdr_meta(&self, handle: &BufferHandle, offset: i64) -> C2Result<()> {
        handle.set_hdr_offset(offset);
        Ok(())
    }

    pub fn get_dynamic_hdr_meta(&self, handle: &BufferHandle) -> C2Result<i64> {
        handle.hdr_offset().ok_or(C2Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gralloc::tests::nv12_handle;
    use crate::gralloc::BufferHandle;
    use crate::gralloc::HandleDesc;

    #[test]
    fn strides_come_from_the_plane_layout() {
        let backend = Gralloc4::new();
        let handle = nv12_handle(1, 1280, 720);
        assert_eq!(backend.get_pixel_stride(&handle), 1280);
        assert_eq!(backend.get_byte_stride(&handle), 1280);
    }

    #[test]
    fn ten_bit_nv12_falls_back_to_width() {
        let backend = Gralloc4::new();
        let mut desc = HandleDesc {
            plane_fds: vec![5],
            width: 1920,
            height: 1080,
            format_requested: PixelFormat::Nv12_10bit as u32,
            allocation_size: 1920 * 1080 * 2,
            buffer_id: 9,
            ..Default::default()
        };
        // A layout the mapper reports but which is not descriptive for the
        // compact packing.
        desc.plane_layouts = vec![crate::gralloc::PlaneLayout {
            offset: 0,
            byte_stride: 2400,
            width_in_samples: 2400,
            total_size: 2400 * 1080,
        }];
        let handle = BufferHandle::new(desc);
        assert_eq!(backend.get_pixel_stride(&handle), 1920);
        assert_eq!(backend.get_byte_stride(&handle), 1920);
    }

    #[test]
    fn missing_layout_reports_failure() {
        let backend = Gralloc4::new();
        let handle = BufferHandle::new(HandleDesc::default());
        assert_eq!(backend.get_share_fd(&handle), -1);
        assert_eq!(backend.get_pixel_stride(&handle), -1);
        assert_eq!(backend.get_byte_stride(&handle), -1);
    }
}
