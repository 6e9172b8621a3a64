// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Legacy perform-op backend, used on devices that predate the v4 mapper.
//! Strides come straight from the fields the allocator filled at alloc time
//! instead of the per-plane layout metadata.

use crate::error::C2Error;
use crate::error::C2Result;
use crate::gralloc::BufferHandle;

pub struct GrallocOrigin;

impl GrallocOrigin {
    pub fn new() -> Self {
        Self
    }

    pub fn get_share_fd(&self, handle: &BufferHandle) -> i32 {
        match handle.plane_fds.first() {
            Some(fd) => *fd,
            None => -1,
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

    pub fn get_pixel_stride(&self, handle: &BufferHandle) -> i32 {
        if handle.legacy_pixel_stride <= 0 {
            return -1;
        }
        handle.legacy_pixel_stride
    }

    pub fn get_byte_stride(&self, handle: &BufferHandle) -> i32 {
        if handle.legacy_byte_stride <= 0 {
            return -1;
        }
        handle.legacy_byte_stride
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
    use crate::gralloc::HandleDesc;

    #[test]
    fn strides_come_from_the_legacy_fields() {
        let backend = GrallocOrigin::new();
        let handle = BufferHandle::new(HandleDesc {
            plane_fds: vec![11],
            width: 1280,
            height: 720,
            pixel_stride: 1280,
            byte_stride: 1344,
            ..Default::default()
        });
        assert_eq!(backend.get_pixel_stride(&handle), 1280);
        assert_eq!(backend.get_byte_stride(&handle), 1344);
    }

    #[test]
    fn zero_strides_report_failure() {
        let backend = GrallocOrigin::new();
        let handle = BufferHandle::new(HandleDesc::default());
        assert_eq!(backend.get_pixel_stride(&handle), -1);
        assert_eq!(backend.get_byte_stride(&handle), -1);
    }
}
