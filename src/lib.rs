// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Codec2 component store and video components backed by the Rockchip MPP
//! media-processing interface.
//!
//! The store enumerates the decoder/encoder components supported by the
//! running SoC, lazily loads their implementation module and hands the host
//! per-component work pipelines. The decoder is the hard core: a packet-in /
//! frame-out state machine that shares an output graphics-buffer pool with
//! the hardware and tracks mid-stream format changes.

pub mod component;
pub mod config;
pub mod decoder;
pub mod dump;
pub mod encoder;
pub mod error;
pub mod gralloc;
pub mod loader;
pub mod mpi;
pub mod properties;
pub mod registry;
pub mod store;

use enumn::N;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn get_area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A crop rectangle inside a coded frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Output pixel formats produced by the hardware. The discriminants follow
/// the HAL pixel format numbering so gralloc metadata round-trips unchanged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum PixelFormat {
    /// CPU-rendered input the encoder must convert before the engine sees
    /// it.
    Rgba8888 = 0x1,
    Nv12 = 0x15,
    /// 10-bit NV12 with the compact Rockchip sample packing.
    Nv12_10bit = 0x17,
    /// AFBC-compressed variant, only seen when fbc output is negotiated.
    Nv12Fbc = 0x200,
}

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::Nv12
    }
}

/// Compressed stream codings the MPI knows how to handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodingType {
    Avc,
    Hevc,
    Vp9,
    Vp8,
    Mpeg2,
    Mpeg4,
    H263,
    Av1,
    Avs2,
}

/// ISO 23001-8 colour primaries indices, as reported by the MPI.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum ColorPrimaries {
    Bt709 = 1,
    Unspecified = 2,
    Bt601_625 = 5,
    Bt601_525 = 6,
    Bt2020 = 9,
}

/// ISO transfer characteristics indices.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum TransferCharacteristics {
    Bt709 = 1,
    Unspecified = 2,
    Smpte170m = 6,
    St2084 = 16,
    Hlg = 18,
}

/// ISO matrix coefficients indices.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum MatrixCoefficients {
    Bt709 = 1,
    Unspecified = 2,
    Bt601 = 6,
    Bt2020Ncl = 9,
}

/// The colour-aspect 4-tuple carried per frame.
///
/// Compared by value: the decoder pushes a reconfig to the host only when
/// the tuple actually changed from the previous frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ColorAspects {
    pub primaries: ColorPrimaries,
    pub transfer: TransferCharacteristics,
    pub matrix: MatrixCoefficients,
    pub full_range: bool,
}

impl Default for ColorAspects {
    fn default() -> Self {
        Self {
            primaries: ColorPrimaries::Unspecified,
            transfer: TransferCharacteristics::Unspecified,
            matrix: MatrixCoefficients::Unspecified,
            full_range: false,
        }
    }
}

impl ColorAspects {
    /// Builds aspects from raw ISO indices, falling back to "unspecified"
    /// for indices we do not track.
    pub fn from_iso(primaries: u8, transfer: u8, matrix: u8, full_range: bool) -> Self {
        Self {
            primaries: ColorPrimaries::n(primaries).unwrap_or(ColorPrimaries::Unspecified),
            transfer: TransferCharacteristics::n(transfer)
                .unwrap_or(TransferCharacteristics::Unspecified),
            matrix: MatrixCoefficients::n(matrix).unwrap_or(MatrixCoefficients::Unspecified),
            full_range,
        }
    }
}
