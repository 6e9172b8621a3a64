// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Contract with the vendor media-processing interface (MPI).
//!
//! The MPI is an opaque asynchronous codec engine: packets go in, frames
//! eventually come out of an internal pipeline thread. The components never
//! see that thread; they interact only through the queue operations below
//! plus a frame-ready eventfd used as a zero-payload wakeup.

use std::os::fd::BorrowedFd;

use thiserror::Error;

use crate::gralloc::ScalePlane;
use crate::CodingType;
use crate::ColorAspects;
use crate::PixelFormat;
use crate::Rect;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MpiError {
    /// The engine's input queue is full; back off and retry.
    #[error("input queue full")]
    BufferFull,
    /// The engine's internal input timeout elapsed; retry within a bounded
    /// deadline before escalating.
    #[error("input timeout")]
    InputTimeout,
    #[error("unrecoverable stream corruption")]
    Corrupted,
    #[error("engine allocation failed")]
    NoMemory,
    #[error("engine failure: {0}")]
    Fatal(String),
}

/// One compressed access unit plus the metadata echoed back on the matching
/// output frame.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub data: Vec<u8>,
    pub pts_us: u64,
    pub frame_index: u64,
    pub eos: bool,
}

/// Stream geometry and colour state reported with an output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub crop: Rect,
    pub format: PixelFormat,
    pub aspects: ColorAspects,
    pub fbc: bool,
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            hor_stride: 0,
            ver_stride: 0,
            crop: Rect::default(),
            format: PixelFormat::Nv12,
            aspects: ColorAspects::default(),
            fbc: false,
        }
    }
}

/// Thumbnail layout produced by in-hardware scaling, when enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub planes: [ScalePlane; 2],
}

/// An output frame dequeued from the engine.
///
/// Info-change frames carry no backing buffer: they only announce the new
/// [`FrameInfo`] and stall output until the component acknowledges with
/// [`MpiDecoder::info_change_done`].
#[derive(Debug, Clone)]
pub struct MpiFrame {
    /// Id of the registered buffer backing this frame, if any.
    pub buffer_id: Option<u64>,
    pub pts_us: u64,
    pub frame_index: u64,
    pub eos: bool,
    /// The engine decoded this frame from a corrupted access unit.
    pub error_frame: bool,
    pub info_change: bool,
    pub info: FrameInfo,
    /// Byte offset of per-frame HDR dynamic metadata inside the buffer.
    pub hdr_meta_offset: Option<i64>,
    pub thumbnail: Option<Thumbnail>,
}

/// Decode-side engine context.
pub trait MpiDecoder: Send {
    /// Input send timeout; output dequeues stay non-blocking.
    fn set_input_timeout(&mut self, timeout_ms: u32);

    /// Passes codec-specific data (e.g. SPS/PPS) as extradata ahead of the
    /// first packet.
    fn set_extradata(&mut self, csd: &[u8]) -> Result<(), MpiError>;

    /// Number of frames the engine may hold back for reordering.
    fn set_output_delay(&mut self, frames: u32);

    /// Asks the engine to additionally produce scaled thumbnails.
    fn enable_thumbnail(&mut self, enable: bool);

    fn send_packet(&mut self, packet: &Packet) -> Result<(), MpiError>;

    /// Non-blocking output dequeue; `Ok(None)` when nothing is ready.
    fn dequeue_frame(&mut self) -> Result<Option<MpiFrame>, MpiError>;

    /// Commits one graphics block into the external buffer group. The same
    /// `buffer_id` may be re-committed after the host returned the block.
    fn register_buffer(&mut self, buffer_id: u64, fd: i32, size: usize) -> Result<(), MpiError>;

    /// Drops every committed buffer from the group.
    fn release_buffers(&mut self);

    /// Acknowledges an info-change frame; output resumes afterwards.
    fn info_change_done(&mut self) -> Result<(), MpiError>;

    /// Discards queued input and output.
    fn flush(&mut self);

    /// Readable whenever an output frame may be available.
    fn frame_ready_fd(&self) -> BorrowedFd<'_>;
}

/// Rate-control and structure knobs pushed to the encode engine. Diffed by
/// value on every input tick; see the encoder component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub framerate_fps: u32,
    /// Intra-refresh period in frames; 0 disables refresh.
    pub intra_refresh_period: u32,
    pub temporal_layers: u32,
    pub qp_min: u32,
    pub qp_max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiRegion {
    pub rect: Rect,
    /// Relative quality delta for the region; negative improves quality.
    pub quality: i32,
}

/// An input frame handed to the encode engine by dmabuf fd.
#[derive(Debug, Clone, Default)]
pub struct EncoderInput {
    pub fd: i32,
    pub size: usize,
    pub pts_us: u64,
    pub frame_index: u64,
    pub eos: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    pub pts_us: u64,
    pub frame_index: u64,
    pub eos: bool,
    pub keyframe: bool,
}

/// Encode-side engine context.
pub trait MpiEncoder: Send {
    /// Returns the SPS/PPS header packet. Asked once at init, before any
    /// frame is sent.
    fn header(&mut self) -> Result<Vec<u8>, MpiError>;

    fn configure(&mut self, config: &EncoderConfig) -> Result<(), MpiError>;

    /// Edge-triggered request for a sync frame on the next input.
    fn request_sync_frame(&mut self);

    fn set_roi_regions(&mut self, regions: &[RoiRegion]) -> Result<(), MpiError>;

    fn send_frame(&mut self, frame: &EncoderInput) -> Result<(), MpiError>;

    /// Non-blocking output dequeue; `Ok(None)` when nothing is ready.
    fn dequeue_packet(&mut self) -> Result<Option<EncodedPacket>, MpiError>;

    fn flush(&mut self);

    /// Readable whenever an output packet may be available.
    fn packet_ready_fd(&self) -> BorrowedFd<'_>;
}

/// Scratch dma-buf owned by a converter context. Reused frame to frame;
/// the fd stays valid until the converter is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchBuffer {
    pub fd: i32,
    pub size: usize,
}

/// Pixel-format blitter for encoder inputs the engine cannot take
/// directly (CPU-rendered RGBA). Backed by the 2D engine, not the CPU.
pub trait MpiConverter: Send {
    /// Blits `fd` into the converter's NV12 scratch buffer and returns it.
    /// The scratch buffer is allocated on first use and grows only when a
    /// larger frame arrives.
    fn convert(
        &mut self,
        fd: i32,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<ScratchBuffer, MpiError>;
}

/// Factory for engine contexts, one per component.
pub trait MpiBackend: Send + Sync {
    fn create_decoder(
        &self,
        coding: CodingType,
        secure: bool,
    ) -> Result<Box<dyn MpiDecoder>, MpiError>;

    fn create_encoder(&self, coding: CodingType) -> Result<Box<dyn MpiEncoder>, MpiError>;

    /// Blitter context for encoder input conversion; built lazily, only
    /// when a stream actually carries RGBA input.
    fn create_converter(&self) -> Result<Box<dyn MpiConverter>, MpiError>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scriptable in-process engine used by the component tests.

    use super::*;

    use std::collections::VecDeque;
    use std::os::fd::AsFd;
    use std::sync::Arc;
    use std::sync::Mutex;

    use nix::sys::eventfd::EfdFlags;
    use nix::sys::eventfd::EventFd;

    /// What the engine should do with each non-extradata packet it is fed,
    /// in order.
    #[derive(Debug, Clone)]
    pub enum FakeStep {
        InfoChange { width: u32, height: u32 },
        Frame { corrupted: bool, hdr_offset: Option<i64>, thumbnail: bool },
    }

    impl FakeStep {
        pub fn frame() -> Self {
            FakeStep::Frame { corrupted: false, hdr_offset: None, thumbnail: false }
        }
    }

    #[derive(Debug, Default)]
    struct PendingOut {
        pts_us: u64,
        frame_index: u64,
        corrupted: bool,
        hdr_offset: Option<i64>,
        thumbnail: bool,
    }

    #[derive(Default)]
    pub struct FakeMpiState {
        script: VecDeque<FakeStep>,
        info: FrameInfo,
        awaiting_info_ack: bool,
        free_buffers: VecDeque<u64>,
        pending: VecDeque<PendingOut>,
        out: VecDeque<MpiFrame>,
        eos_queued: bool,
        eos_emitted: bool,
        pub extradata: Vec<Vec<u8>>,
        pub input_timeout_ms: u32,
        pub output_delay: u32,
        pub thumbnail_enabled: bool,
        pub flush_count: u32,
        pub release_count: u32,
        /// Fail this many send_packet calls with InputTimeout first.
        pub inject_input_timeouts: u32,
        /// Fail the next send_packet with BufferFull.
        pub inject_buffer_full: bool,
    }

    pub struct FakeMpi {
        event: Arc<EventFd>,
        state: Arc<Mutex<FakeMpiState>>,
    }

    impl FakeMpi {
        pub fn with_script(script: Vec<FakeStep>) -> (Self, Arc<Mutex<FakeMpiState>>) {
            let state = Arc::new(Mutex::new(FakeMpiState {
                script: script.into(),
                ..Default::default()
            }));
            let event =
                Arc::new(EventFd::from_flags(EfdFlags::EFD_SEMAPHORE | EfdFlags::EFD_NONBLOCK).unwrap());
            (Self { event, state: state.clone() }, state)
        }

        fn signal(&self, times: usize) {
            for _ in 0..times {
                let _ = self.event.write(1);
            }
        }

        /// Moves planned outputs into the ready queue whenever a committed
        /// buffer is free and no info-change acknowledgement is pending.
        fn pump(state: &mut FakeMpiState) -> usize {
            let mut emitted = 0;
            while !state.awaiting_info_ack {
                if state.pending.is_empty() {
                    break;
                }
                let Some(buffer_id) = state.free_buffers.pop_front() else { break };
                let pending = state.pending.pop_front().unwrap();
                state.out.push_back(MpiFrame {
                    buffer_id: Some(buffer_id),
                    pts_us: pending.pts_us,
                    frame_index: pending.frame_index,
                    eos: false,
                    error_frame: pending.corrupted,
                    info_change: false,
                    info: state.info,
                    hdr_meta_offset: pending.hdr_offset,
                    thumbnail: if pending.thumbnail {
                        Some(Thumbnail {
                            width: state.info.width / 4,
                            height: state.info.height / 4,
                            stride: state.info.hor_stride / 4,
                            planes: [
                                ScalePlane { offset: 0, byte_stride: state.info.hor_stride / 4 },
                                ScalePlane {
                                    offset: state.info.hor_stride / 4 * (state.info.height / 4),
                                    byte_stride: state.info.hor_stride / 4,
                                },
                            ],
                        })
                    } else {
                        None
                    },
                });
                emitted += 1;
            }
            if state.eos_queued && !state.eos_emitted && state.pending.is_empty() {
                state.out.push_back(MpiFrame {
                    buffer_id: None,
                    pts_us: 0,
                    frame_index: 0,
                    eos: true,
                    error_frame: false,
                    info_change: false,
                    info: state.info,
                    hdr_meta_offset: None,
                    thumbnail: None,
                });
                state.eos_emitted = true;
                emitted += 1;
            }
            emitted
        }
    }

    impl MpiDecoder for FakeMpi {
        fn set_input_timeout(&mut self, timeout_ms: u32) {
            self.state.lock().unwrap().input_timeout_ms = timeout_ms;
        }

        fn set_extradata(&mut self, csd: &[u8]) -> Result<(), MpiError> {
            self.state.lock().unwrap().extradata.push(csd.to_vec());
            Ok(())
        }

        fn set_output_delay(&mut self, frames: u32) {
            self.state.lock().unwrap().output_delay = frames;
        }

        fn enable_thumbnail(&mut self, enable: bool) {
            self.state.lock().unwrap().thumbnail_enabled = enable;
        }

        fn send_packet(&mut self, packet: &Packet) -> Result<(), MpiError> {
            let mut state = self.state.lock().unwrap();
            if state.inject_input_timeouts > 0 {
                state.inject_input_timeouts -= 1;
                return Err(MpiError::InputTimeout);
            }
            if state.inject_buffer_full {
                state.inject_buffer_full = false;
                return Err(MpiError::BufferFull);
            }

            let mut signals = 0;
            while let Some(FakeStep::InfoChange { width, height }) = state.script.front().cloned() {
                state.script.pop_front();
                let info = FrameInfo {
                    width,
                    height,
                    hor_stride: (width + 15) & !15,
                    ver_stride: (height + 15) & !15,
                    crop: Rect { left: 0, top: 0, width, height },
                    format: PixelFormat::Nv12,
                    aspects: state.info.aspects,
                    fbc: false,
                };
                state.info = info;
                state.awaiting_info_ack = true;
                state.out.push_back(MpiFrame {
                    buffer_id: None,
                    pts_us: 0,
                    frame_index: 0,
                    eos: false,
                    error_frame: false,
                    info_change: true,
                    info,
                    hdr_meta_offset: None,
                    thumbnail: None,
                });
                signals += 1;
            }

            if !packet.data.is_empty() {
                if let Some(FakeStep::Frame { corrupted, hdr_offset, thumbnail }) =
                    state.script.pop_front()
                {
                    state.pending.push_back(PendingOut {
                        pts_us: packet.pts_us,
                        frame_index: packet.frame_index,
                        corrupted,
                        hdr_offset,
                        thumbnail,
                    });
                }
            }
            if packet.eos {
                state.eos_queued = true;
            }

            signals += Self::pump(&mut state);
            drop(state);
            self.signal(signals);
            Ok(())
        }

        fn dequeue_frame(&mut self) -> Result<Option<MpiFrame>, MpiError> {
            Ok(self.state.lock().unwrap().out.pop_front())
        }

        fn register_buffer(&mut self, buffer_id: u64, _fd: i32, _size: usize) -> Result<(), MpiError> {
            let mut state = self.state.lock().unwrap();
            state.free_buffers.push_back(buffer_id);
            let signals = Self::pump(&mut state);
            drop(state);
            self.signal(signals);
            Ok(())
        }

        fn release_buffers(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.free_buffers.clear();
            state.release_count += 1;
        }

        fn info_change_done(&mut self) -> Result<(), MpiError> {
            let mut state = self.state.lock().unwrap();
            state.awaiting_info_ack = false;
            let signals = Self::pump(&mut state);
            drop(state);
            self.signal(signals);
            Ok(())
        }

        fn flush(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.pending.clear();
            state.out.clear();
            state.eos_queued = false;
            state.eos_emitted = false;
            state.flush_count += 1;
        }

        fn frame_ready_fd(&self) -> BorrowedFd<'_> {
            self.event.as_fd()
        }
    }

    #[derive(Default)]
    pub struct FakeEncoderState {
        pub configures: Vec<EncoderConfig>,
        pub roi_calls: Vec<Vec<RoiRegion>>,
        sync_requested: bool,
        pub sync_requests: u32,
        out: VecDeque<EncodedPacket>,
        eos_queued: bool,
        pub flush_count: u32,
        pub header_requests: u32,
        /// Dmabuf fd of every frame sent, in order.
        pub sent_fds: Vec<i32>,
    }

    pub struct FakeMpiEncoder {
        event: Arc<EventFd>,
        state: Arc<Mutex<FakeEncoderState>>,
    }

    impl FakeMpiEncoder {
        pub fn new() -> (Self, Arc<Mutex<FakeEncoderState>>) {
            let state = Arc::new(Mutex::new(FakeEncoderState::default()));
            let event =
                Arc::new(EventFd::from_flags(EfdFlags::EFD_SEMAPHORE | EfdFlags::EFD_NONBLOCK).unwrap());
            (Self { event, state: state.clone() }, state)
        }

        pub const HEADER: &'static [u8] =
            &[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1f, 0, 0, 0, 1, 0x68, 0xee];
    }

    impl MpiEncoder for FakeMpiEncoder {
        fn header(&mut self) -> Result<Vec<u8>, MpiError> {
            let mut state = self.state.lock().unwrap();
            state.header_requests += 1;
            Ok(Self::HEADER.to_vec())
        }

        fn configure(&mut self, config: &EncoderConfig) -> Result<(), MpiError> {
            self.state.lock().unwrap().configures.push(*config);
            Ok(())
        }

        fn request_sync_frame(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.sync_requested = true;
            state.sync_requests += 1;
        }

        fn set_roi_regions(&mut self, regions: &[RoiRegion]) -> Result<(), MpiError> {
            self.state.lock().unwrap().roi_calls.push(regions.to_vec());
            Ok(())
        }

        fn send_frame(&mut self, frame: &EncoderInput) -> Result<(), MpiError> {
            let mut state = self.state.lock().unwrap();
            if frame.eos {
                state.eos_queued = true;
            }
            if frame.fd >= 0 && frame.size > 0 {
                state.sent_fds.push(frame.fd);
                let keyframe = state.sync_requested;
                state.sync_requested = false;
                state.out.push_back(EncodedPacket {
                    data: vec![0x41; 32],
                    pts_us: frame.pts_us,
                    frame_index: frame.frame_index,
                    eos: false,
                    keyframe,
                });
                let _ = self.event.write(1);
            }
            if state.eos_queued {
                state.out.push_back(EncodedPacket { eos: true, ..Default::default() });
                state.eos_queued = false;
                let _ = self.event.write(1);
            }
            Ok(())
        }

        fn dequeue_packet(&mut self) -> Result<Option<EncodedPacket>, MpiError> {
            Ok(self.state.lock().unwrap().out.pop_front())
        }

        fn flush(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.out.clear();
            state.flush_count += 1;
        }

        fn packet_ready_fd(&self) -> BorrowedFd<'_> {
            self.event.as_fd()
        }
    }

    #[derive(Default)]
    pub struct FakeConverterState {
        /// (format, width, height) of every convert call.
        pub conversions: Vec<(PixelFormat, u32, u32)>,
        pub scratch_allocs: u32,
        scratch: Option<ScratchBuffer>,
    }

    /// Sentinel fd handed out for converted frames, distinguishable from
    /// any share fd a test handle reports.
    pub const CONVERTED_FD: i32 = 0x5ca7;

    pub struct FakeConverter {
        state: Arc<Mutex<FakeConverterState>>,
    }

    impl MpiConverter for FakeConverter {
        fn convert(
            &mut self,
            _fd: i32,
            format: PixelFormat,
            width: u32,
            height: u32,
        ) -> Result<ScratchBuffer, MpiError> {
            let mut state = self.state.lock().unwrap();
            state.conversions.push((format, width, height));
            let size = (width * height * 3 / 2) as usize;
            let needs_alloc = state.scratch.map_or(true, |scratch| scratch.size < size);
            if needs_alloc {
                state.scratch_allocs += 1;
                state.scratch = Some(ScratchBuffer { fd: CONVERTED_FD, size });
            }
            Ok(state.scratch.expect("scratch allocated above"))
        }
    }

    /// Backend handing out fakes pre-loaded with a script. Keeps the state
    /// handles so tests can assert on engine interactions afterwards.
    #[derive(Default)]
    pub struct FakeBackend {
        pub decoder_script: Mutex<Vec<FakeStep>>,
        pub decoders: Mutex<Vec<Arc<Mutex<FakeMpiState>>>>,
        pub encoders: Mutex<Vec<Arc<Mutex<FakeEncoderState>>>>,
        pub converters: Mutex<Vec<Arc<Mutex<FakeConverterState>>>>,
    }

    impl FakeBackend {
        pub fn with_script(script: Vec<FakeStep>) -> Arc<Self> {
            let backend = Self::default();
            *backend.decoder_script.lock().unwrap() = script;
            Arc::new(backend)
        }
    }

    impl MpiBackend for FakeBackend {
        fn create_decoder(
            &self,
            _coding: CodingType,
            _secure: bool,
        ) -> Result<Box<dyn MpiDecoder>, MpiError> {
            let script = self.decoder_script.lock().unwrap().clone();
            let (mpi, state) = FakeMpi::with_script(script);
            self.decoders.lock().unwrap().push(state);
            Ok(Box::new(mpi))
        }

        fn create_encoder(&self, _coding: CodingType) -> Result<Box<dyn MpiEncoder>, MpiError> {
            let (mpi, state) = FakeMpiEncoder::new();
            self.encoders.lock().unwrap().push(state);
            Ok(Box::new(mpi))
        }

        fn create_converter(&self) -> Result<Box<dyn MpiConverter>, MpiError> {
            let state = Arc::new(Mutex::new(FakeConverterState::default()));
            self.converters.lock().unwrap().push(state.clone());
            Ok(Box::new(FakeConverter { state }))
        }
    }
}
