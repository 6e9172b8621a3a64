// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Decode component worker.
//!
//! The worker owns a decode engine context and a set of graphics blocks
//! committed to the engine's external buffer group. Input works are sent as
//! packets; output frames come back asynchronously, keyed by the buffer id
//! of the block they landed in. Works are always returned to the host in
//! submission order, whatever order the engine finishes them in.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::ops::ControlFlow;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;

use crate::component::BlockPool;
use crate::component::DrainMode;
use crate::component::GraphicBlock;
use crate::component::OutputFrame;
use crate::component::PipelineState;
use crate::component::PipelineWorker;
use crate::component::StreamFormat;
use crate::component::Work;
use crate::component::WorkInput;
use crate::component::WorkOutput;
use crate::component::WorkStatus;
use crate::component::WorkerContext;
use crate::component::FLAG_CSD;
use crate::component::FLAG_DROP;
use crate::component::FLAG_EOS;
use crate::config::ConfigInterface;
use crate::config::USAGE_CPU_READ;
use crate::config::USAGE_READ_PROTECTED;
use crate::dump::DumpNode;
use crate::dump::DumpStateService;
use crate::dump::FLAG_DUMP_INPUT;
use crate::dump::FLAG_LOG_FPS;
use crate::error::C2Error;
use crate::error::C2Result;
use crate::gralloc::GrallocOps;
use crate::gralloc::SCALE_REQUEST_THUMBNAIL;
use crate::mpi::FrameInfo;
use crate::mpi::MpiBackend;
use crate::mpi::MpiDecoder;
use crate::mpi::MpiError;
use crate::mpi::MpiFrame;
use crate::mpi::Packet;
use crate::properties;
use crate::CodingType;
use crate::ColorAspects;
use crate::PixelFormat;
use crate::Resolution;

const FRAME_READY_TOKEN: u64 = 1;
const JOB_TOKEN: u64 = 2;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Engine input timeout pushed down at init.
const INPUT_TIMEOUT_MS: u32 = 100;
const INPUT_TIMEOUT_PERF_MS: u32 = 10;
/// Consecutive engine input timeouts tolerated before the stream is
/// declared dead.
const SEND_TIMEOUT_LIMIT: u32 = 50;
/// Retries while the engine input queue stays full.
const SEND_FULL_LIMIT: u32 = 1000;
/// Upper bound on frames dequeued per wakeup, so a fast engine cannot
/// starve the input side.
const POLL_BATCH: usize = 16;
/// Blocks committed beyond the engine's reorder delay, covering the frames
/// in transit to the display.
const SMOOTHNESS_FRAMES: u32 = 4;

/// Reorder depth floor per coding; the engine misbehaves below these.
fn min_output_delay(coding: CodingType) -> u32 {
    match coding {
        CodingType::Avc | CodingType::Hevc | CodingType::Av1 | CodingType::Avs2 => 4,
        CodingType::Vp9 => 4,
        _ => 2,
    }
}

fn map_mpi_err(err: MpiError) -> C2Error {
    match err {
        MpiError::BufferFull | MpiError::InputTimeout => C2Error::TimedOut,
        MpiError::NoMemory => C2Error::NoMemory,
        MpiError::Corrupted | MpiError::Fatal(_) => C2Error::Corrupted,
    }
}

#[derive(Clone)]
pub(crate) struct DecoderOptions {
    pub name: String,
    pub coding: CodingType,
    pub secure: bool,
    pub mpi: Arc<dyn MpiBackend>,
    pub gralloc: Arc<GrallocOps>,
    pub interface: Arc<Mutex<ConfigInterface>>,
    pub pool: Arc<Mutex<dyn BlockPool>>,
    pub tunneled: bool,
}

/// Output attached to a finished frame index, waiting for its work to
/// reach the front of the submission queue.
struct DecodedOut {
    output: WorkOutput,
    extra_flags: u32,
    status: WorkStatus,
}

pub(crate) struct DecoderWorker {
    ctx: WorkerContext,
    gralloc: Arc<GrallocOps>,
    interface: Arc<Mutex<ConfigInterface>>,
    pool: Arc<Mutex<dyn BlockPool>>,
    mpi: Box<dyn MpiDecoder>,
    frame_ready: File,
    dump: Arc<DumpNode>,
    dump_service: Arc<DumpStateService>,

    output_delay: u32,
    /// Blocks the engine group should hold; set on info-change.
    target_depth: u32,
    usage: u64,
    /// Fbc output policy: 0 never, 1 forced, 2 follow the engine.
    fbc_mode: u32,
    stream_info: Option<FrameInfo>,
    last_aspects: ColorAspects,

    /// Engine-owned blocks by buffer id. A block is in exactly one place:
    /// here, in a completed output, or with the host.
    committed: HashMap<u64, GraphicBlock>,
    /// Works sent to the engine, in submission order.
    in_flight: VecDeque<Work>,
    completed: BTreeMap<u64, DecodedOut>,
    /// Work to finish with FLAG_EOS once the engine reports drained.
    eos_work: Option<Work>,
    /// The engine reported drained; the EOS work still waits for every
    /// in-flight work ahead of it to be emitted.
    engine_drained: bool,
    drop_pts: Vec<u64>,

    fps_frames: u32,
    fps_window: Instant,
}

impl DecoderWorker {
    pub(crate) fn new(ctx: WorkerContext, options: DecoderOptions) -> C2Result<Self> {
        let mut mpi = options
            .mpi
            .create_decoder(options.coding, options.secure)
            .map_err(map_mpi_err)?;

        let timeout_ms = if properties::bool_prop(properties::PERF_PIN) {
            INPUT_TIMEOUT_PERF_MS
        } else {
            INPUT_TIMEOUT_MS
        };
        mpi.set_input_timeout(timeout_ms);

        let interface = options.interface;
        let (host_delay, low_memory, scaling, fbc_mode) = {
            let iface = interface.lock().unwrap();
            (iface.output_delay(), iface.low_memory(), iface.scaling_mode(), iface.fbc_mode())
        };
        let min_delay = min_output_delay(options.coding);
        // Low-memory playback trades reorder smoothness for footprint.
        let low_memory = low_memory || properties::bool_prop(properties::LOW_MEMORY);
        let output_delay = if low_memory { min_delay } else { host_delay.max(min_delay) };
        mpi.set_output_delay(output_delay);

        if scaling != 0 || properties::bool_prop(properties::SCALE_ENABLE) {
            mpi.enable_thumbnail(true);
        }

        let frame_ready = mpi
            .frame_ready_fd()
            .try_clone_to_owned()
            .map(File::from)
            .map_err(|err| {
                log::error!("{}: cannot clone frame-ready fd: {err}", options.name);
                C2Error::Corrupted
            })?;

        let dump_service = DumpStateService::get();
        let dump = dump_service.register(&options.name);

        // Secure and tunneled outputs are never mapped by the host.
        let usage = if options.secure {
            USAGE_READ_PROTECTED
        } else if options.tunneled {
            0
        } else {
            USAGE_CPU_READ
        };

        Ok(Self {
            ctx,
            gralloc: options.gralloc,
            interface,
            pool: options.pool,
            mpi,
            frame_ready,
            dump,
            dump_service,
            output_delay,
            target_depth: 0,
            usage,
            fbc_mode,
            stream_info: None,
            last_aspects: ColorAspects::default(),
            committed: HashMap::new(),
            in_flight: VecDeque::new(),
            completed: BTreeMap::new(),
            eos_work: None,
            engine_drained: false,
            drop_pts: Vec::new(),
            fps_frames: 0,
            fps_window: Instant::now(),
        })
    }

    fn is_running(&self) -> bool {
        *self.ctx.state.0.lock().expect("could not lock pipeline state") == PipelineState::Running
    }

    fn emit(&self, work: Work) {
        (*self.ctx.listener.work_done.lock().unwrap())(work);
    }

    /// Marks the component dead. Every in-flight work goes back Cancelled
    /// so block ownership returns to the host.
    fn set_error(&mut self) -> ControlFlow<()> {
        self.cancel_all();
        {
            let (state_lock, state_cvar) = &*self.ctx.state;
            *state_lock.lock().expect("could not lock pipeline state") = PipelineState::Error;
            state_cvar.notify_one();
        }
        (*self.ctx.listener.error.lock().unwrap())(C2Error::SignalledError);
        ControlFlow::Break(())
    }

    fn cancel_all(&mut self) {
        self.completed.clear();
        self.engine_drained = false;
        let abandoned: Vec<Work> =
            self.in_flight.drain(..).chain(self.eos_work.take()).collect();
        for mut work in abandoned {
            work.status = WorkStatus::Cancelled;
            work.output = WorkOutput::Empty;
            self.emit(work);
        }
    }

    fn drain_frame_ready(&mut self) {
        let mut buf = [0u8; 8];
        // The fd is non-blocking; stop at WouldBlock.
        while self.frame_ready.read(&mut buf).is_ok_and(|n| n > 0) {}
    }

    fn service_queue(&mut self) -> ControlFlow<()> {
        loop {
            let Some(work) = self.ctx.work_queue.lock().unwrap().pop_front() else {
                return ControlFlow::Continue(());
            };
            match work.get_drain() {
                DrainMode::SyntheticDrain => self.handle_flush(),
                DrainMode::EosDrain => {
                    self.begin_drain(Work { flags: FLAG_EOS, ..Default::default() })?
                }
                DrainMode::NoDrain => self.handle_work(work)?,
            }
        }
    }

    fn handle_work(&mut self, mut work: Work) -> ControlFlow<()> {
        self.drop_pts.extend(self.interface.lock().unwrap().take_pending_drops());
        self.dump.record_input();

        let data = match std::mem::take(&mut work.input) {
            WorkInput::Bitstream(data) => data,
            WorkInput::Empty => Vec::new(),
            WorkInput::Graphic(_) => {
                log::error!("graphic input on a decode component");
                work.status = WorkStatus::Corrupted;
                self.emit(work);
                return ControlFlow::Continue(());
            }
        };

        if self.dump_service.flags() & FLAG_DUMP_INPUT != 0 {
            log::debug!(
                "input work {} pts {} bytes {}",
                work.frame_index,
                work.timestamp_us,
                data.len()
            );
        }

        if work.flags & FLAG_CSD != 0 {
            if let Err(err) = self.mpi.set_extradata(&data) {
                log::error!("set_extradata failed: {err}");
                return self.set_error();
            }
            // Codec-specific data produces no frame; finish it right away.
            self.emit(work);
            return ControlFlow::Continue(());
        }

        if data.is_empty() && work.flags & FLAG_EOS != 0 {
            return self.begin_drain(work);
        }

        let packet = Packet {
            data,
            pts_us: work.timestamp_us,
            frame_index: work.frame_index,
            eos: work.flags & FLAG_EOS != 0,
        };
        // Tracked before the send so a failed send still returns the work.
        self.in_flight.push_back(work);
        self.send_with_retry(&packet)
    }

    fn send_with_retry(&mut self, packet: &Packet) -> ControlFlow<()> {
        let mut timeouts = 0;
        let mut full = 0;
        loop {
            if !self.is_running() {
                return ControlFlow::Break(());
            }
            match self.mpi.send_packet(packet) {
                Ok(()) => return ControlFlow::Continue(()),
                Err(MpiError::BufferFull) => {
                    full += 1;
                    if full > SEND_FULL_LIMIT {
                        log::error!("engine input stayed full for {full} attempts");
                        return self.set_error();
                    }
                    // Make room by consuming output before retrying.
                    self.poll_outputs()?;
                    std::thread::sleep(Duration::from_millis(3));
                }
                Err(MpiError::InputTimeout) => {
                    timeouts += 1;
                    if timeouts > SEND_TIMEOUT_LIMIT {
                        log::error!("engine input timed out {timeouts} times");
                        return self.set_error();
                    }
                    self.poll_outputs()?;
                }
                Err(err) => {
                    log::error!("send_packet failed: {err}");
                    return self.set_error();
                }
            }
        }
    }

    /// Sends the end-of-stream marker and parks `work` until the engine
    /// reports fully drained.
    fn begin_drain(&mut self, work: Work) -> ControlFlow<()> {
        self.eos_work = Some(work);
        let packet = Packet { eos: true, ..Default::default() };
        self.send_with_retry(&packet)
    }

    fn handle_flush(&mut self) {
        self.mpi.flush();
        self.drop_pts.clear();
        self.engine_drained = false;
        // Blocks held by not-yet-emitted outputs go back to the pool here,
        // and the engine's group is torn down with them; refill() rebuilds
        // it to target depth on the next tick.
        self.completed.clear();
        self.mpi.release_buffers();
        self.committed.clear();
        let abandoned: Vec<Work> =
            self.in_flight.drain(..).chain(self.eos_work.take()).collect();
        for mut work in abandoned {
            work.status = WorkStatus::Cancelled;
            work.output = WorkOutput::Empty;
            self.emit(work);
        }
    }

    fn poll_outputs(&mut self) -> ControlFlow<()> {
        for _ in 0..POLL_BATCH {
            match self.mpi.dequeue_frame() {
                Ok(Some(frame)) => self.handle_frame(frame)?,
                Ok(None) => break,
                Err(err) => {
                    log::error!("dequeue_frame failed: {err}");
                    return self.set_error();
                }
            }
        }
        self.emit_ready();
        // The terminal EOS work always trails the completed frames, even
        // the ones dequeued in the same batch as the drained marker.
        if self.engine_drained && self.in_flight.is_empty() {
            self.engine_drained = false;
            if let Some(mut work) = self.eos_work.take() {
                work.flags |= FLAG_EOS;
                self.emit(work);
            }
        }
        self.refill()
    }

    fn handle_frame(&mut self, frame: MpiFrame) -> ControlFlow<()> {
        if frame.info_change {
            return self.handle_info_change(frame.info);
        }
        if frame.eos {
            self.engine_drained = true;
            return ControlFlow::Continue(());
        }

        let Some(buffer_id) = frame.buffer_id else {
            log::warn!("output frame without a buffer, dropping");
            return ControlFlow::Continue(());
        };
        let Some(block) = self.committed.remove(&buffer_id) else {
            log::error!("engine returned unknown buffer {buffer_id:#x}");
            return self.set_error();
        };

        self.dump.record_output();
        self.log_fps();

        // Drop-list consumption is first-match so a pts queued twice drops
        // two frames.
        if let Some(pos) = self.drop_pts.iter().position(|pts| *pts == frame.pts_us) {
            self.drop_pts.swap_remove(pos);
            drop(block);
            self.completed.insert(
                frame.frame_index,
                DecodedOut {
                    output: WorkOutput::Empty,
                    extra_flags: FLAG_DROP,
                    status: WorkStatus::Ok,
                },
            );
            return ControlFlow::Continue(());
        }

        let aspects = if frame.info.aspects != self.last_aspects {
            self.last_aspects = frame.info.aspects;
            Some(frame.info.aspects)
        } else {
            None
        };

        if let Some(offset) = frame.hdr_meta_offset {
            if let Err(err) = self.gralloc.set_dynamic_hdr_meta(&block.handle, offset) {
                log::warn!("failed to attach HDR metadata: {err}");
            }
        }

        if let Some(thumb) = frame.thumbnail {
            // Scaling metadata lives in the buffer itself; only the legacy
            // mapper exposes it, and only when the display asked.
            if let Ok(mut meta) = self.gralloc.map_scale_meta(&block.handle) {
                if meta.request_mask == SCALE_REQUEST_THUMBNAIL {
                    meta.thumb_width = thumb.width;
                    meta.thumb_height = thumb.height;
                    meta.thumb_stride = thumb.stride;
                    meta.planes = thumb.planes;
                    meta.src_rect = frame.info.crop;
                    meta.format = frame.info.format as u32;
                    meta.reply_mask = SCALE_REQUEST_THUMBNAIL;
                }
            }
        }

        let output = OutputFrame {
            block,
            size: Resolution { width: frame.info.width, height: frame.info.height },
            crop: frame.info.crop,
            aspects,
            hdr_meta_offset: frame.hdr_meta_offset,
        };
        self.completed.insert(
            frame.frame_index,
            DecodedOut {
                output: WorkOutput::Frame(output),
                extra_flags: 0,
                status: if frame.error_frame { WorkStatus::Corrupted } else { WorkStatus::Ok },
            },
        );
        ControlFlow::Continue(())
    }

    /// Output pixel format under the configured fbc policy.
    fn output_format(&self, info: &FrameInfo) -> PixelFormat {
        match self.fbc_mode {
            1 => PixelFormat::Nv12Fbc,
            2 if info.fbc => PixelFormat::Nv12Fbc,
            _ => info.format,
        }
    }

    /// New stream geometry: the whole buffer group is rebuilt before output
    /// resumes.
    fn handle_info_change(&mut self, info: FrameInfo) -> ControlFlow<()> {
        let size = Resolution { width: info.width, height: info.height };
        log::info!(
            "info change: {}x{} stride {}x{} fbc {}",
            info.width,
            info.height,
            info.hor_stride,
            info.ver_stride,
            info.fbc
        );

        self.stream_info = Some(info);
        self.target_depth = self.output_delay + SMOOTHNESS_FRAMES;
        self.dump.set_size(size);
        self.interface.lock().unwrap().update_stream(size, info.aspects);

        (*self.ctx.listener.format_changed.lock().unwrap())(StreamFormat {
            size,
            format: self.output_format(&info),
            min_frames: self.target_depth,
        });

        self.mpi.release_buffers();
        self.committed.clear();

        if let Err(err) = self.mpi.info_change_done() {
            log::error!("info_change_done failed: {err}");
            return self.set_error();
        }
        self.refill()
    }

    /// Keeps the engine's buffer group at target depth. A pool timeout is
    /// not an error; the next loop tick tries again.
    fn refill(&mut self) -> ControlFlow<()> {
        let Some(info) = self.stream_info else {
            return ControlFlow::Continue(());
        };
        let format = self.output_format(&info);
        while (self.committed.len() as u32) < self.target_depth {
            // The pool guard must be gone before any error path below.
            let fetched = self.pool.lock().unwrap().fetch_graphic_block(
                info.hor_stride,
                info.ver_stride,
                format,
                self.usage,
            );
            let block = match fetched {
                Ok(block) => block,
                Err(C2Error::TimedOut) => break,
                Err(err) => {
                    log::error!("block pool failed: {err}");
                    return self.set_error();
                }
            };
            let buffer_id = self.gralloc.get_buffer_id(&block.handle);
            let fd = self.gralloc.get_share_fd(&block.handle);
            let size = self.gralloc.get_allocation_size(&block.handle).max(0) as usize;
            if let Err(err) = self.mpi.register_buffer(buffer_id, fd, size) {
                log::error!("register_buffer({buffer_id:#x}) failed: {err}");
                return self.set_error();
            }
            self.committed.insert(buffer_id, block);
        }
        ControlFlow::Continue(())
    }

    /// Emits finished works, oldest first, stopping at the first work whose
    /// frame has not come back yet.
    fn emit_ready(&mut self) {
        while let Some(front) = self.in_flight.front() {
            let Some(out) = self.completed.remove(&front.frame_index) else { break };
            let mut work = self.in_flight.pop_front().unwrap();
            work.output = out.output;
            work.flags |= out.extra_flags;
            work.status = out.status;
            self.emit(work);
        }
    }

    fn log_fps(&mut self) {
        self.fps_frames += 1;
        if self.dump_service.flags() & FLAG_LOG_FPS == 0 {
            return;
        }
        let elapsed = self.fps_window.elapsed();
        if elapsed >= Duration::from_secs(1) {
            log::info!(
                "{}: {:.1} fps",
                self.dump.name(),
                self.fps_frames as f64 / elapsed.as_secs_f64()
            );
            self.fps_frames = 0;
            self.fps_window = Instant::now();
        }
    }
}

impl PipelineWorker for DecoderWorker {
    fn process_loop(&mut self) {
        let epoll = match Epoll::new(EpollCreateFlags::empty()) {
            Ok(epoll) => epoll,
            Err(err) => {
                log::error!("failed to create epoll: {err}");
                let _ = self.set_error();
                return;
            }
        };
        let added = epoll
            .add(self.frame_ready.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, FRAME_READY_TOKEN))
            .and_then(|_| {
                epoll.add(
                    self.ctx.awaiting_job_event.as_fd(),
                    EpollEvent::new(EpollFlags::EPOLLIN, JOB_TOKEN),
                )
            });
        if let Err(err) = added {
            log::error!("failed to add poll fds: {err}");
            let _ = self.set_error();
            return;
        }
        let timeout = EpollTimeout::try_from(POLL_TIMEOUT).unwrap();

        while self.is_running() {
            let mut events = [EpollEvent::empty(); 2];
            let nb_fds = match epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    log::error!("epoll wait failed: {err}");
                    let _ = self.set_error();
                    return;
                }
            };

            let mut do_jobs = false;
            for event in &events[..nb_fds] {
                match event.data() {
                    FRAME_READY_TOKEN => self.drain_frame_ready(),
                    JOB_TOKEN => {
                        let _ = self.ctx.awaiting_job_event.read();
                        do_jobs = true;
                    }
                    _ => {}
                }
            }

            // Outputs first so drained buffers are available for the jobs.
            if self.poll_outputs().is_break() {
                return;
            }
            if do_jobs && self.service_queue().is_break() {
                return;
            }
        }

        self.cancel_all();
    }
}
