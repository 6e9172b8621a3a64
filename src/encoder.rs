// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Encode component worker.
//!
//! Graphic input blocks go to the engine by dmabuf fd; CPU-rendered RGBA
//! input is first blitted into a reused NV12 scratch buffer. Coded packets
//! come back asynchronously. Rate-control parameters are re-read from the
//! interface on every input and pushed to the engine only when they
//! actually changed. The SPS/PPS header is fetched once at init and
//! published with the first output, either standalone or prepended.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::ops::ControlFlow;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;

use crate::component::DrainMode;
use crate::component::PipelineState;
use crate::component::PipelineWorker;
use crate::component::Work;
use crate::component::WorkInput;
use crate::component::WorkOutput;
use crate::component::WorkStatus;
use crate::component::WorkerContext;
use crate::component::FLAG_EOS;
use crate::component::FLAG_SYNC;
use crate::config::ConfigInterface;
use crate::dump::DumpNode;
use crate::dump::DumpStateService;
use crate::error::C2Error;
use crate::error::C2Result;
use crate::gralloc::GrallocOps;
use crate::mpi::EncodedPacket;
use crate::mpi::EncoderConfig;
use crate::mpi::EncoderInput;
use crate::mpi::MpiBackend;
use crate::mpi::MpiConverter;
use crate::mpi::MpiEncoder;
use crate::mpi::MpiError;
use crate::mpi::RoiRegion;
use crate::mpi::ScratchBuffer;
use crate::CodingType;
use crate::PixelFormat;

const PACKET_READY_TOKEN: u64 = 1;
const JOB_TOKEN: u64 = 2;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const POLL_BATCH: usize = 16;
/// Quality boost applied to a detected region of interest.
const DETECT_ROI_QUALITY: i32 = -5;

fn map_mpi_err(err: MpiError) -> C2Error {
    match err {
        MpiError::BufferFull | MpiError::InputTimeout => C2Error::TimedOut,
        MpiError::NoMemory => C2Error::NoMemory,
        MpiError::Corrupted | MpiError::Fatal(_) => C2Error::Corrupted,
    }
}

#[derive(Clone)]
pub(crate) struct EncoderOptions {
    pub name: String,
    pub coding: CodingType,
    pub mpi: Arc<dyn MpiBackend>,
    pub gralloc: Arc<GrallocOps>,
    pub interface: Arc<Mutex<ConfigInterface>>,
}

pub(crate) struct EncoderWorker {
    ctx: WorkerContext,
    gralloc: Arc<GrallocOps>,
    interface: Arc<Mutex<ConfigInterface>>,
    backend: Arc<dyn MpiBackend>,
    mpi: Box<dyn MpiEncoder>,
    /// Blitter context, built on the first input the engine cannot take
    /// directly. Owns the scratch buffer it reuses across frames.
    converter: Option<Box<dyn MpiConverter>>,
    packet_ready: File,
    dump: Arc<DumpNode>,

    /// Header bytes still owed to the host with the first output.
    pending_csd: Option<Vec<u8>>,
    last_config: EncoderConfig,

    /// Works sent to the engine, in submission order. Input blocks stay
    /// attached so the dmabuf outlives the encode.
    in_flight: VecDeque<Work>,
    completed: BTreeMap<u64, EncodedPacket>,
    eos_work: Option<Work>,
    /// The engine reported drained; the EOS work still waits for every
    /// in-flight work ahead of it.
    engine_drained: bool,
}

impl EncoderWorker {
    pub(crate) fn new(ctx: WorkerContext, options: EncoderOptions) -> C2Result<Self> {
        let mut mpi = options.mpi.create_encoder(options.coding).map_err(map_mpi_err)?;

        let last_config = Self::read_config(&options.interface);
        mpi.configure(&last_config).map_err(map_mpi_err)?;

        // Header handshake happens before any frame so a host that needs
        // codec-specific data up front is never kept waiting.
        let csd = mpi.header().map_err(map_mpi_err)?;

        let packet_ready = mpi
            .packet_ready_fd()
            .try_clone_to_owned()
            .map(File::from)
            .map_err(|err| {
                log::error!("{}: cannot clone packet-ready fd: {err}", options.name);
                C2Error::Corrupted
            })?;

        let dump = DumpStateService::get().register(&options.name);
        dump.set_size(options.interface.lock().unwrap().picture_size());

        Ok(Self {
            ctx,
            gralloc: options.gralloc,
            interface: options.interface,
            backend: options.mpi,
            mpi,
            converter: None,
            packet_ready,
            dump,
            pending_csd: Some(csd),
            last_config,
            in_flight: VecDeque::new(),
            completed: BTreeMap::new(),
            eos_work: None,
            engine_drained: false,
        })
    }

    fn read_config(interface: &Arc<Mutex<ConfigInterface>>) -> EncoderConfig {
        let iface = interface.lock().unwrap();
        let size = iface.picture_size();
        let (qp_min, qp_max) = iface.qp_bounds();
        EncoderConfig {
            width: size.width,
            height: size.height,
            bitrate_bps: iface.bitrate(),
            framerate_fps: iface.framerate(),
            intra_refresh_period: iface.intra_refresh(),
            temporal_layers: iface.temporal_layers(),
            qp_min,
            qp_max,
        }
    }

    fn is_running(&self) -> bool {
        *self.ctx.state.0.lock().expect("could not lock pipeline state") == PipelineState::Running
    }

    fn emit(&self, work: Work) {
        (*self.ctx.listener.work_done.lock().unwrap())(work);
    }

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
            work.input = WorkInput::Empty;
            self.emit(work);
        }
    }

    fn drain_packet_ready(&mut self) {
        let mut buf = [0u8; 8];
        while self.packet_ready.read(&mut buf).is_ok_and(|n| n > 0) {}
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

    /// Pushes interface state the engine must see before this frame.
    fn apply_config_tick(&mut self) -> ControlFlow<()> {
        let current = Self::read_config(&self.interface);
        if current != self.last_config {
            log::debug!("encoder reconfigure: {current:?}");
            if let Err(err) = self.mpi.configure(&current) {
                log::error!("configure failed: {err}");
                return self.set_error();
            }
            self.last_config = current;
        }
        if self.interface.lock().unwrap().take_sync_request() {
            self.mpi.request_sync_frame();
        }
        ControlFlow::Continue(())
    }

    fn handle_work(&mut self, mut work: Work) -> ControlFlow<()> {
        self.apply_config_tick()?;
        self.dump.record_input();

        let input = match &work.input {
            WorkInput::Graphic(block) => {
                let fd = self.gralloc.get_share_fd(&block.handle);
                let size = self.gralloc.get_allocation_size(&block.handle).max(0) as usize;
                // The engine takes the NV12 family directly; CPU-rendered
                // RGBA goes through the blitter first.
                let (fd, size) = if block.format == PixelFormat::Rgba8888 {
                    let width = self.gralloc.get_width(&block.handle).max(0) as u32;
                    let height = self.gralloc.get_height(&block.handle).max(0) as u32;
                    match self.convert_input(fd, block.format, width, height) {
                        Ok(scratch) => (scratch.fd, scratch.size),
                        Err(err) => {
                            log::error!("input conversion failed: {err}");
                            return self.set_error();
                        }
                    }
                } else {
                    (fd, size)
                };
                EncoderInput {
                    fd,
                    size,
                    pts_us: work.timestamp_us,
                    frame_index: work.frame_index,
                    eos: work.flags & FLAG_EOS != 0,
                }
            }
            WorkInput::Empty if work.flags & FLAG_EOS != 0 => {
                return self.begin_drain(work);
            }
            _ => {
                log::error!("encode component needs graphic input");
                work.status = WorkStatus::Corrupted;
                work.input = WorkInput::Empty;
                self.emit(work);
                return ControlFlow::Continue(());
            }
        };

        if let Some(detect) = work.detect_result {
            let regions = [RoiRegion { rect: detect.rect, quality: DETECT_ROI_QUALITY }];
            if let Err(err) = self.mpi.set_roi_regions(&regions) {
                log::warn!("set_roi_regions failed: {err}");
            }
        }

        self.in_flight.push_back(work);
        if let Err(err) = self.mpi.send_frame(&input) {
            log::error!("send_frame failed: {err}");
            return self.set_error();
        }
        ControlFlow::Continue(())
    }

    fn begin_drain(&mut self, work: Work) -> ControlFlow<()> {
        self.eos_work = Some(work);
        let input = EncoderInput { fd: -1, eos: true, ..Default::default() };
        if let Err(err) = self.mpi.send_frame(&input) {
            log::error!("send_frame(eos) failed: {err}");
            return self.set_error();
        }
        ControlFlow::Continue(())
    }

    /// Runs `fd` through the blitter, building the converter context on
    /// first use.
    fn convert_input(
        &mut self,
        fd: i32,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<ScratchBuffer, MpiError> {
        let mut converter = match self.converter.take() {
            Some(converter) => converter,
            None => self.backend.create_converter()?,
        };
        let scratch = converter.convert(fd, format, width, height);
        self.converter = Some(converter);
        scratch
    }

    fn handle_flush(&mut self) {
        self.mpi.flush();
        self.completed.clear();
        self.engine_drained = false;
        let abandoned: Vec<Work> =
            self.in_flight.drain(..).chain(self.eos_work.take()).collect();
        for mut work in abandoned {
            work.status = WorkStatus::Cancelled;
            work.input = WorkInput::Empty;
            self.emit(work);
        }
    }

    fn poll_outputs(&mut self) -> ControlFlow<()> {
        for _ in 0..POLL_BATCH {
            match self.mpi.dequeue_packet() {
                Ok(Some(packet)) if packet.eos => self.engine_drained = true,
                Ok(Some(packet)) => {
                    self.completed.insert(packet.frame_index, packet);
                }
                Ok(None) => break,
                Err(err) => {
                    log::error!("dequeue_packet failed: {err}");
                    return self.set_error();
                }
            }
        }
        self.emit_ready();
        // The terminal EOS work always trails the packets dequeued with
        // the drained marker.
        if self.engine_drained && self.in_flight.is_empty() {
            self.engine_drained = false;
            if let Some(mut work) = self.eos_work.take() {
                work.flags |= FLAG_EOS;
                work.input = WorkInput::Empty;
                self.emit(work);
            }
        }
        ControlFlow::Continue(())
    }

    fn emit_ready(&mut self) {
        while let Some(front) = self.in_flight.front() {
            let Some(packet) = self.completed.remove(&front.frame_index) else { break };
            let mut work = self.in_flight.pop_front().unwrap();
            // Returning the work releases the input block back to its pool.
            work.input = WorkInput::Empty;

            let mut data = packet.data;
            if let Some(csd) = self.pending_csd.take() {
                if self.interface.lock().unwrap().prepend_header() {
                    let mut prefixed = csd;
                    prefixed.extend_from_slice(&data);
                    data = prefixed;
                } else {
                    work.csd_output = csd;
                }
            }
            if packet.keyframe {
                work.flags |= FLAG_SYNC;
            }
            work.output = WorkOutput::Bitstream(data);
            work.status = WorkStatus::Ok;
            self.dump.record_output();
            self.emit(work);
        }
    }
}

impl PipelineWorker for EncoderWorker {
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
            .add(
                self.packet_ready.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, PACKET_READY_TOKEN),
            )
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
                    PACKET_READY_TOKEN => self.drain_packet_ready(),
                    JOB_TOKEN => {
                        let _ = self.ctx.awaiting_job_event.read();
                        do_jobs = true;
                    }
                    _ => {}
                }
            }

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentEnv;
    use crate::component::ComponentFactory;
    use crate::component::DetectResult;
    use crate::component::GraphicBlock;
    use crate::component::RkComponentFactory;
    use crate::component::WorkListener;
    use crate::config::ParamId;
    use crate::config::ParamValue;
    use crate::gralloc::tests::nv12_handle;
    use crate::mpi::fake::FakeBackend;
    use crate::mpi::fake::FakeMpiEncoder;
    use crate::registry::FullSupport;
    use crate::PixelFormat;
    use crate::Rect;
    use std::time::Instant;

    struct Harness {
        backend: Arc<FakeBackend>,
        component: crate::component::Component,
        done: Arc<Mutex<Vec<Work>>>,
        errors: Arc<Mutex<Vec<C2Error>>>,
    }

    fn harness() -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = FakeBackend::with_script(Vec::new());
        let factory = RkComponentFactory::new(
            backend.clone(),
            Arc::new(GrallocOps::new(4)),
            Arc::new(FullSupport),
        );
        let done: Arc<Mutex<Vec<Work>>> = Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<C2Error>>> = Arc::new(Mutex::new(Vec::new()));
        let (d, e) = (done.clone(), errors.clone());
        let listener = WorkListener::new(
            move |work| d.lock().unwrap().push(work),
            move |err| e.lock().unwrap().push(err),
            |_fmt| {},
        );
        let component = factory
            .create_component("c2.rk.avc.encoder", listener, ComponentEnv::default())
            .unwrap();
        Harness { backend, component, done, errors }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn graphic_work(index: u64) -> Work {
        let block =
            GraphicBlock::new(Arc::new(nv12_handle(index + 1, 640, 480)), PixelFormat::Nv12, None);
        Work::graphic(index, index * 33_333, 0, block)
    }

    fn coded_data(work: &Work) -> &[u8] {
        match &work.output {
            WorkOutput::Bitstream(data) => data,
            other => panic!("expected bitstream output, got {other:?}"),
        }
    }

    #[test]
    fn header_is_published_with_the_first_output() {
        let mut h = harness();
        h.component.start().unwrap();
        h.component.queue(vec![graphic_work(0), graphic_work(1)]).unwrap();

        wait_for(|| h.done.lock().unwrap().len() == 2);
        {
            let done = h.done.lock().unwrap();
            assert_eq!(done[0].csd_output, FakeMpiEncoder::HEADER.to_vec());
            assert!(done[1].csd_output.is_empty());
            assert!(!coded_data(&done[0]).is_empty());
            let encoders = h.backend.encoders.lock().unwrap();
            assert_eq!(encoders[0].lock().unwrap().header_requests, 1);
        }
        h.component.stop().unwrap();
    }

    #[test]
    fn prepend_mode_inlines_the_header() {
        let mut h = harness();
        h.component
            .interface()
            .lock()
            .unwrap()
            .config(vec![(ParamId::PrependHeaderMode, ParamValue::Bool(true))], false)
            .unwrap();
        h.component.start().unwrap();
        h.component.queue(vec![graphic_work(0)]).unwrap();

        wait_for(|| h.done.lock().unwrap().len() == 1);
        {
            let done = h.done.lock().unwrap();
            assert!(done[0].csd_output.is_empty());
            assert!(coded_data(&done[0]).starts_with(FakeMpiEncoder::HEADER));
        }
        h.component.stop().unwrap();
    }

    #[test]
    fn rate_control_changes_reach_the_engine_once() {
        let mut h = harness();
        h.component.start().unwrap();
        h.component.queue(vec![graphic_work(0)]).unwrap();
        wait_for(|| h.done.lock().unwrap().len() == 1);

        h.component
            .interface()
            .lock()
            .unwrap()
            .config(vec![(ParamId::Bitrate, ParamValue::U32(4_000_000))], false)
            .unwrap();
        h.component.queue(vec![graphic_work(1), graphic_work(2)]).unwrap();

        wait_for(|| h.done.lock().unwrap().len() == 3);
        {
            let encoders = h.backend.encoders.lock().unwrap();
            let state = encoders[0].lock().unwrap();
            // Initial configure plus exactly one for the bitrate change.
            assert_eq!(state.configures.len(), 2);
            assert_eq!(state.configures[1].bitrate_bps, 4_000_000);
        }
        h.component.stop().unwrap();
    }

    #[test]
    fn sync_frame_request_is_edge_triggered() {
        let mut h = harness();
        h.component.start().unwrap();
        h.component
            .interface()
            .lock()
            .unwrap()
            .config(vec![(ParamId::RequestSyncFrame, ParamValue::Bool(true))], false)
            .unwrap();
        h.component.queue(vec![graphic_work(0), graphic_work(1)]).unwrap();

        wait_for(|| h.done.lock().unwrap().len() == 2);
        {
            let done = h.done.lock().unwrap();
            assert_eq!(done[0].flags & FLAG_SYNC, FLAG_SYNC);
            assert_eq!(done[1].flags & FLAG_SYNC, 0);
            let encoders = h.backend.encoders.lock().unwrap();
            assert_eq!(encoders[0].lock().unwrap().sync_requests, 1);
        }
        h.component.stop().unwrap();
    }

    #[test]
    fn detection_results_drive_roi_and_are_forwarded() {
        let mut h = harness();
        h.component.start().unwrap();
        let mut work = graphic_work(0);
        let detect = DetectResult {
            rect: Rect { left: 10, top: 20, width: 100, height: 80 },
            label: 3,
            score: 0.9,
        };
        work.detect_result = Some(detect);
        h.component.queue(vec![work]).unwrap();

        wait_for(|| h.done.lock().unwrap().len() == 1);
        {
            let done = h.done.lock().unwrap();
            assert_eq!(done[0].detect_result, Some(detect));
            let encoders = h.backend.encoders.lock().unwrap();
            let state = encoders[0].lock().unwrap();
            assert_eq!(state.roi_calls.len(), 1);
            assert_eq!(state.roi_calls[0][0].rect, detect.rect);
        }
        h.component.stop().unwrap();
    }

    #[test]
    fn drain_emits_a_terminal_eos_work() {
        let mut h = harness();
        h.component.start().unwrap();
        h.component.queue(vec![graphic_work(0)]).unwrap();
        wait_for(|| h.done.lock().unwrap().len() == 1);
        h.component.drain().unwrap();

        wait_for(|| h.done.lock().unwrap().len() == 2);
        {
            let done = h.done.lock().unwrap();
            assert_eq!(done[1].flags & FLAG_EOS, FLAG_EOS);
            assert!(h.errors.lock().unwrap().is_empty());
        }
        h.component.stop().unwrap();
    }

    #[test]
    fn eos_follows_packets_dequeued_in_the_same_batch() {
        let mut h = harness();
        h.component.start().unwrap();
        // Frame and drain queued together: the drained marker reaches the
        // worker in the same dequeue batch as the coded packet.
        let eos = Work { frame_index: 1, flags: FLAG_EOS, ..Default::default() };
        h.component.queue(vec![graphic_work(0), eos]).unwrap();

        wait_for(|| h.done.lock().unwrap().len() == 2);
        {
            let done = h.done.lock().unwrap();
            let order: Vec<(u64, bool)> = done
                .iter()
                .map(|work| (work.frame_index, work.flags & FLAG_EOS != 0))
                .collect();
            assert_eq!(order, vec![(0, false), (1, true)]);
            assert!(!coded_data(&done[0]).is_empty());
        }
        h.component.stop().unwrap();
    }

    #[test]
    fn rgba_input_is_converted_before_encoding() {
        use crate::mpi::fake::CONVERTED_FD;

        let mut h = harness();
        h.component.start().unwrap();
        let rgba_work = |index: u64| {
            let block = GraphicBlock::new(
                Arc::new(nv12_handle(index + 1, 640, 480)),
                PixelFormat::Rgba8888,
                None,
            );
            Work::graphic(index, index * 33_333, 0, block)
        };
        h.component.queue(vec![rgba_work(0), rgba_work(1)]).unwrap();

        wait_for(|| h.done.lock().unwrap().len() == 2);
        {
            let encoders = h.backend.encoders.lock().unwrap();
            let state = encoders[0].lock().unwrap();
            // The engine only ever sees the scratch buffer's fd.
            assert_eq!(state.sent_fds, vec![CONVERTED_FD, CONVERTED_FD]);

            let converters = h.backend.converters.lock().unwrap();
            assert_eq!(converters.len(), 1);
            let converter = converters[0].lock().unwrap();
            assert_eq!(converter.conversions.len(), 2);
            assert_eq!(converter.conversions[0], (PixelFormat::Rgba8888, 640, 480));
            // The scratch buffer is allocated once and reused.
            assert_eq!(converter.scratch_allocs, 1);
        }
        h.component.stop().unwrap();
    }
}
