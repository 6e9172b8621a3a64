// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Work items, the component lifecycle state machine and the worker-thread
//! pipeline shared by the decoder and the encoder.
//!
//! The host guarantees one outstanding `process()` per component, so the
//! pipeline keeps exactly one worker thread which drains a queue of work
//! items, plus an eventfd used to wake it when work arrives or when the
//! engine reports output. Flush and stop are delivered as sentinel jobs so
//! the loop quiesces within one timeout period.

use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use thiserror::Error;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use crate::config::ConfigInterface;
use crate::error::C2Error;
use crate::error::C2Result;
use crate::gralloc::BufferHandle;
use crate::gralloc::GrallocOps;
use crate::loader::ComponentModule;
use crate::loader::ComponentTraits;
use crate::mpi::MpiBackend;
use crate::registry;
use crate::registry::ChipCapability;
use crate::registry::Kind;
use crate::ColorAspects;
use crate::PixelFormat;
use crate::Rect;
use crate::Resolution;

pub const FLAG_EOS: u32 = 1 << 0;
/// The input carries codec-specific data only, no frame payload.
pub const FLAG_CSD: u32 = 1 << 1;
/// The frame was decoded but intentionally not emitted.
pub const FLAG_DROP: u32 = 1 << 2;
/// The output is a sync frame (encoder keyframe).
pub const FLAG_SYNC: u32 = 1 << 3;

/// A graphics block fetched from the host pool. Dropping the block returns
/// the backing handle to its pool, which is how the host hands buffers back
/// to the decoder.
pub struct GraphicBlock {
    pub handle: Arc<BufferHandle>,
    pub format: PixelFormat,
    recycler: Option<Arc<dyn Fn(Arc<BufferHandle>) + Send + Sync>>,
}

impl GraphicBlock {
    pub fn new(
        handle: Arc<BufferHandle>,
        format: PixelFormat,
        recycler: Option<Arc<dyn Fn(Arc<BufferHandle>) + Send + Sync>>,
    ) -> Self {
        Self { handle, format, recycler }
    }
}

impl fmt::Debug for GraphicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicBlock")
            .field("buffer_id", &self.handle.buffer_id)
            .field("format", &self.format)
            .finish()
    }
}

impl Drop for GraphicBlock {
    fn drop(&mut self) {
        if let Some(recycler) = self.recycler.take() {
            recycler(self.handle.clone());
        }
    }
}

/// Host-provided output block pool. `fetch_graphic_block` blocks up to a
/// configured timeout; a `TIMED_OUT` outcome must be tolerated by retrying.
pub trait BlockPool: Send {
    fn fetch_graphic_block(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: u64,
    ) -> C2Result<GraphicBlock>;
}

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub enum DrainMode {
    #[default]
    NoDrain,
    /// Drain and emit a terminal EOS output.
    EosDrain,
    /// Drain coming from a flush() call; no work item is returned for it.
    SyntheticDrain,
}

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub enum WorkStatus {
    #[default]
    Ok,
    /// The engine reported stream corruption on this work; the component
    /// keeps running.
    Corrupted,
    /// The work was abandoned by a stop or reset.
    Cancelled,
}

#[derive(Debug, Default)]
pub enum WorkInput {
    #[default]
    Empty,
    Bitstream(Vec<u8>),
    Graphic(GraphicBlock),
}

/// A decoded frame attached to an output work.
#[derive(Debug)]
pub struct OutputFrame {
    pub block: GraphicBlock,
    pub size: Resolution,
    pub crop: Rect,
    /// Present only when the 4-tuple changed from the previous frame.
    pub aspects: Option<ColorAspects>,
    pub hdr_meta_offset: Option<i64>,
}

#[derive(Debug, Default)]
pub enum WorkOutput {
    #[default]
    Empty,
    Frame(OutputFrame),
    Bitstream(Vec<u8>),
}

/// Result forwarded from the optional detection sidecar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectResult {
    pub rect: Rect,
    pub label: u32,
    pub score: f32,
}

/// The unit exchanged with the host. Strictly ordered by `frame_index` per
/// stream and returned exactly once.
#[derive(Debug, Default)]
pub struct Work {
    pub frame_index: u64,
    pub timestamp_us: u64,
    pub flags: u32,
    pub input: WorkInput,
    pub output: WorkOutput,
    /// Standalone codec-specific data produced with this work (encoder
    /// header handshake).
    pub csd_output: Vec<u8>,
    pub status: WorkStatus,
    pub detect_result: Option<DetectResult>,
    pub(crate) drain: DrainMode,
}

impl Work {
    pub fn bitstream(frame_index: u64, timestamp_us: u64, flags: u32, data: Vec<u8>) -> Self {
        Self {
            frame_index,
            timestamp_us,
            flags,
            input: WorkInput::Bitstream(data),
            ..Default::default()
        }
    }

    pub fn graphic(frame_index: u64, timestamp_us: u64, flags: u32, block: GraphicBlock) -> Self {
        Self {
            frame_index,
            timestamp_us,
            flags,
            input: WorkInput::Graphic(block),
            ..Default::default()
        }
    }

    pub(crate) fn sentinel(mode: DrainMode) -> Self {
        Self { drain: mode, ..Default::default() }
    }

    pub(crate) fn get_drain(&self) -> DrainMode {
        self.drain
    }
}

/// Host-visible stream format, published on info-change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub size: Resolution,
    pub format: PixelFormat,
    /// Lower bound on pool depth for uninterrupted playback.
    pub min_frames: u32,
}

pub type WorkDoneCb = Arc<Mutex<dyn FnMut(Work) + Send>>;
pub type ErrorCb = Arc<Mutex<dyn FnMut(C2Error) + Send>>;
pub type FormatChangedCb = Arc<Mutex<dyn FnMut(StreamFormat) + Send>>;

/// Callbacks into the host.
#[derive(Clone)]
pub struct WorkListener {
    pub work_done: WorkDoneCb,
    pub error: ErrorCb,
    pub format_changed: FormatChangedCb,
}

impl WorkListener {
    pub fn new(
        work_done: impl FnMut(Work) + Send + 'static,
        error: impl FnMut(C2Error) + Send + 'static,
        format_changed: impl FnMut(StreamFormat) + Send + 'static,
    ) -> Self {
        Self {
            work_done: Arc::new(Mutex::new(work_done)),
            error: Arc::new(Mutex::new(error)),
            format_changed: Arc::new(Mutex::new(format_changed)),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PipelineState {
    Running,
    Stopping,
    Stopped,
    // On Error, stop() must be called before start() works again.
    Error,
    Released,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to create EventFd for awaiting job event: {0}")]
    AwaitingJobEventFd(nix::errno::Errno),
}

/// Everything a worker needs from the pipeline; handed to the worker
/// factory when the thread (re-)enters the running state.
#[derive(Clone)]
pub struct WorkerContext {
    pub awaiting_job_event: Arc<EventFd>,
    pub work_queue: Arc<Mutex<VecDeque<Work>>>,
    pub state: Arc<(Mutex<PipelineState>, Condvar)>,
    pub listener: WorkListener,
}

pub trait PipelineWorker: Send {
    fn process_loop(&mut self);
}

pub type WorkerFactory =
    Box<dyn Fn(WorkerContext) -> Result<Box<dyn PipelineWorker>, C2Error> + Send + 'static>;

/// One worker thread plus the queue and state shared with it. The worker
/// object itself lives inside the thread closure and is rebuilt on every
/// stopped-to-running transition, which is what releases and re-creates the
/// engine context across stop/start cycles.
pub struct ComponentPipeline {
    awaiting_job_event: Arc<EventFd>,
    error_cb: ErrorCb,
    work_queue: Arc<Mutex<VecDeque<Work>>>,
    state: Arc<(Mutex<PipelineState>, Condvar)>,
    // Joined in drop(), which only has &mut self, hence the Option dance.
    worker_thread: Option<JoinHandle<()>>,
}

impl ComponentPipeline {
    pub fn new(listener: WorkListener, factory: WorkerFactory) -> Self {
        let awaiting_job_event = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)
                .map_err(PipelineError::AwaitingJobEventFd)
                .unwrap(),
        );
        let work_queue: Arc<Mutex<VecDeque<Work>>> = Arc::new(Mutex::new(VecDeque::new()));
        let state = Arc::new((Mutex::new(PipelineState::Stopped), Condvar::new()));

        let ctx = WorkerContext {
            awaiting_job_event: awaiting_job_event.clone(),
            work_queue: work_queue.clone(),
            state: state.clone(),
            listener: listener.clone(),
        };
        let error_cb = listener.error.clone();
        let thread_error_cb = listener.error.clone();
        let thread_state = state.clone();

        let worker_thread = Some(thread::spawn(move || {
            let (state_lock, state_cvar) = &*thread_state;
            let mut state = state_lock.lock().expect("could not lock pipeline state");
            while *state != PipelineState::Released {
                if *state == PipelineState::Running {
                    // Holding the lock through the processing loop would
                    // deadlock every control call.
                    drop(state);

                    match factory(ctx.clone()) {
                        Ok(mut worker) => {
                            worker.process_loop();
                            state = state_lock.lock().expect("could not lock pipeline state");
                            if *state != PipelineState::Error {
                                *state = PipelineState::Stopped;
                            }
                            state_cvar.notify_one();
                        }
                        Err(err) => {
                            log::error!("failed to build pipeline worker: {err}");
                            state = state_lock.lock().expect("could not lock pipeline state");
                            *state = PipelineState::Error;
                            state_cvar.notify_one();
                            (*thread_error_cb.lock().unwrap())(err);
                        }
                    }
                } else {
                    // reset() after an error leaves the state at Stopping
                    // rather than Running; resolve it here.
                    if *state == PipelineState::Stopping {
                        *state = PipelineState::Stopped;
                        state_cvar.notify_one();
                    }

                    // The wait must come after the Running check: notify is
                    // unbuffered, and a start() racing thread creation
                    // would otherwise be missed.
                    state = state_cvar.wait(state).unwrap();
                }
            }
        }));

        Self { awaiting_job_event, error_cb, work_queue, state, worker_thread }
    }

    fn fail(&self, err: C2Error) -> C2Error {
        (*self.error_cb.lock().unwrap())(err);
        err
    }

    pub fn state(&self) -> PipelineState {
        *self.state.0.lock().expect("could not lock pipeline state")
    }

    /// Moves to Running and builds a fresh worker (and engine context).
    pub fn start(&mut self) -> C2Result<()> {
        let (state_lock, state_cvar) = &*self.state;
        let mut state = state_lock.lock().expect("could not lock pipeline state");
        match *state {
            PipelineState::Stopped => {
                *state = PipelineState::Running;
                state_cvar.notify_one();
                Ok(())
            }
            PipelineState::Error => Err(self.fail(C2Error::SignalledError)),
            _ => Err(self.fail(C2Error::BadState)),
        }
    }

    fn stop_internal(&mut self, is_reset: bool) -> C2Result<()> {
        let (state_lock, state_cvar) = &*self.state;
        {
            let mut state = state_lock.lock().expect("could not lock pipeline state");
            // stop() is also the call that clears an errored component.
            if !is_reset
                && *state != PipelineState::Running
                && *state != PipelineState::Error
            {
                return Err(self.fail(C2Error::BadState));
            }
            if *state == PipelineState::Released {
                return Err(self.fail(C2Error::BadState));
            }
            *state = PipelineState::Stopping;
            state_cvar.notify_one();
        }

        // Outstanding queued inputs are abandoned; the worker returns its
        // in-flight works as Cancelled on exit.
        self.work_queue.lock().unwrap().clear();
        self.awaiting_job_event.write(1).unwrap();

        let mut state = state_lock.lock().expect("could not lock pipeline state");
        while *state == PipelineState::Stopping {
            state = state_cvar.wait(state).unwrap();
        }
        Ok(())
    }

    /// Stops the worker and abandons in-flight work. After an error this is
    /// the call that clears the component back to Stopped.
    pub fn stop(&mut self) -> C2Result<()> {
        self.stop_internal(false)
    }

    /// Like stop() but valid from any state, per the reset contract.
    pub fn reset(&mut self) -> C2Result<()> {
        self.stop_internal(true)
    }

    pub fn queue(&mut self, work_items: Vec<Work>) -> C2Result<()> {
        match self.state() {
            PipelineState::Running => {}
            PipelineState::Error => return Err(self.fail(C2Error::SignalledError)),
            _ => return Err(self.fail(C2Error::BadState)),
        }

        self.work_queue.lock().unwrap().extend(work_items);
        self.awaiting_job_event.write(1).unwrap();
        Ok(())
    }

    /// Evicts not-yet-processed work and pushes a synthetic drain so the
    /// worker resets stream state. Eviction and sentinel insertion are
    /// atomic with respect to the queue.
    pub fn flush(&mut self) -> C2Result<Vec<Work>> {
        if self.state() != PipelineState::Running {
            return Err(self.fail(C2Error::BadState));
        }

        let flushed = {
            let mut work_queue = self.work_queue.lock().unwrap();
            let flushed = work_queue.drain(..).collect::<Vec<Work>>();
            work_queue.push_back(Work::sentinel(DrainMode::SyntheticDrain));
            flushed
        };
        self.awaiting_job_event.write(1).unwrap();
        Ok(flushed)
    }

    /// Signals that no further input is coming; the worker drains the
    /// engine and emits a terminal EOS work.
    pub fn drain(&mut self) -> C2Result<()> {
        if self.state() != PipelineState::Running {
            return Err(self.fail(C2Error::BadState));
        }

        self.work_queue.lock().unwrap().push_back(Work::sentinel(DrainMode::EosDrain));
        self.awaiting_job_event.write(1).unwrap();
        Ok(())
    }
}

// release() is Drop: tear down the thread and everything it owns.
impl Drop for ComponentPipeline {
    fn drop(&mut self) {
        let _ = self.reset();

        let (state_lock, state_cvar) = &*self.state;
        *state_lock.lock().expect("could not lock pipeline state") = PipelineState::Released;
        state_cvar.notify_one();
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Everything host-side a component needs at creation.
#[derive(Clone)]
pub struct ComponentEnv {
    pub pool: Option<Arc<Mutex<dyn BlockPool>>>,
    pub tunneled: bool,
}

impl Default for ComponentEnv {
    fn default() -> Self {
        Self { pool: None, tunneled: false }
    }
}

/// Factory contract of an implementation module.
pub trait ComponentFactory: Send + Sync {
    fn create_component(
        &self,
        name: &str,
        listener: WorkListener,
        env: ComponentEnv,
    ) -> C2Result<Component>;

    fn create_interface(&self, name: &str) -> C2Result<Arc<Mutex<ConfigInterface>>>;

    /// Describes a component by name without instantiating its codec.
    fn component_traits(&self, name: &str) -> C2Result<ComponentTraits>;
}

/// A named codec instance handed to the host by the store.
pub struct Component {
    traits: Arc<ComponentTraits>,
    interface: Arc<Mutex<ConfigInterface>>,
    pipeline: ComponentPipeline,
    // Keeps the implementation module (and its dynamic library) alive for
    // as long as this component exists.
    module: Option<Arc<ComponentModule>>,
}

impl Component {
    pub fn new(
        traits: Arc<ComponentTraits>,
        interface: Arc<Mutex<ConfigInterface>>,
        pipeline: ComponentPipeline,
    ) -> Self {
        Self { traits, interface, pipeline, module: None }
    }

    pub(crate) fn attach_module(&mut self, module: Arc<ComponentModule>) {
        self.module = Some(module);
    }

    pub fn traits(&self) -> &ComponentTraits {
        &self.traits
    }

    pub fn name(&self) -> &str {
        &self.traits.name
    }

    pub fn interface(&self) -> Arc<Mutex<ConfigInterface>> {
        self.interface.clone()
    }

    pub fn start(&mut self) -> C2Result<()> {
        self.pipeline.start()
    }

    pub fn stop(&mut self) -> C2Result<()> {
        self.pipeline.stop()
    }

    pub fn reset(&mut self) -> C2Result<()> {
        self.pipeline.reset()
    }

    pub fn queue(&mut self, works: Vec<Work>) -> C2Result<()> {
        self.pipeline.queue(works)
    }

    pub fn flush(&mut self) -> C2Result<Vec<Work>> {
        self.pipeline.flush()
    }

    pub fn drain(&mut self) -> C2Result<()> {
        self.pipeline.drain()
    }
}

/// The factory this crate's implementation module exports: wires component
/// names to decoder/encoder workers over the vendor engine backend.
pub struct RkComponentFactory {
    mpi: Arc<dyn MpiBackend>,
    gralloc: Arc<GrallocOps>,
    caps: Arc<dyn ChipCapability>,
}

impl RkComponentFactory {
    pub fn new(
        mpi: Arc<dyn MpiBackend>,
        gralloc: Arc<GrallocOps>,
        caps: Arc<dyn ChipCapability>,
    ) -> Self {
        Self { mpi, gralloc, caps }
    }
}

impl ComponentFactory for RkComponentFactory {
    fn create_component(
        &self,
        name: &str,
        listener: WorkListener,
        env: ComponentEnv,
    ) -> C2Result<Component> {
        let entry = registry::component_entry(name).ok_or(C2Error::NotFound)?;
        let coding = registry::coding_from_mime(entry.mime).ok_or(C2Error::NotFound)?;
        if !self.caps.supported(entry.kind, coding) {
            return Err(C2Error::Refused);
        }

        let interface = self.create_interface(name)?;
        let traits = Arc::new(ComponentTraits::for_entry(entry));

        let pipeline = match entry.kind {
            Kind::Decoder => {
                let options = crate::decoder::DecoderOptions {
                    name: entry.name.to_string(),
                    coding,
                    secure: registry::is_secure(name),
                    mpi: self.mpi.clone(),
                    gralloc: self.gralloc.clone(),
                    interface: interface.clone(),
                    pool: env.pool.clone().ok_or(C2Error::BadValue)?,
                    tunneled: env.tunneled,
                };
                ComponentPipeline::new(
                    listener,
                    Box::new(move |ctx| {
                        crate::decoder::DecoderWorker::new(ctx, options.clone())
                            .map(|w| Box::new(w) as Box<dyn PipelineWorker>)
                    }),
                )
            }
            Kind::Encoder => {
                let options = crate::encoder::EncoderOptions {
                    name: entry.name.to_string(),
                    coding,
                    mpi: self.mpi.clone(),
                    gralloc: self.gralloc.clone(),
                    interface: interface.clone(),
                };
                ComponentPipeline::new(
                    listener,
                    Box::new(move |ctx| {
                        crate::encoder::EncoderWorker::new(ctx, options.clone())
                            .map(|w| Box::new(w) as Box<dyn PipelineWorker>)
                    }),
                )
            }
        };

        Ok(Component::new(traits, interface, pipeline))
    }

    fn create_interface(&self, name: &str) -> C2Result<Arc<Mutex<ConfigInterface>>> {
        let entry = registry::component_entry(name).ok_or(C2Error::NotFound)?;
        let interface = match entry.kind {
            Kind::Decoder => ConfigInterface::for_decoder(entry.name),
            Kind::Encoder => ConfigInterface::for_encoder(entry.name),
        };
        Ok(Arc::new(Mutex::new(interface)))
    }

    fn component_traits(&self, name: &str) -> C2Result<ComponentTraits> {
        let entry = registry::component_entry(name).ok_or(C2Error::NotFound)?;
        Ok(ComponentTraits::for_entry(entry))
    }
}
