use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use super::{FrameResult, LoadResult, RenderBackend, RenderSettings, SongRenderInstance, Throttle};
use crate::drawloop::DebugLevel;
use crate::tempo::SharedTickTable;
use crate::{Result, SoundTileError};

/// Messages exchanged with a render worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RendererMessage {
    Draw {
        time: f64,
        playing: bool,
        #[serde(rename = "debugLevel")]
        debug: DebugLevel,
    },
    DrawResponse(FrameResult),
    Resize {
        width: u32,
        height: u32,
    },
    Settings {
        data: RenderSettings,
    },
    LoadResult(LoadResult),
    Stop,
}

impl RendererMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Draw { .. } => MessageKind::Draw,
            Self::DrawResponse(_) => MessageKind::DrawResponse,
            Self::Resize { .. } => MessageKind::Resize,
            Self::Settings { .. } => MessageKind::Settings,
            Self::LoadResult(_) => MessageKind::LoadResult,
            Self::Stop => MessageKind::Stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Draw,
    DrawResponse,
    Resize,
    Settings,
    LoadResult,
    Stop,
}

/// Allows one unacknowledged request per message kind.
///
/// A second request of the same kind blocks until the ticket of the first is
/// dropped; requests of different kinds proceed independently.
#[derive(Debug, Default)]
pub struct RequestGate {
    busy: Mutex<HashSet<MessageKind>>,
    released: Condvar,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, kind: MessageKind) -> Result<GateTicket<'_>> {
        let mut busy = self
            .busy
            .lock()
            .map_err(|_| SoundTileError::Poisoned("request gate"))?;
        while busy.contains(&kind) {
            busy = self
                .released
                .wait(busy)
                .map_err(|_| SoundTileError::Poisoned("request gate"))?;
        }
        busy.insert(kind);
        Ok(GateTicket { gate: self, kind })
    }

    pub fn in_flight(&self, kind: MessageKind) -> Result<bool> {
        self.busy
            .lock()
            .map(|busy| busy.contains(&kind))
            .map_err(|_| SoundTileError::Poisoned("request gate"))
    }
}

/// Held while a request is waiting for its acknowledgement.
#[derive(Debug)]
pub struct GateTicket<'a> {
    gate: &'a RequestGate,
    kind: MessageKind,
}

impl Drop for GateTicket<'_> {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.gate.busy.lock() {
            busy.remove(&self.kind);
        }
        self.gate.released.notify_all();
    }
}

/// Common surface of the threaded and in-thread renderers.
pub trait Renderer: Send + Sync {
    fn is_worker(&self) -> bool;

    fn draw(&self, time: f64, playing: bool, debug: DebugLevel) -> Result<FrameResult>;

    fn resize(&self, width: u32, height: u32) -> Result<()>;

    fn update_data(&self, settings: RenderSettings) -> Result<LoadResult>;

    /// Table published by the renderer, readable from any thread.
    fn table(&self) -> SharedTickTable;
}

/// Runs a [`SongRenderInstance`] on a dedicated thread.
pub struct WorkerRenderer {
    requests: Sender<RendererMessage>,
    draw_responses: Receiver<FrameResult>,
    load_responses: Receiver<LoadResult>,
    gate: RequestGate,
    table: SharedTickTable,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerRenderer {
    pub fn spawn(instance: SongRenderInstance) -> Result<Self> {
        let (requests, inbox) = unbounded();
        let (draw_tx, draw_responses) = bounded(1);
        let (load_tx, load_responses) = bounded(1);
        let table = instance.table();
        let handle = thread::Builder::new()
            .name("sound-tile-render".into())
            .spawn(move || worker_loop(instance, inbox, draw_tx, load_tx))?;
        tracing::debug!("render worker started");
        Ok(Self {
            requests,
            draw_responses,
            load_responses,
            gate: RequestGate::new(),
            table,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Asks the worker to exit once queued requests are answered, then waits
    /// for it.
    pub fn stop(&self) -> Result<()> {
        let _ = self.requests.send(RendererMessage::Stop);
        let handle = self
            .handle
            .lock()
            .map_err(|_| SoundTileError::Poisoned("render worker handle"))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| SoundTileError::Worker("render worker panicked".into()))?;
            tracing::debug!("render worker stopped");
        }
        Ok(())
    }

    fn send(&self, message: RendererMessage) -> Result<()> {
        self.requests
            .send(message)
            .map_err(|_| SoundTileError::Worker("render worker is gone".into()))
    }
}

impl Renderer for WorkerRenderer {
    fn is_worker(&self) -> bool {
        true
    }

    fn draw(&self, time: f64, playing: bool, debug: DebugLevel) -> Result<FrameResult> {
        let _ticket = self.gate.acquire(MessageKind::Draw)?;
        self.send(RendererMessage::Draw {
            time,
            playing,
            debug,
        })?;
        self.draw_responses
            .recv()
            .map_err(|_| SoundTileError::Worker("render worker dropped a draw request".into()))
    }

    fn resize(&self, width: u32, height: u32) -> Result<()> {
        self.send(RendererMessage::Resize { width, height })
    }

    fn update_data(&self, settings: RenderSettings) -> Result<LoadResult> {
        let _ticket = self.gate.acquire(MessageKind::Settings)?;
        self.send(RendererMessage::Settings { data: settings })?;
        self.load_responses
            .recv()
            .map_err(|_| SoundTileError::Worker("render worker dropped a settings request".into()))
    }

    fn table(&self) -> SharedTickTable {
        self.table.clone()
    }
}

impl Drop for WorkerRenderer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(%err, "render worker did not shut down cleanly");
        }
    }
}

impl std::fmt::Debug for WorkerRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRenderer")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

fn worker_loop(
    mut instance: SongRenderInstance,
    inbox: Receiver<RendererMessage>,
    draw_responses: Sender<FrameResult>,
    load_responses: Sender<LoadResult>,
) {
    for message in inbox.iter() {
        let delivered = match message {
            RendererMessage::Draw {
                time,
                playing,
                debug,
            } => match instance.draw(time, playing, debug) {
                Ok(frame) => draw_responses.send(frame).is_ok(),
                Err(err) => {
                    tracing::error!(%err, "render worker failed to draw");
                    false
                }
            },
            RendererMessage::Resize { width, height } => {
                instance.resize(width, height);
                true
            }
            RendererMessage::Settings { data } => match instance.update_data(data) {
                Ok(load) => load_responses.send(load).is_ok(),
                Err(err) => {
                    tracing::error!(%err, "render worker failed to load settings");
                    false
                }
            },
            RendererMessage::Stop => false,
            RendererMessage::DrawResponse(_) | RendererMessage::LoadResult(_) => {
                tracing::warn!("render worker ignored a response message");
                true
            }
        };
        if !delivered {
            break;
        }
    }
}

/// Runs a [`SongRenderInstance`] on the calling thread.
#[derive(Debug)]
pub struct FallbackRenderer {
    instance: Mutex<SongRenderInstance>,
    table: SharedTickTable,
}

impl FallbackRenderer {
    pub fn new(instance: SongRenderInstance) -> Self {
        let table = instance.table();
        Self {
            instance: Mutex::new(instance),
            table,
        }
    }

    fn with_instance<T>(&self, f: impl FnOnce(&mut SongRenderInstance) -> Result<T>) -> Result<T> {
        let mut instance = self
            .instance
            .lock()
            .map_err(|_| SoundTileError::Poisoned("render instance"))?;
        f(&mut instance)
    }
}

impl Renderer for FallbackRenderer {
    fn is_worker(&self) -> bool {
        false
    }

    fn draw(&self, time: f64, playing: bool, debug: DebugLevel) -> Result<FrameResult> {
        self.with_instance(|instance| instance.draw(time, playing, debug))
    }

    fn resize(&self, width: u32, height: u32) -> Result<()> {
        self.with_instance(|instance| {
            instance.resize(width, height);
            Ok(())
        })
    }

    fn update_data(&self, settings: RenderSettings) -> Result<LoadResult> {
        self.with_instance(|instance| instance.update_data(settings))
    }

    fn table(&self) -> SharedTickTable {
        self.table.clone()
    }
}

type BackendFactory = Box<dyn Fn() -> Box<dyn RenderBackend>>;

/// Front end used by the draw loop.
///
/// Settings edits are throttled so only the newest pending edit is compiled.
/// If the worker fails, it is replaced for good by an in-thread renderer
/// loaded with the latest settings.
pub struct RendererHost {
    renderer: Box<dyn Renderer>,
    make_backend: BackendFactory,
    settings: RenderSettings,
    throttle: Throttle<RenderSettings>,
    size: Option<(u32, u32)>,
    last_load: LoadResult,
    last_frame: FrameResult,
}

impl RendererHost {
    pub fn new(
        settings: RenderSettings,
        use_worker: bool,
        throttle: Duration,
        make_backend: impl Fn() -> Box<dyn RenderBackend> + 'static,
    ) -> Result<Self> {
        let make_backend: BackendFactory = Box::new(make_backend);
        let instance = SongRenderInstance::new(make_backend());
        let renderer: Box<dyn Renderer> = if use_worker {
            match WorkerRenderer::spawn(instance) {
                Ok(worker) => Box::new(worker),
                Err(err) => {
                    tracing::warn!(%err, "render worker unavailable, drawing in-thread");
                    Box::new(FallbackRenderer::new(SongRenderInstance::new(make_backend())))
                }
            }
        } else {
            Box::new(FallbackRenderer::new(instance))
        };
        let mut host = Self {
            renderer,
            make_backend,
            settings: settings.clone(),
            throttle: Throttle::new(throttle),
            size: None,
            last_load: LoadResult::default(),
            last_frame: FrameResult::default(),
        };
        host.set_settings(settings, Instant::now())?;
        Ok(host)
    }

    pub fn is_worker(&self) -> bool {
        self.renderer.is_worker()
    }

    pub fn has_song(&self) -> bool {
        self.settings.song.is_some()
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn load_result(&self) -> LoadResult {
        self.last_load
    }

    pub fn frame_result(&self) -> &FrameResult {
        &self.last_frame
    }

    pub fn table(&self) -> SharedTickTable {
        self.renderer.table()
    }

    /// Records an edit; it is compiled now or once the throttle window ends.
    pub fn set_settings(
        &mut self,
        settings: RenderSettings,
        now: Instant,
    ) -> Result<Option<LoadResult>> {
        self.settings = settings.clone();
        match self.throttle.offer(settings, now) {
            Some(settings) => self.apply(settings).map(Some),
            None => Ok(None),
        }
    }

    /// Compiles a held-back edit once its window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Result<Option<LoadResult>> {
        match self.throttle.poll(now) {
            Some(settings) => self.apply(settings).map(Some),
            None => Ok(None),
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.size = Some((width, height));
        match self.renderer.resize(width, height) {
            Err(err) if self.renderer.is_worker() => self.fall_back(err),
            other => other,
        }
    }

    pub fn draw(&mut self, time: f64, playing: bool, debug: DebugLevel) -> Result<&FrameResult> {
        let frame = match self.renderer.draw(time, playing, debug) {
            Err(err) if self.renderer.is_worker() => {
                self.fall_back(err)?;
                self.renderer.draw(time, playing, debug)?
            }
            other => other?,
        };
        self.last_frame = frame;
        Ok(&self.last_frame)
    }

    fn apply(&mut self, settings: RenderSettings) -> Result<LoadResult> {
        let load = match self.renderer.update_data(settings) {
            Err(err) if self.renderer.is_worker() => {
                // The fallback is loaded with the latest settings already.
                self.fall_back(err)?;
                self.last_load
            }
            other => other?,
        };
        self.last_load = load;
        Ok(load)
    }

    fn fall_back(&mut self, err: SoundTileError) -> Result<()> {
        tracing::warn!(%err, "render worker failed, switching to in-thread renderer");
        let mut instance = SongRenderInstance::new((self.make_backend)());
        if let Some((width, height)) = self.size {
            instance.resize(width, height);
        }
        self.last_load = instance.update_data(self.settings.clone())?;
        self.renderer = Box::new(FallbackRenderer::new(instance));
        Ok(())
    }
}

impl std::fmt::Debug for RendererHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererHost")
            .field("is_worker", &self.renderer.is_worker())
            .field("pending", &self.throttle.has_pending())
            .field("last_load", &self.last_load)
            .finish_non_exhaustive()
    }
}
