//! Drawing side of the song visualiser.
//!
//! Drawing itself is delegated to a [`RenderBackend`]; everything that turns
//! playback time into a musical position lives outside the backend so each
//! implementation only receives finished [`SongPosition`]s.

mod instance;
mod throttle;
mod worker;

use std::io::{self, IsTerminal, Write};

use serde::{Deserialize, Serialize};

use crate::config::MAX_LOOP_COUNT;
use crate::drawloop::DebugLevel;
use crate::song::Song;
use crate::tempo::SongPosition;
use crate::Result;

pub use instance::SongRenderInstance;
pub use throttle::Throttle;
pub use worker::{
    FallbackRenderer, GateTicket, MessageKind, Renderer, RendererHost, RendererMessage,
    RequestGate, WorkerRenderer,
};

/// Everything a renderer needs to rebuild its tick table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderSettings {
    pub song: Option<Song>,
    pub loop_count: u32,
}

impl RenderSettings {
    pub fn new(song: Option<Song>, loop_count: u32) -> Self {
        Self {
            song,
            loop_count: loop_count.clamp(1, MAX_LOOP_COUNT),
        }
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self::new(None, 1)
    }
}

/// Statistics returned for every drawn frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameResult {
    /// Milliseconds spent inside the renderer.
    pub render_time: f64,
    pub debug_text: Vec<String>,
}

/// Statistics returned after a settings change rebuilt the tick table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    /// Seconds of playback covered by the new table.
    pub song_length: f64,
    /// Milliseconds spent compiling the table.
    pub load_time: f64,
}

/// Per-frame context handed to a backend next to the position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub playing: bool,
    pub debug: DebugLevel,
    pub width: u32,
    pub height: u32,
}

pub trait RenderBackend: Send {
    fn name(&self) -> &'static str;

    fn resize(&mut self, width: u32, height: u32);

    fn draw(&mut self, position: &SongPosition, frame: &FrameInfo) -> Result<()>;

    /// Extra lines for the detailed debug overlay.
    fn debug_text(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Backends that can be picked by [`probe_backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Terminal,
    Headless,
}

/// Picks the richest backend the current process can drive.
pub fn probe_backend() -> BackendKind {
    if io::stdout().is_terminal() {
        BackendKind::Terminal
    } else {
        BackendKind::Headless
    }
}

pub fn create_backend(kind: BackendKind) -> Box<dyn RenderBackend> {
    match kind {
        BackendKind::Terminal => Box::new(TerminalBackend::new(io::stdout())),
        BackendKind::Headless => Box::new(HeadlessBackend::new()),
    }
}

const DEFAULT_COLUMNS: u32 = 48;

/// Draws a single status line with a bar progress meter.
#[derive(Debug)]
pub struct TerminalBackend<W> {
    out: W,
    columns: u32,
    frames: u64,
}

impl<W: Write + Send> TerminalBackend<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            columns: DEFAULT_COLUMNS,
            frames: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> RenderBackend for TerminalBackend<W> {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn resize(&mut self, width: u32, _height: u32) {
        self.columns = width.max(8);
    }

    fn draw(&mut self, position: &SongPosition, frame: &FrameInfo) -> Result<()> {
        let meter_width = self.columns as usize;
        let bar_length = f64::from(position.bar_length);
        let filled = if position.tick_in_bar.is_finite() && bar_length > 0.0 {
            (position.tick_in_bar / bar_length * meter_width as f64) as usize
        } else {
            0
        };
        let filled = filled.min(meter_width);
        let state = if frame.playing { '>' } else { '|' };
        write!(
            self.out,
            "\r{state} bar {:>4} beat {:>2} [{}{}] {:>9.2}",
            position.bar + 1,
            position.beat + 1,
            "#".repeat(filled),
            "-".repeat(meter_width - filled),
            position.tick,
        )?;
        self.out.flush()?;
        self.frames += 1;
        Ok(())
    }

    fn debug_text(&self) -> Vec<String> {
        vec![format!("Terminal frames: {}", self.frames)]
    }
}

/// Records positions without drawing anything.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    frames: u64,
    last: Option<SongPosition>,
    size: (u32, u32),
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_position(&self) -> Option<&SongPosition> {
        self.last.as_ref()
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }
}

impl RenderBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
    }

    fn draw(&mut self, position: &SongPosition, _frame: &FrameInfo) -> Result<()> {
        self.frames += 1;
        self.last = Some(*position);
        Ok(())
    }

    fn debug_text(&self) -> Vec<String> {
        let mut text = vec![format!("Headless frames: {}", self.frames)];
        if let Some(position) = &self.last {
            text.push(format!("Last tick: {:.2}", position.tick));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> FrameInfo {
        FrameInfo {
            playing: true,
            debug: DebugLevel::Off,
            width: 0,
            height: 0,
        }
    }

    #[test]
    fn terminal_backend_prints_position() {
        let mut backend = TerminalBackend::new(Vec::new());
        backend.resize(16, 1);
        let position = SongPosition {
            time: 1.0,
            tick: 24.0,
            bar: 1,
            tick_in_bar: 8.0,
            beat: 2,
            bar_length: 16,
        };
        backend.draw(&position, &frame()).unwrap();
        let text = String::from_utf8(backend.into_inner()).unwrap();
        assert!(text.contains("bar    2 beat  3"), "{text}");
        assert!(text.contains("[########--------]"), "{text}");
    }

    #[test]
    fn headless_backend_records_last_position() {
        let mut backend = HeadlessBackend::new();
        let position = SongPosition {
            tick: 5.0,
            ..Default::default()
        };
        backend.draw(&position, &frame()).unwrap();
        assert_eq!(backend.frames(), 1);
        assert_eq!(backend.last_position(), Some(&position));
        assert_eq!(backend.debug_text()[1], "Last tick: 5.00");
    }

    #[test]
    fn settings_keep_loop_count_in_range() {
        assert_eq!(RenderSettings::new(None, 0).loop_count, 1);
        assert_eq!(RenderSettings::new(None, u32::MAX).loop_count, MAX_LOOP_COUNT);
    }
}
