use std::time::Instant;

use super::{FrameInfo, FrameResult, LoadResult, RenderBackend, RenderSettings};
use crate::drawloop::DebugLevel;
use crate::tempo::{build_tick_table, SharedTickTable, TickTable};
use crate::Result;

/// Owns one song's tick table and the backend that draws it.
///
/// Rendering is stateless apart from the table: the same time always yields
/// the same frame.
pub struct SongRenderInstance {
    settings: RenderSettings,
    table: SharedTickTable,
    backend: Box<dyn RenderBackend>,
    size: (u32, u32),
    pending_resize: Option<(u32, u32)>,
    last_load: LoadResult,
}

impl SongRenderInstance {
    pub fn new(backend: Box<dyn RenderBackend>) -> Self {
        Self {
            settings: RenderSettings::default(),
            table: SharedTickTable::new(TickTable::empty()),
            backend,
            size: (0, 0),
            pending_resize: None,
            last_load: LoadResult::default(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Handle to the published table; stays valid across rebuilds.
    pub fn table(&self) -> SharedTickTable {
        self.table.clone()
    }

    pub fn last_load(&self) -> LoadResult {
        self.last_load
    }

    /// Rebuilds the tick table from `settings` and publishes it.
    ///
    /// A corrupt song publishes an empty table instead of failing: the
    /// visualiser shows nothing rather than guessing.
    pub fn update_data(&mut self, settings: RenderSettings) -> Result<LoadResult> {
        let started = Instant::now();
        let table = match build_tick_table(settings.song.as_ref(), settings.loop_count.max(1)) {
            Ok(table) => table,
            Err(err) => {
                tracing::warn!(%err, "song cannot be played, rendering nothing");
                TickTable::empty()
            }
        };
        let song_length = table.song_length();
        self.table.publish(table)?;
        self.settings = settings;
        self.last_load = LoadResult {
            song_length,
            load_time: started.elapsed().as_secs_f64() * 1000.0,
        };
        tracing::debug!(
            song_length,
            load_time_ms = self.last_load.load_time,
            "tick table rebuilt"
        );
        Ok(self.last_load)
    }

    /// Applied at the start of the next draw.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.pending_resize = Some((width, height));
    }

    pub fn draw(&mut self, time: f64, playing: bool, debug: DebugLevel) -> Result<FrameResult> {
        let started = Instant::now();
        if let Some((width, height)) = self.pending_resize.take() {
            self.backend.resize(width, height);
            self.size = (width, height);
        }
        let table = self.table.load()?;
        let position = table.position(time);
        let frame = FrameInfo {
            playing,
            debug,
            width: self.size.0,
            height: self.size.1,
        };
        self.backend.draw(&position, &frame)?;

        let mut debug_text = Vec::new();
        if debug == DebugLevel::Detailed {
            debug_text.push(format!(
                "Tick: {:.2} (bar {}, beat {})",
                position.tick,
                position.bar + 1,
                position.beat + 1
            ));
            debug_text.push(format!(
                "Keyframes: {} / song length {:.2}s",
                table.keyframes().len(),
                table.song_length()
            ));
            debug_text.extend(self.backend.debug_text());
        }
        Ok(FrameResult {
            render_time: started.elapsed().as_secs_f64() * 1000.0,
            debug_text,
        })
    }
}

impl std::fmt::Debug for SongRenderInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SongRenderInstance")
            .field("backend", &self.backend.name())
            .field("loop_count", &self.settings.loop_count)
            .field("size", &self.size)
            .field("last_load", &self.last_load)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::HeadlessBackend;
    use crate::song::Song;

    fn instance() -> SongRenderInstance {
        SongRenderInstance::new(Box::new(HeadlessBackend::new()))
    }

    #[test]
    fn update_data_reports_song_length() {
        let mut instance = instance();
        let song = Song::new(4.0, 4, 4, 2);
        let load = instance
            .update_data(RenderSettings::new(Some(song), 1))
            .unwrap();
        assert_eq!(load.song_length, 8.0);
        assert!(load.load_time >= 0.0);
        assert_eq!(instance.table().load().unwrap().keyframes().len(), 2);
    }

    #[test]
    fn corrupt_song_publishes_empty_table() {
        let mut instance = instance();
        let mut song = Song::new(4.0, 4, 4, 2);
        song.tick_speed = -1.0;
        let load = instance
            .update_data(RenderSettings::new(Some(song), 1))
            .unwrap();
        assert_eq!(load.song_length, 0.0);
        assert!(instance.table().load().unwrap().is_empty());
    }

    #[test]
    fn draw_collects_text_only_when_detailed() {
        let mut instance = instance();
        instance
            .update_data(RenderSettings::new(Some(Song::new(4.0, 4, 4, 1)), 1))
            .unwrap();
        let quiet = instance.draw(2.0, true, DebugLevel::Basic).unwrap();
        assert!(quiet.debug_text.is_empty());
        let detailed = instance.draw(2.0, true, DebugLevel::Detailed).unwrap();
        assert_eq!(detailed.debug_text[0], "Tick: 8.00 (bar 1, beat 3)");
        assert!(detailed
            .debug_text
            .iter()
            .any(|line| line == "Headless frames: 2"));
    }

    #[test]
    fn resize_waits_for_next_draw() {
        let mut instance = instance();
        instance.resize(640, 480);
        assert_eq!(instance.size, (0, 0));
        instance.draw(0.0, false, DebugLevel::Off).unwrap();
        assert_eq!(instance.size, (640, 480));
    }
}
