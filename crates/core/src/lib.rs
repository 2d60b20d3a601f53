//! Core library for the Sound Tile song visualiser.
//!
//! The centre of the crate is the tick engine in [`tempo`]: it compiles a
//! chiptune song with tempo automation into a keyframe table that maps
//! playback seconds to song ticks. Around it sit the modulation graph that
//! routes live values between tiles, the playback clock, the renderer with
//! its optional worker thread and the frame loop that drives everything.

pub mod analysis;
pub mod config;
pub mod drawloop;
pub mod error;
pub mod modulation;
pub mod render;
pub mod song;
pub mod tempo;
pub mod timeline;

pub use analysis::{AnalysisFrame, Analyser};
pub use config::{AnalysisConfig, AppConfig, RenderConfig, SongConfig};
pub use drawloop::{DebugLevel, FrameLoop, IntervalPacer, KeyChord, PerfMetrics};
pub use error::{Result, SoundTileError};
pub use modulation::{ModKey, Modulatable, Source, Target, Transform};
pub use render::{
    BackendKind, FrameResult, LoadResult, RenderBackend, RenderSettings, RendererHost,
    SongRenderInstance,
};
pub use song::Song;
pub use tempo::{build_tick_table, Keyframe, SharedTickTable, SongPosition, TickTable};
pub use timeline::{GlobalModulator, PlaybackClock};
