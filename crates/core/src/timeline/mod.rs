use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::modulation::{ModKey, Source};

/// Playback position of the global modulator, in seconds.
pub const PLAYBACK_TIME: ModKey<f64> = ModKey::new("playbackTime");
pub const PLAYING: ModKey<bool> = ModKey::new("playing");

/// Tolerance used when deciding whether playback sits at the end.
const END_EPSILON: f64 = 0.01;

/// Monotonic seconds since some fixed origin.
pub trait TimeSource: Send {
    fn now(&self) -> f64;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualTime {
    bits: Arc<AtomicU64>,
}

impl ManualTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::Release);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// Owned transport for the current song.
///
/// While playing, the position follows the time source from the moment
/// playback started; while stopped it stays frozen. Positions are always
/// clamped to `[0, duration]`.
pub struct PlaybackClock {
    source: Box<dyn TimeSource>,
    start_time: f64,
    current_time: f64,
    duration: f64,
    playing: bool,
    looping: bool,
}

impl PlaybackClock {
    pub fn new(source: impl TimeSource + 'static) -> Self {
        let start_time = source.now();
        Self {
            source: Box::new(source),
            start_time,
            current_time: 0.0,
            duration: 0.0,
            playing: false,
            looping: false,
        }
    }

    pub fn now(&self) -> f64 {
        self.source.now()
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Changes the playable length, pulling the position back inside it.
    pub fn set_duration(&mut self, duration: f64) {
        self.duration = if duration.is_finite() {
            duration.max(0.0)
        } else {
            0.0
        };
        if self.current_time >= self.duration {
            self.seek(self.duration);
        } else {
            self.update();
        }
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Starts playback, rewinding first if the position is at the end.
    pub fn start(&mut self) {
        if self.duration > 0.0 && self.current_time + END_EPSILON >= self.duration {
            self.seek(0.0);
        }
        self.playing = true;
        self.update();
    }

    pub fn stop(&mut self) {
        self.update();
        self.playing = false;
    }

    pub fn seek(&mut self, time: f64) {
        let clamped = time.clamp(0.0, self.duration);
        self.start_time = self.source.now() - clamped;
        self.current_time = clamped;
        self.update();
    }

    /// Position as of the last [`PlaybackClock::update`].
    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    /// Samples the time source and returns the new position.
    pub fn update(&mut self) -> f64 {
        let now = self.source.now();
        if self.duration <= 0.0 {
            self.playing = false;
            self.current_time = 0.0;
            self.start_time = now;
        } else if self.playing {
            self.current_time = now - self.start_time;
            if self.current_time >= self.duration {
                if self.looping {
                    self.start_time = now;
                    self.current_time = 0.0;
                } else {
                    tracing::debug!(duration = self.duration, "playback reached the end");
                    self.playing = false;
                    self.current_time = self.duration;
                    self.start_time = now - self.duration;
                }
            }
        } else {
            self.start_time = now - self.current_time;
        }
        self.current_time
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new(MonotonicTime::new())
    }
}

impl std::fmt::Debug for PlaybackClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackClock")
            .field("current_time", &self.current_time)
            .field("duration", &self.duration)
            .field("playing", &self.playing)
            .field("looping", &self.looping)
            .finish()
    }
}

/// Modulation source for values that live outside any tile.
#[derive(Debug)]
pub struct GlobalModulator {
    source: Source,
}

impl GlobalModulator {
    pub fn new() -> Self {
        Self {
            source: Source::new("Page Sources")
                .with_property(PLAYBACK_TIME, 0.0)
                .with_property(PLAYING, false),
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Publishes the clock state. Stopped playback reports free-running time
    /// so time-driven effects keep animating.
    pub fn update(&self, clock: &PlaybackClock) {
        let time = if clock.is_playing() {
            clock.current_time()
        } else {
            clock.now()
        };
        self.source.set(PLAYBACK_TIME, time);
        self.source.set(PLAYING, clock.is_playing());
    }
}

impl Default for GlobalModulator {
    fn default() -> Self {
        Self::new()
    }
}
