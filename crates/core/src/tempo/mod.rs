//! Tempo-mapped conversion between playback time and musical ticks.
//!
//! A song's tempo automation is compiled once into a [`TickTable`], a sorted
//! list of [`Keyframe`]s. Between two keyframes the tempo changes linearly
//! with respect to ticks, so ticks follow `dk/dt = r(k - k0) + r0`:
//!
//! ```text
//! t(k) = ln(r (k - k0) / r0 + 1) / r
//! k(t) = (r0 / r) e^(r (t - t0)) + k0 - r0 / r
//! ```
//!
//! with `r = (r1 - r0) / (k1 - k0)`. Equal tempos degrade to a straight line.

mod builder;

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::{Result, SoundTileError};

pub use builder::{build_tick_table, expand_bar_sequence};

/// Control point of the piecewise time/tick curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    /// Seconds from the start of playback.
    pub time: f64,
    /// Absolute tick position.
    pub tick: f64,
    pub ticks_per_second: f64,
}

impl Keyframe {
    pub const fn new(time: f64, tick: f64, ticks_per_second: f64) -> Self {
        Self {
            time,
            tick,
            ticks_per_second,
        }
    }
}

/// Musical position handed to drawing code each frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SongPosition {
    pub time: f64,
    pub tick: f64,
    pub bar: u64,
    pub tick_in_bar: f64,
    pub beat: u32,
    /// Ticks per bar of the table the position came from.
    pub bar_length: u32,
}

/// Compiled, read-only keyframe table for one song and loop count.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TickTable {
    keyframes: Vec<Keyframe>,
    song_length: f64,
    bar_length: u32,
    beat_length: u32,
}

impl TickTable {
    /// Table for "no song": every lookup yields tick 0.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps precomputed keyframes. The song length is the time of the last
    /// keyframe.
    pub fn from_keyframes(keyframes: Vec<Keyframe>, bar_length: u32, beat_length: u32) -> Self {
        let song_length = keyframes.last().map(|k| k.time).unwrap_or(0.0);
        Self {
            keyframes,
            song_length,
            bar_length,
            beat_length,
        }
    }

    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    /// Playback length in seconds.
    pub fn song_length(&self) -> f64 {
        self.song_length
    }

    pub fn bar_length(&self) -> u32 {
        self.bar_length
    }

    /// Tick position reached after `time` seconds of playback.
    ///
    /// Binary search over the keyframes; never allocates. Times past the end
    /// extrapolate at the final tempo.
    pub fn lookup(&self, time: f64) -> f64 {
        let keyframes = self.keyframes.as_slice();
        match keyframes {
            [] => 0.0,
            [only] => only.ticks_per_second * time,
            [first, ..] => {
                // First keyframe strictly after `time`.
                let next = keyframes.partition_point(|k| k.time <= time);
                if next == 0 {
                    return first.tick + first.ticks_per_second * (time - first.time);
                }
                let start = keyframes[next - 1];
                if time == start.time {
                    return start.tick;
                }
                match keyframes.get(next) {
                    None => start.tick + start.ticks_per_second * (time - start.time),
                    Some(end) => interpolate(start, *end, time),
                }
            }
        }
    }

    /// Whole bars elapsed at `tick`. Skipped ticks do not shorten bars.
    pub fn bar_index(&self, tick: f64) -> u64 {
        if self.bar_length == 0 {
            return 0;
        }
        (tick / f64::from(self.bar_length)).floor().max(0.0) as u64
    }

    pub fn tick_in_bar(&self, tick: f64) -> f64 {
        if self.bar_length == 0 {
            return tick;
        }
        tick.rem_euclid(f64::from(self.bar_length))
    }

    pub fn position(&self, time: f64) -> SongPosition {
        let tick = self.lookup(time);
        let tick_in_bar = self.tick_in_bar(tick);
        let beat = if self.beat_length == 0 {
            0
        } else {
            (tick_in_bar / f64::from(self.beat_length)).floor() as u32
        };
        SongPosition {
            time,
            tick,
            bar: self.bar_index(tick),
            tick_in_bar,
            beat,
            bar_length: self.bar_length,
        }
    }
}

fn interpolate(start: Keyframe, end: Keyframe, time: f64) -> f64 {
    let elapsed = time - start.time;
    let tick_span = end.tick - start.tick;
    if start.ticks_per_second == end.ticks_per_second || tick_span <= 0.0 {
        return start.tick + start.ticks_per_second * elapsed;
    }
    let r = (end.ticks_per_second - start.ticks_per_second) / tick_span;
    let scale = start.ticks_per_second / r;
    scale * (r * elapsed).exp() + start.tick - scale
}

/// Tick table snapshot shared between the builder and every reader.
///
/// Publishing swaps the inner `Arc`; readers holding the previous snapshot
/// keep using it until they load again.
#[derive(Debug, Clone, Default)]
pub struct SharedTickTable {
    current: Arc<RwLock<Arc<TickTable>>>,
}

impl SharedTickTable {
    pub fn new(table: TickTable) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(table))),
        }
    }

    pub fn load(&self) -> Result<Arc<TickTable>> {
        self.current
            .read()
            .map(|table| Arc::clone(&table))
            .map_err(|_| SoundTileError::Poisoned("tick table"))
    }

    pub fn publish(&self, table: TickTable) -> Result<()> {
        let table = Arc::new(table);
        let mut slot = self
            .current
            .write()
            .map_err(|_| SoundTileError::Poisoned("tick table"))?;
        *slot = table;
        Ok(())
    }
}
