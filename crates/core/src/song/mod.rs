//! Structured chiptune score consumed by the timing engine.
//!
//! The shape follows the BeepBox family of trackers: channels hold patterns of
//! notes, and a per-bar sequence picks which pattern plays in each bar. Mod
//! channels carry automation instead of audible notes; only their tempo and
//! next-bar lanes matter for timing.

pub mod beepbox;

use serde::{Deserialize, Serialize};

/// Number of modulation lanes in a mod instrument. Lane `j` is addressed by
/// notes whose first pitch is `MOD_LANES - 1 - j`.
pub const MOD_LANES: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    #[serde(default)]
    pub key: ScaleKey,
    /// Baseline tempo in ticks per second.
    pub tick_speed: f64,
    /// Ticks per beat.
    pub beat_length: u32,
    /// Ticks per bar.
    pub bar_length: u32,
    /// Beats per bar.
    pub meter_length: u32,
    pub loop_bars: LoopBars,
    /// Bars played before the song ends or loops.
    pub song_length: usize,
    pub channels: Vec<Channel>,
}

impl Song {
    /// An empty song of `song_length` bars with no channels.
    pub fn new(tick_speed: f64, beat_length: u32, meter_length: u32, song_length: usize) -> Self {
        Self {
            key: ScaleKey::C,
            tick_speed,
            beat_length,
            bar_length: beat_length * meter_length,
            meter_length,
            loop_bars: LoopBars {
                offset: 0,
                length: song_length,
            },
            song_length,
            channels: Vec::new(),
        }
    }

    pub fn mod_channels(&self) -> impl DoubleEndedIterator<Item = (usize, &Channel)> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, channel)| channel.kind == ChannelKind::Mod)
    }

    /// Pattern playing in `bar` for `channel`, `None` for empty bars.
    ///
    /// Sequence entries are one-based; zero and bars past the end of the
    /// sequence are empty.
    pub fn pattern_slot(channel: &Channel, bar: usize) -> Option<usize> {
        match channel.sequence.get(bar).copied() {
            None | Some(0) => None,
            Some(index) => Some(index - 1),
        }
    }
}

/// Range of bars that repeats when the song loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopBars {
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Pitch,
    Drum,
    Mod,
}

impl ChannelKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pitch => "Pitch",
            Self::Drum => "Drum",
            Self::Mod => "Mod",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub kind: ChannelKind,
    pub name: String,
    pub instruments: Vec<Instrument>,
    pub patterns: Vec<Pattern>,
    /// One entry per bar; 0 is an empty bar, otherwise a one-based pattern index.
    pub sequence: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Instrument {
    Tone { kind: InstrumentKind },
    Mod(ModInstrument),
}

impl Instrument {
    pub fn as_mod(&self) -> Option<&ModInstrument> {
        match self {
            Self::Mod(instrument) => Some(instrument),
            Self::Tone { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Chip,
    CustomChip,
    Pwm,
    Supersaw,
    Fm,
    Fm6op,
    Harmonics,
    PickedString,
    Spectrum,
    Noise,
    Drumset,
}

impl InstrumentKind {
    pub fn from_format_name(name: &str) -> Option<Self> {
        Some(match name {
            "chip" => Self::Chip,
            "custom chip" => Self::CustomChip,
            "pwm" => Self::Pwm,
            "supersaw" => Self::Supersaw,
            "fm" => Self::Fm,
            "fm6op" => Self::Fm6op,
            "harmonics" => Self::Harmonics,
            "picked string" => Self::PickedString,
            "spectrum" => Self::Spectrum,
            "noise" => Self::Noise,
            "drumset" => Self::Drumset,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModInstrument {
    pub mod_channels: Vec<i32>,
    pub mod_instruments: Vec<i32>,
    /// Setting ordinal per lane, see [`ModSetting::from_ordinal`].
    pub mod_settings: Vec<u32>,
}

impl ModInstrument {
    /// Setting driven by notes whose first pitch is `pitch`.
    pub fn lane_setting(&self, pitch: u32) -> ModSetting {
        let Some(lane) = (MOD_LANES as u32 - 1).checked_sub(pitch) else {
            return ModSetting::Other;
        };
        self.mod_settings
            .get(lane as usize)
            .map(|&ordinal| ModSetting::from_ordinal(ordinal))
            .unwrap_or(ModSetting::Other)
    }
}

/// The modulator settings the timing engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModSetting {
    Tempo,
    NextBar,
    Other,
}

impl ModSetting {
    /// The format stores the ordinal of the setting list ("Song Tempo" is 2,
    /// "Go To Next Bar" is 4).
    pub fn from_ordinal(ordinal: u32) -> Self {
        match ordinal {
            2 => Self::Tempo,
            4 => Self::NextBar,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pattern {
    pub notes: Vec<Note>,
    /// Zero-based instrument indices; the first is the active instrument.
    pub instruments: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub pitches: Vec<u32>,
    /// Sorted by tick; ticks are local to the bar.
    pub points: Vec<NotePoint>,
    #[serde(default)]
    pub continue_last: bool,
}

impl Note {
    pub fn start_tick(&self) -> Option<f64> {
        self.points.first().map(|point| point.tick)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePoint {
    pub tick: f64,
    pub pitch_bend: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScaleKey {
    #[default]
    C,
    CSharp,
    D,
    DSharp,
    E,
    F,
    FSharp,
    G,
    GSharp,
    A,
    ASharp,
    B,
}

impl ScaleKey {
    /// Accepts both `C#` and `C♯` spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalised = name.trim().replace('♯', "#");
        Some(match normalised.as_str() {
            "C" => Self::C,
            "C#" => Self::CSharp,
            "D" => Self::D,
            "D#" => Self::DSharp,
            "E" => Self::E,
            "F" => Self::F,
            "F#" => Self::FSharp,
            "G" => Self::G,
            "G#" => Self::GSharp,
            "A" => Self::A,
            "A#" => Self::ASharp,
            "B" => Self::B,
            _ => return None,
        })
    }
}
