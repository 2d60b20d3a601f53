//! Import of the BeepBox JSON export format.
//!
//! Only the fields the visualiser needs are read; everything else in the
//! export is ignored. Validation is strict about the fields it does read so a
//! malformed document never reaches the timing engine.

use serde::Deserialize;

use super::{
    Channel, ChannelKind, Instrument, InstrumentKind, LoopBars, ModInstrument, Note, NotePoint,
    Pattern, ScaleKey, Song,
};
use crate::{Result, SoundTileError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSong {
    key: Option<String>,
    intro_bars: Option<usize>,
    loop_bars: Option<usize>,
    beats_per_bar: Option<u32>,
    ticks_per_beat: Option<u32>,
    beats_per_minute: Option<f64>,
    channels: Option<Vec<Option<RawChannel>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChannel {
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    instruments: Option<Vec<RawInstrument>>,
    patterns: Option<Vec<Option<RawPattern>>>,
    sequence: Option<Vec<usize>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInstrument {
    #[serde(rename = "type")]
    kind: Option<String>,
    mod_channels: Option<Vec<i32>>,
    mod_instruments: Option<Vec<i32>>,
    mod_settings: Option<Vec<u32>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPattern {
    notes: Option<Vec<Option<RawNote>>>,
    instruments: Option<Vec<usize>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNote {
    pitches: Option<Vec<u32>>,
    points: Option<Vec<RawPoint>>,
    continues_last_pattern: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPoint {
    tick: Option<f64>,
    pitch_bend: Option<f64>,
    volume: Option<f64>,
}

/// Parses a BeepBox JSON export.
pub fn parse_json(json: &str) -> Result<Song> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    parse_value(value)
}

/// Converts an already parsed JSON value into a [`Song`].
pub fn parse_value(value: serde_json::Value) -> Result<Song> {
    if value.is_null() {
        return Err(invalid("data is nullish"));
    }
    let raw: RawSong =
        serde_json::from_value(value).map_err(|err| invalid(format!("malformed song: {err}")))?;

    let key = match raw.key.as_deref() {
        Some(name) => ScaleKey::from_name(name).unwrap_or_else(|| {
            tracing::warn!(key = name, "unrecognized key, defaulting to C");
            ScaleKey::C
        }),
        None => ScaleKey::C,
    };
    let beats_per_minute = raw
        .beats_per_minute
        .ok_or_else(|| invalid("missing beatsPerMinute"))?;
    let beats_per_bar = raw.beats_per_bar.ok_or_else(|| invalid("missing beatsPerBar"))?;
    let ticks_per_beat = raw
        .ticks_per_beat
        .ok_or_else(|| invalid("missing ticksPerBeat"))?;
    let loop_bars = raw.loop_bars.ok_or_else(|| invalid("missing loopBars"))?;
    let intro_bars = raw.intro_bars.ok_or_else(|| invalid("missing introBars"))?;
    let raw_channels = raw.channels.ok_or_else(|| invalid("missing channel data"))?;
    let bar_length = beats_per_bar
        .checked_mul(ticks_per_beat)
        .ok_or_else(|| invalid("bar length overflows"))?;

    let channels = raw_channels
        .into_iter()
        .enumerate()
        .map(|(index, channel)| {
            let channel = channel.ok_or_else(|| invalid("null channel data"))?;
            convert_channel(index, channel)
        })
        .collect::<Result<Vec<_>>>()?;
    let song_length = channels
        .iter()
        .map(|channel| channel.sequence.len())
        .max()
        .unwrap_or(0);

    Ok(Song {
        key,
        tick_speed: beats_per_minute * f64::from(ticks_per_beat) / 60.0,
        beat_length: ticks_per_beat,
        bar_length,
        meter_length: beats_per_bar,
        loop_bars: LoopBars {
            offset: intro_bars,
            length: loop_bars,
        },
        song_length,
        channels,
    })
}

fn convert_channel(index: usize, raw: RawChannel) -> Result<Channel> {
    let kind = match raw.kind.as_deref() {
        Some("pitch") => ChannelKind::Pitch,
        Some("drum") => ChannelKind::Drum,
        Some("mod") => ChannelKind::Mod,
        other => {
            return Err(invalid(format!(
                "unrecognized channel type \"{}\"",
                other.unwrap_or_default()
            )))
        }
    };
    let raw_instruments = raw
        .instruments
        .ok_or_else(|| invalid("missing instrument data"))?;
    let raw_patterns = raw.patterns.ok_or_else(|| invalid("missing pattern data"))?;
    let sequence = raw.sequence.ok_or_else(|| invalid("missing sequence"))?;

    let name = match raw.name {
        Some(name) if !name.is_empty() => name,
        _ => format!("{} {}", kind.label(), index + 1),
    };
    let instruments = raw_instruments
        .into_iter()
        .map(convert_instrument)
        .collect::<Result<Vec<_>>>()?;
    let instrument_count = instruments.len();
    let patterns = raw_patterns
        .into_iter()
        .map(|pattern| {
            let pattern = pattern.ok_or_else(|| invalid("null pattern data"))?;
            convert_pattern(pattern, instrument_count)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Channel {
        kind,
        name,
        instruments,
        patterns,
        sequence,
    })
}

fn convert_instrument(raw: RawInstrument) -> Result<Instrument> {
    let kind = raw.kind.unwrap_or_default().to_lowercase();
    if kind == "mod" {
        let invalid_data = || invalid("invalid instrument data");
        return Ok(Instrument::Mod(ModInstrument {
            mod_channels: raw.mod_channels.ok_or_else(invalid_data)?,
            mod_instruments: raw.mod_instruments.ok_or_else(invalid_data)?,
            mod_settings: raw.mod_settings.ok_or_else(invalid_data)?,
        }));
    }
    InstrumentKind::from_format_name(&kind)
        .map(|kind| Instrument::Tone { kind })
        .ok_or_else(|| invalid(format!("unrecognized instrument type \"{kind}\"")))
}

fn convert_pattern(raw: RawPattern, instrument_count: usize) -> Result<Pattern> {
    let notes = raw
        .notes
        .ok_or_else(|| invalid("missing note data"))?
        .into_iter()
        .map(|note| {
            let note = note.ok_or_else(|| invalid("null note data"))?;
            convert_note(note)
        })
        .collect::<Result<Vec<_>>>()?;
    // Without "different instruments per pattern" the export omits the list
    // and every instrument plays. Indices in the export are one-based.
    let instruments = match raw.instruments {
        Some(list) => list.into_iter().map(|i| i.saturating_sub(1)).collect(),
        None => (0..instrument_count).collect(),
    };
    Ok(Pattern { notes, instruments })
}

fn convert_note(raw: RawNote) -> Result<Note> {
    let pitches = raw.pitches.ok_or_else(|| invalid("missing note pitches"))?;
    let points = raw
        .points
        .ok_or_else(|| invalid("missing note points"))?
        .into_iter()
        .map(|point| match (point.tick, point.pitch_bend, point.volume) {
            (Some(tick), Some(pitch_bend), Some(volume)) => Ok(NotePoint {
                tick,
                pitch_bend,
                volume,
            }),
            _ => Err(invalid("invalid note data")),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Note {
        pitches,
        points,
        continue_last: raw.continues_last_pattern.unwrap_or(false),
    })
}

fn invalid(message: impl Into<String>) -> SoundTileError {
    SoundTileError::InvalidSong(message.into())
}
