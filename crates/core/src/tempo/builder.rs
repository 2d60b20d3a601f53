use std::cmp::Reverse;

use super::{Keyframe, TickTable};
use crate::song::{Channel, ModInstrument, ModSetting, Note, Pattern, Song, MOD_LANES};
use crate::{Result, SoundTileError};

/// Tempo control point local to one bar.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LocalKeyframe {
    tick: f64,
    ticks_per_second: f64,
    /// Tempo stays constant until the next keyframe instead of ramping.
    hold: bool,
}

impl LocalKeyframe {
    fn new(tick: f64, ticks_per_second: f64, hold: bool) -> Self {
        Self {
            tick,
            ticks_per_second,
            hold,
        }
    }
}

/// Tempo automation and skip point of a single bar.
#[derive(Debug, Clone, PartialEq)]
struct BarAutomation {
    keyframes: Vec<LocalKeyframe>,
    next_bar_tick: f64,
}

/// Bar order actually played for `loop_count` passes through the loop range.
///
/// Extra copies of the loop range are spliced in directly after its original
/// occurrence, so bars after the loop still play once at the end.
pub fn expand_bar_sequence(song: &Song, loop_count: u32) -> Vec<usize> {
    let mut bars: Vec<usize> = (0..song.song_length).collect();
    let start = song.loop_bars.offset.min(song.song_length);
    let end = song
        .loop_bars
        .offset
        .saturating_add(song.loop_bars.length)
        .min(song.song_length);
    if start < end {
        for _ in 1..loop_count.max(1) {
            let repeat = bars[start..end].to_vec();
            bars.splice(end..end, repeat);
        }
    }
    bars
}

/// Compiles the keyframe table for `song` played with `loop_count` loops.
///
/// `None` yields an empty table. Structural problems in mod channels are
/// reported as [`SoundTileError::CorruptSong`]; callers should treat the song
/// as unplayable rather than render a partial table.
pub fn build_tick_table(song: Option<&Song>, loop_count: u32) -> Result<TickTable> {
    let Some(song) = song else {
        return Ok(TickTable::empty());
    };
    if !(song.tick_speed.is_finite() && song.tick_speed > 0.0) {
        return Err(SoundTileError::corrupt(
            "tickSpeed",
            format!("expected a positive tempo, got {}", song.tick_speed),
        ));
    }
    if song.bar_length == 0 {
        return Err(SoundTileError::corrupt("barLength", "bars must contain ticks"));
    }

    let bars = expand_bar_sequence(song, loop_count);
    let bar_length = f64::from(song.bar_length);
    let mut table = TableWriter::new(song.tick_speed);
    let mut skipped_time = false;

    for (position, &bar) in bars.iter().enumerate() {
        let offset = position as f64 * bar_length;
        if skipped_time {
            table.jump_to(offset);
        }
        let automation = collect_bar(song, bar, table.tempo())?;
        skipped_time = automation.next_bar_tick < bar_length;
        for keyframe in &automation.keyframes {
            table.advance_to(
                offset + keyframe.tick,
                keyframe.ticks_per_second,
                keyframe.hold,
            );
        }
        if skipped_time {
            table.advance_to(offset + automation.next_bar_tick, table.tempo(), true);
        }
    }

    let total_ticks = bars.len() as f64 * bar_length;
    if skipped_time {
        table.jump_to(total_ticks);
    } else {
        table.advance_to(total_ticks, table.tempo(), true);
    }

    let table = TickTable::from_keyframes(table.finish(), song.bar_length, song.beat_length);
    tracing::debug!(
        bars = bars.len(),
        keyframes = table.keyframes().len(),
        song_length = table.song_length(),
        "compiled tick table"
    );
    Ok(table)
}

/// Gathers the tempo keyframes of one bar from every mod channel.
///
/// Channels are visited from the last to the first, and notes from the
/// highest lane down, so lower-indexed channels and lanes splice over what
/// was placed before them. The list starts with a held keyframe at the entry
/// tempo so that overrides can restore it once they end.
fn collect_bar(song: &Song, bar: usize, entry_tempo: f64) -> Result<BarAutomation> {
    let bar_length = f64::from(song.bar_length);
    let mut keyframes = vec![LocalKeyframe::new(0.0, entry_tempo, true)];
    let mut next_bar_tick = bar_length;

    for (channel_index, channel) in song.mod_channels().rev() {
        let Some((pattern, modulator)) = active_pattern(channel, channel_index, bar)? else {
            continue;
        };

        let mut lanes = Vec::with_capacity(pattern.notes.len());
        for note in &pattern.notes {
            let pitch = *note.pitches.first().ok_or_else(|| {
                SoundTileError::corrupt(
                    "pitches",
                    format!("mod note without a pitch in channel {channel_index}"),
                )
            })?;
            let lane = (MOD_LANES as u32 - 1).saturating_sub(pitch);
            lanes.push((lane, pitch, note));
        }
        lanes.sort_by_key(|&(lane, _, _)| Reverse(lane));

        for (_, pitch, note) in lanes {
            match modulator.lane_setting(pitch) {
                ModSetting::Tempo => {
                    let points = tempo_points(song, note)?;
                    splice_note(&mut keyframes, points);
                }
                ModSetting::NextBar => {
                    if let Some(start) = note.start_tick() {
                        next_bar_tick = next_bar_tick.min(start.clamp(0.0, bar_length));
                    }
                }
                ModSetting::Other => {}
            }
        }
    }

    if next_bar_tick < bar_length {
        truncate_at(&mut keyframes, next_bar_tick);
    }
    Ok(BarAutomation {
        keyframes,
        next_bar_tick,
    })
}

/// Resolves the pattern and mod instrument playing in `bar`, `None` for an
/// empty bar.
fn active_pattern(
    channel: &Channel,
    channel_index: usize,
    bar: usize,
) -> Result<Option<(&Pattern, &ModInstrument)>> {
    let Some(pattern_index) = Song::pattern_slot(channel, bar) else {
        return Ok(None);
    };
    let pattern = channel.patterns.get(pattern_index).ok_or_else(|| {
        SoundTileError::corrupt(
            "patterns",
            format!(
                "channel {channel_index} has no pattern {} for bar {bar}",
                pattern_index + 1
            ),
        )
    })?;
    let instrument_index = *pattern.instruments.first().ok_or_else(|| {
        SoundTileError::corrupt(
            "instruments",
            format!("pattern {} of channel {channel_index} has no instrument", pattern_index + 1),
        )
    })?;
    let instrument = channel.instruments.get(instrument_index).ok_or_else(|| {
        SoundTileError::corrupt(
            "instruments",
            format!("channel {channel_index} has no instrument {instrument_index}"),
        )
    })?;
    let modulator = instrument.as_mod().ok_or_else(|| {
        SoundTileError::corrupt(
            "modSettings",
            format!("instrument {instrument_index} of mod channel {channel_index} is not a modulator"),
        )
    })?;
    Ok(Some((pattern, modulator)))
}

fn tempo_points(song: &Song, note: &Note) -> Result<Vec<LocalKeyframe>> {
    let bar_length = f64::from(song.bar_length);
    let beat_length = f64::from(song.beat_length);
    let mut points = Vec::with_capacity(note.points.len());
    for point in &note.points {
        let ticks_per_second = (point.volume + 1.0) * beat_length / 60.0;
        if !(ticks_per_second.is_finite() && ticks_per_second > 0.0) {
            return Err(SoundTileError::corrupt(
                "volume",
                format!("tempo point yields {ticks_per_second} ticks per second"),
            ));
        }
        points.push(LocalKeyframe::new(
            point.tick.clamp(0.0, bar_length),
            ticks_per_second,
            false,
        ));
    }
    if let Some(last) = points.last_mut() {
        last.hold = true;
    }
    Ok(points)
}

/// Places a note's tempo points, replacing whatever covered the same ticks.
fn splice_note(keyframes: &mut Vec<LocalKeyframe>, note: Vec<LocalKeyframe>) {
    let (Some(first), Some(last)) = (note.first().copied(), note.last().copied()) else {
        return;
    };
    let (start, end) = (first.tick, last.tick);
    match keyframes.last() {
        Some(placed) if start <= placed.tick => {}
        _ => {
            keyframes.extend(note);
            return;
        }
    }

    let lo = keyframes.partition_point(|k| k.tick < start);
    let hi = keyframes.partition_point(|k| k.tick <= end);
    let mut replacement = Vec::with_capacity(note.len() + 2);

    // Freeze a ramp that was running into the note.
    if lo > 0 && lo < keyframes.len() {
        let before = keyframes[lo - 1];
        if !before.hold {
            let tempo = tempo_at(before, keyframes[lo], start);
            replacement.push(LocalKeyframe::new(start, tempo, true));
        }
    }
    replacement.extend(note);
    // Resume the overridden curve where the note ends.
    if hi > 0 && hi < keyframes.len() {
        let before = keyframes[hi - 1];
        let resume = if before.hold {
            LocalKeyframe::new(end, before.ticks_per_second, true)
        } else {
            LocalKeyframe::new(end, tempo_at(before, keyframes[hi], end), false)
        };
        replacement.push(resume);
    }
    keyframes.splice(lo..hi, replacement);
}

/// Drops every keyframe after the next-bar tick.
fn truncate_at(keyframes: &mut Vec<LocalKeyframe>, tick: f64) {
    let cut = keyframes.partition_point(|k| k.tick <= tick);
    let boundary = match (cut.checked_sub(1).map(|i| keyframes[i]), keyframes.get(cut)) {
        (Some(before), Some(&after)) if !before.hold && before.tick < tick => Some(
            LocalKeyframe::new(tick, tempo_at(before, after, tick), true),
        ),
        _ => None,
    };
    keyframes.truncate(cut);
    keyframes.extend(boundary);
}

/// Tempo at `tick` on the ramp from `before` to `after` (linear in ticks).
fn tempo_at(before: LocalKeyframe, after: LocalKeyframe, tick: f64) -> f64 {
    let span = after.tick - before.tick;
    if span <= 0.0 {
        return after.ticks_per_second;
    }
    let progress = (tick - before.tick) / span;
    before.ticks_per_second + (after.ticks_per_second - before.ticks_per_second) * progress
}

/// Appends absolute keyframes by integrating time forward from the last one.
struct TableWriter {
    keyframes: Vec<Keyframe>,
    hold: bool,
}

impl TableWriter {
    fn new(tick_speed: f64) -> Self {
        Self {
            keyframes: vec![Keyframe::new(0.0, 0.0, tick_speed)],
            hold: true,
        }
    }

    fn last(&self) -> Keyframe {
        // Never empty: seeded with the origin keyframe.
        self.keyframes[self.keyframes.len() - 1]
    }

    fn tempo(&self) -> f64 {
        self.last().ticks_per_second
    }

    fn advance_to(&mut self, tick: f64, ticks_per_second: f64, hold: bool) {
        let last = self.last();
        let span = tick - last.tick;
        if span <= 0.0 {
            if ticks_per_second != last.ticks_per_second {
                self.push(Keyframe::new(last.time, last.tick, ticks_per_second));
            }
        } else if self.hold || ticks_per_second == last.ticks_per_second {
            let time = last.time + span / last.ticks_per_second;
            self.push(Keyframe::new(time, tick, last.ticks_per_second));
            if ticks_per_second != last.ticks_per_second {
                self.push(Keyframe::new(time, tick, ticks_per_second));
            }
        } else {
            let r = (ticks_per_second - last.ticks_per_second) / span;
            let elapsed = (r * span / last.ticks_per_second + 1.0).ln() / r;
            self.push(Keyframe::new(last.time + elapsed, tick, ticks_per_second));
        }
        self.hold = hold;
    }

    /// Moves to `tick` without advancing time.
    fn jump_to(&mut self, tick: f64) {
        let last = self.last();
        if tick > last.tick {
            self.push(Keyframe::new(last.time, tick, last.ticks_per_second));
        }
        self.hold = true;
    }

    fn push(&mut self, keyframe: Keyframe) {
        let len = self.keyframes.len();
        if len >= 2 {
            let before = self.keyframes[len - 2];
            let last = self.keyframes[len - 1];
            let collinear = before.ticks_per_second == last.ticks_per_second
                && last.ticks_per_second == keyframe.ticks_per_second
                && before.time < last.time
                && last.time < keyframe.time;
            if collinear {
                self.keyframes[len - 1] = keyframe;
                return;
            }
        }
        self.keyframes.push(keyframe);
    }

    fn finish(self) -> Vec<Keyframe> {
        self.keyframes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::{ChannelKind, Instrument, InstrumentKind, LoopBars, NotePoint};

    const EPSILON: f64 = 1e-6;

    /// Volume that maps to `tps` ticks per second with four-tick beats.
    fn volume_for(tps: f64) -> f64 {
        tps * 60.0 / 4.0 - 1.0
    }

    fn tempo_note(points: &[(f64, f64)]) -> Note {
        Note {
            pitches: vec![5],
            points: points
                .iter()
                .map(|&(tick, tps)| NotePoint {
                    tick,
                    pitch_bend: 0.0,
                    volume: volume_for(tps),
                })
                .collect(),
            continue_last: false,
        }
    }

    fn next_bar_note(tick: f64) -> Note {
        Note {
            pitches: vec![4],
            points: vec![
                NotePoint {
                    tick,
                    pitch_bend: 0.0,
                    volume: 0.0,
                },
                NotePoint {
                    tick: tick + 1.0,
                    pitch_bend: 0.0,
                    volume: 0.0,
                },
            ],
            continue_last: false,
        }
    }

    fn mod_channel(patterns: Vec<Vec<Note>>, sequence: Vec<usize>) -> Channel {
        Channel {
            kind: ChannelKind::Mod,
            name: "Mod".into(),
            instruments: vec![Instrument::Mod(ModInstrument {
                mod_channels: vec![-1; MOD_LANES],
                mod_instruments: vec![0; MOD_LANES],
                mod_settings: vec![2, 4, 0, 0, 0, 0],
            })],
            patterns: patterns
                .into_iter()
                .map(|notes| Pattern {
                    notes,
                    instruments: vec![0],
                })
                .collect(),
            sequence,
        }
    }

    /// Four-tick beats, four beats per bar, four ticks per second.
    fn song(bars: usize, channels: Vec<Channel>) -> Song {
        let mut song = Song::new(4.0, 4, 4, bars);
        song.channels = channels;
        song
    }

    fn assert_table_invariants(table: &TickTable) {
        let keyframes = table.keyframes();
        assert_eq!(keyframes[0], Keyframe::new(0.0, 0.0, keyframes[0].ticks_per_second));
        for pair in keyframes.windows(2) {
            assert!(pair[1].time >= pair[0].time, "time decreased: {pair:?}");
            assert!(pair[1].tick >= pair[0].tick, "tick decreased: {pair:?}");
        }
        for (index, keyframe) in keyframes.iter().enumerate() {
            // A later keyframe at the same time wins the lookup.
            let shadowed = keyframes
                .get(index + 1)
                .is_some_and(|next| next.time == keyframe.time);
            if !shadowed {
                let tick = table.lookup(keyframe.time);
                assert!((tick - keyframe.tick).abs() < EPSILON, "lookup({}) = {tick}", keyframe.time);
            }
        }
    }

    #[test]
    fn single_plain_bar_matches_reference_table() {
        let mut song = song(1, Vec::new());
        song.bar_length = 16;
        let table = build_tick_table(Some(&song), 1).unwrap();
        assert_eq!(
            table.keyframes(),
            &[Keyframe::new(0.0, 0.0, 4.0), Keyframe::new(4.0, 16.0, 4.0)]
        );
        assert_eq!(table.lookup(2.0), 8.0);
        assert_eq!(table.song_length(), 4.0);
    }

    #[test]
    fn constant_tempo_reaches_bar_end() {
        let mut song = Song::new(6.0, 6, 4, 1);
        song.channels.push(Channel {
            kind: ChannelKind::Pitch,
            name: "Pitch 1".into(),
            instruments: vec![Instrument::Tone {
                kind: InstrumentKind::Chip,
            }],
            patterns: Vec::new(),
            sequence: vec![0],
        });
        let table = build_tick_table(Some(&song), 1).unwrap();
        assert!((table.lookup(24.0 / 6.0) - 24.0).abs() < EPSILON);
    }

    #[test]
    fn no_song_gives_empty_table() {
        let table = build_tick_table(None, 3).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.song_length(), 0.0);
        assert_eq!(table.lookup(10.0), 0.0);
    }

    #[test]
    fn loop_range_is_spliced_after_itself() {
        let mut song = song(6, Vec::new());
        song.loop_bars = LoopBars {
            offset: 2,
            length: 3,
        };
        assert_eq!(expand_bar_sequence(&song, 2), vec![0, 1, 2, 3, 4, 2, 3, 4, 5]);
        assert_eq!(
            expand_bar_sequence(&song, 3),
            vec![0, 1, 2, 3, 4, 2, 3, 4, 2, 3, 4, 5]
        );
        assert_eq!(expand_bar_sequence(&song, 1), vec![0, 1, 2, 3, 4, 5]);

        let table = build_tick_table(Some(&song), 2).unwrap();
        assert_eq!(table.keyframes().last().unwrap().tick, 9.0 * 16.0);
    }

    #[test]
    fn loop_range_is_clamped_to_song() {
        let mut song = song(3, Vec::new());
        song.loop_bars = LoopBars {
            offset: 2,
            length: 5,
        };
        assert_eq!(expand_bar_sequence(&song, 2), vec![0, 1, 2, 2]);
    }

    #[test]
    fn tempo_ramp_uses_exponential_segment() {
        let channel = mod_channel(vec![vec![tempo_note(&[(0.0, 4.0), (16.0, 8.0)])]], vec![1]);
        let table = build_tick_table(Some(&song(1, vec![channel])), 1).unwrap();
        let end_time = 4.0 * 2f64.ln();
        let keyframes = table.keyframes();
        assert_eq!(keyframes.len(), 2);
        assert!((keyframes[1].time - end_time).abs() < EPSILON);
        assert_eq!(keyframes[1].tick, 16.0);
        assert_eq!(keyframes[1].ticks_per_second, 8.0);
        assert_table_invariants(&table);
    }

    #[test]
    fn gap_before_automation_holds_previous_tempo() {
        // Tempo stays at 4 until tick 8, then ramps from 2 to 6 over 8 ticks.
        let channel = mod_channel(vec![vec![tempo_note(&[(8.0, 2.0), (16.0, 6.0)])]], vec![1]);
        let table = build_tick_table(Some(&song(1, vec![channel])), 1).unwrap();
        assert!((table.lookup(1.0) - 4.0).abs() < EPSILON);
        assert!((table.lookup(2.0) - 8.0).abs() < EPSILON);
        let keyframes = table.keyframes();
        assert_eq!(keyframes[1], Keyframe::new(2.0, 8.0, 4.0));
        assert_eq!(keyframes[2], Keyframe::new(2.0, 8.0, 2.0));
        assert_table_invariants(&table);
    }

    #[test]
    fn held_note_end_keeps_tempo_until_next_note() {
        let channel = mod_channel(
            vec![vec![
                tempo_note(&[(0.0, 8.0), (4.0, 8.0)]),
                tempo_note(&[(12.0, 2.0)]),
            ]],
            vec![1],
        );
        let table = build_tick_table(Some(&song(1, vec![channel])), 1).unwrap();
        // 12 ticks at 8 ticks/s, then 4 ticks at 2 ticks/s.
        assert!((table.lookup(1.5) - 12.0).abs() < EPSILON);
        assert!((table.song_length() - 3.5).abs() < EPSILON);
        assert_table_invariants(&table);
    }

    #[test]
    fn next_bar_truncates_and_jumps() {
        let channel = mod_channel(vec![vec![next_bar_note(8.0)]], vec![1, 0]);
        let table = build_tick_table(Some(&song(2, vec![channel])), 1).unwrap();
        assert_eq!(
            table.keyframes(),
            &[
                Keyframe::new(0.0, 0.0, 4.0),
                Keyframe::new(2.0, 8.0, 4.0),
                Keyframe::new(2.0, 16.0, 4.0),
                Keyframe::new(6.0, 32.0, 4.0),
            ]
        );
        assert!(table
            .keyframes()
            .iter()
            .all(|k| k.tick <= 8.0 || k.tick >= 16.0));
        assert!((table.lookup(1.0) - 4.0).abs() < EPSILON);
        assert_eq!(table.lookup(2.0), 16.0);
        assert!((table.lookup(4.0) - 24.0).abs() < EPSILON);
        assert_table_invariants(&table);
    }

    #[test]
    fn next_bar_inside_ramp_synthesises_boundary() {
        let channel = mod_channel(
            vec![vec![
                tempo_note(&[(0.0, 4.0), (16.0, 8.0)]),
                next_bar_note(8.0),
            ]],
            vec![1],
        );
        let song = song(1, vec![channel]);
        let automation = collect_bar(&song, 0, 4.0).unwrap();
        assert_eq!(automation.next_bar_tick, 8.0);
        assert_eq!(
            automation.keyframes,
            vec![
                LocalKeyframe::new(0.0, 4.0, false),
                LocalKeyframe::new(8.0, 6.0, true),
            ]
        );

        let table = build_tick_table(Some(&song), 1).unwrap();
        // Ramp from 4 to 6 ticks/s over the first 8 ticks.
        let skip_time = 1.5f64.ln() / 0.25;
        let last = *table.keyframes().last().unwrap();
        assert!((last.time - skip_time).abs() < EPSILON);
        assert_eq!(last.tick, 16.0);
        assert_table_invariants(&table);
    }

    #[test]
    fn skip_at_existing_keyframe_is_not_duplicated() {
        let mut keyframes = vec![
            LocalKeyframe::new(0.0, 4.0, false),
            LocalKeyframe::new(8.0, 6.0, false),
            LocalKeyframe::new(16.0, 8.0, true),
        ];
        truncate_at(&mut keyframes, 8.0);
        assert_eq!(
            keyframes,
            vec![
                LocalKeyframe::new(0.0, 4.0, false),
                LocalKeyframe::new(8.0, 6.0, false),
            ]
        );
    }

    #[test]
    fn lower_channel_overrides_overlapping_range() {
        let low = mod_channel(vec![vec![tempo_note(&[(4.0, 8.0), (8.0, 8.0)])]], vec![1]);
        let high = mod_channel(vec![vec![tempo_note(&[(0.0, 2.0), (12.0, 2.0)])]], vec![1]);
        let song = song(1, vec![low, high]);
        let automation = collect_bar(&song, 0, 4.0).unwrap();
        assert_eq!(
            automation.keyframes,
            vec![
                LocalKeyframe::new(0.0, 2.0, false),
                LocalKeyframe::new(4.0, 2.0, true),
                LocalKeyframe::new(4.0, 8.0, false),
                LocalKeyframe::new(8.0, 8.0, true),
                LocalKeyframe::new(8.0, 2.0, false),
                LocalKeyframe::new(12.0, 2.0, true),
            ]
        );

        let table = build_tick_table(Some(&song), 1).unwrap();
        // 4 ticks at 2, 4 ticks at 8, 4 ticks at 2, 4 ticks at 2.
        assert!((table.song_length() - 6.5).abs() < EPSILON);
        assert_table_invariants(&table);
    }

    #[test]
    fn override_restores_entry_tempo_after_note() {
        let low = mod_channel(vec![vec![tempo_note(&[(0.0, 8.0), (4.0, 8.0)])]], vec![1]);
        let high = mod_channel(vec![vec![tempo_note(&[(12.0, 2.0)])]], vec![1]);
        let song = song(1, vec![low, high]);
        let automation = collect_bar(&song, 0, 4.0).unwrap();
        assert_eq!(
            automation.keyframes,
            vec![
                LocalKeyframe::new(0.0, 8.0, false),
                LocalKeyframe::new(4.0, 8.0, true),
                LocalKeyframe::new(4.0, 4.0, true),
                LocalKeyframe::new(12.0, 2.0, true),
            ]
        );
    }

    #[test]
    fn lower_lane_overrides_higher_lane() {
        let mut channel = mod_channel(
            vec![vec![
                tempo_note(&[(0.0, 8.0), (16.0, 8.0)]),
                Note {
                    pitches: vec![3],
                    ..tempo_note(&[(0.0, 2.0), (16.0, 2.0)])
                },
            ]],
            vec![1],
        );
        if let Instrument::Mod(modulator) = &mut channel.instruments[0] {
            modulator.mod_settings = vec![2, 4, 2, 0, 0, 0];
        }
        let automation = collect_bar(&song(1, vec![channel]), 0, 4.0).unwrap();
        assert!(automation
            .keyframes
            .iter()
            .all(|k| k.ticks_per_second == 8.0));
    }

    #[test]
    fn tempo_carries_across_bars_and_loops() {
        let channel = mod_channel(
            vec![vec![tempo_note(&[(0.0, 8.0), (8.0, 2.0)])]],
            vec![0, 1, 0],
        );
        let mut song = song(3, vec![channel]);
        song.loop_bars = LoopBars {
            offset: 1,
            length: 1,
        };
        let table = build_tick_table(Some(&song), 3).unwrap();
        assert_eq!(table.keyframes().last().unwrap().tick, 5.0 * 16.0);
        // Bar 0 at 4 ticks/s; every bar after the first ramp ends at 2 ticks/s.
        assert!((table.lookup(4.0) - 16.0).abs() < EPSILON);
        assert_eq!(table.keyframes().last().unwrap().ticks_per_second, 2.0);
        assert_table_invariants(&table);

        let mut previous = -1.0;
        let steps = 400;
        for step in 0..=steps {
            let tick = table.lookup(table.song_length() * f64::from(step) / f64::from(steps));
            assert!(tick > previous);
            previous = tick;
        }
    }

    #[test]
    fn missing_pattern_is_corrupt() {
        let channel = mod_channel(vec![vec![]], vec![3]);
        let err = build_tick_table(Some(&song(1, vec![channel])), 1).unwrap_err();
        assert!(matches!(
            err,
            SoundTileError::CorruptSong {
                field: "patterns",
                ..
            }
        ));
    }

    #[test]
    fn tone_instrument_on_mod_channel_is_corrupt() {
        let mut channel = mod_channel(vec![vec![tempo_note(&[(0.0, 4.0)])]], vec![1]);
        channel.instruments = vec![Instrument::Tone {
            kind: InstrumentKind::Chip,
        }];
        let err = build_tick_table(Some(&song(1, vec![channel])), 1).unwrap_err();
        assert!(err.is_corrupt_song());
        assert!(err.to_string().contains("modSettings"));
    }

    #[test]
    fn non_positive_tick_speed_is_corrupt() {
        let mut song = song(1, Vec::new());
        song.tick_speed = 0.0;
        let err = build_tick_table(Some(&song), 1).unwrap_err();
        assert!(err.to_string().contains("tickSpeed"));
    }
}
