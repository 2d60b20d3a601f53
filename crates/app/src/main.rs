use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sound_tile_core::config::MAX_LOOP_COUNT;
use sound_tile_core::render::{create_backend, probe_backend};
use sound_tile_core::song::beepbox;
use sound_tile_core::{
    build_tick_table, AppConfig, DebugLevel, FrameLoop, IntervalPacer, PerfMetrics,
    PlaybackClock, RenderSettings, RendererHost, Song,
};
use tracing_subscriber::EnvFilter;

const TERMINAL_COLUMNS: u32 = 48;

fn main() -> sound_tile_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Table { song, loops } => run_table(&song, loops.unwrap_or(config.song.loop_count)),
        Commands::Lookup { song, time, loops } => {
            run_lookup(&song, time, loops.unwrap_or(config.song.loop_count))
        }
        Commands::Play {
            song,
            loops,
            seconds,
            fallback,
            debug,
        } => {
            let loops = loops.unwrap_or(config.song.loop_count);
            run_play(&config, &song, loops, seconds, fallback, DebugLevel::from_level(debug))
        }
    }
}

fn load_song(path: &Path) -> sound_tile_core::Result<Song> {
    let text = std::fs::read_to_string(path)?;
    let song = beepbox::parse_json(&text)?;
    tracing::info!(
        path = %path.display(),
        bars = song.song_length,
        channels = song.channels.len(),
        "loaded song"
    );
    Ok(song)
}

fn run_table(path: &Path, loops: u32) -> sound_tile_core::Result<()> {
    let song = load_song(path)?;
    let table = build_tick_table(Some(&song), loops)?;
    println!("{}", serde_json::to_string_pretty(&table)?);
    Ok(())
}

fn run_lookup(path: &Path, time: f64, loops: u32) -> sound_tile_core::Result<()> {
    let song = load_song(path)?;
    let table = build_tick_table(Some(&song), loops)?;
    println!("{}", serde_json::to_string_pretty(&table.position(time))?);
    Ok(())
}

fn run_play(
    config: &AppConfig,
    path: &Path,
    loops: u32,
    seconds: Option<f64>,
    fallback: bool,
    debug: DebugLevel,
) -> sound_tile_core::Result<()> {
    let song = load_song(path)?;
    let backend = probe_backend();
    tracing::info!(?backend, "starting playback");

    let host = RendererHost::new(
        RenderSettings::new(Some(song), loops),
        config.render.use_worker && !fallback,
        Duration::from_millis(config.song.rebuild_throttle_ms),
        move || create_backend(backend),
    )?;
    let song_length = host.load_result().song_length;
    let mut frame_loop = FrameLoop::new(
        host,
        PlaybackClock::default(),
        IntervalPacer::from_config(&config.render),
        PerfMetrics::from_config(&config.render),
    );
    frame_loop.set_debug_level(debug);
    frame_loop.resize(TERMINAL_COLUMNS, 1)?;
    frame_loop.clock_mut().start();

    let seconds = seconds.unwrap_or(song_length).max(0.0);
    let stop = Arc::new(AtomicBool::new(false));
    let timer = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            thread::sleep(Duration::from_secs_f64(seconds));
            stop.store(true, Ordering::Release);
        })
    };

    let drawn = frame_loop.run_until(&stop, None)?;
    if timer.join().is_err() {
        tracing::warn!("playback timer panicked");
    }
    println!();
    for line in frame_loop.overlay() {
        println!("{line}");
    }
    tracing::info!(drawn, "playback finished");
    if let Some(summary) = frame_loop.metrics().summary() {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

fn parse_loops(value: &str) -> Result<u32, String> {
    let loops: u32 = value.parse().map_err(|err| format!("{err}"))?;
    if (1..=MAX_LOOP_COUNT).contains(&loops) {
        Ok(loops)
    } else {
        Err(format!("loop count must be between 1 and {MAX_LOOP_COUNT}"))
    }
}

fn parse_seconds(value: &str) -> Result<f64, String> {
    let seconds: f64 = value.parse().map_err(|err| format!("{err}"))?;
    if seconds.is_finite() && seconds >= 0.0 {
        Ok(seconds)
    } else {
        Err("seconds must be a finite, non-negative number".to_string())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Tempo-synchronised song visualiser", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply to anything it leaves out.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the compiled tick table of a BeepBox song as JSON.
    Table {
        /// BeepBox JSON export.
        song: PathBuf,
        /// Number of times the loop section is played.
        #[arg(short, long, value_parser = parse_loops)]
        loops: Option<u32>,
    },
    /// Print the musical position at a playback time.
    Lookup {
        song: PathBuf,
        /// Seconds from the start of playback.
        #[arg(short, long)]
        time: f64,
        #[arg(short, long, value_parser = parse_loops)]
        loops: Option<u32>,
    },
    /// Play a song through the render loop.
    Play {
        song: PathBuf,
        #[arg(short, long, value_parser = parse_loops)]
        loops: Option<u32>,
        /// Stop after this many seconds instead of the song length.
        #[arg(short, long, value_parser = parse_seconds)]
        seconds: Option<f64>,
        /// Draw on the calling thread instead of a render worker.
        #[arg(long)]
        fallback: bool,
        /// Debug overlay level (0, 1 or 2).
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        debug: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_must_be_finite() {
        assert_eq!(parse_seconds("2.5"), Ok(2.5));
        assert!(parse_seconds("inf").is_err());
        assert!(parse_seconds("NaN").is_err());
        assert!(parse_seconds("-1").is_err());
    }

    #[test]
    fn loops_are_bounded() {
        assert_eq!(parse_loops("3"), Ok(3));
        assert!(parse_loops("0").is_err());
        assert!(parse_loops("4000000000").is_err());
    }

    #[test]
    fn play_rejects_infinite_duration() {
        let parsed = Cli::try_parse_from(["sound-tile", "play", "song.json", "--seconds", "inf"]);
        assert!(parsed.is_err());
        let parsed = Cli::try_parse_from(["sound-tile", "play", "song.json", "--seconds", "1.5"]);
        assert!(parsed.is_ok());
    }
}
