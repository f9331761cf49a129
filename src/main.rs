// Stemdeck terminal front end
// Loads the stems given on the command line, plays them on the default
// output device and takes transport commands from stdin.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use stemdeck_lib::audio::AudioOutput;
use stemdeck_lib::{
    AssetSet, CursorSample, DurationPolicy, Phase, Player, PlayerError, PlayerSettings,
    SymphoniaDecoder, TrackId,
};

/// Width of the playhead bar, in characters
const BAR_WIDTH: usize = 40;

#[derive(Debug, Parser)]
#[command(name = "stemdeck", version, about = "Play the stems of one song in lockstep")]
struct Args {
    /// Stem files, in track order
    #[arg(required = true)]
    stems: Vec<String>,

    /// Directory holding stemdeck.json
    #[arg(long, default_value = ".")]
    settings_dir: PathBuf,

    /// Start with looping enabled
    #[arg(long = "loop")]
    looping: bool,

    /// Song length: seconds, or shortest / longest / strict
    #[arg(long, value_parser = parse_duration)]
    duration: Option<DurationPolicy>,

    /// Write the effective settings back to stemdeck.json
    #[arg(long)]
    save_settings: bool,
}

fn parse_duration(value: &str) -> Result<DurationPolicy, String> {
    match value {
        "shortest" => Ok(DurationPolicy::Shortest),
        "longest" => Ok(DurationPolicy::Longest),
        "strict" => Ok(DurationPolicy::Strict),
        secs => secs
            .parse::<f64>()
            .ok()
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(DurationPolicy::Fixed)
            .ok_or_else(|| format!("invalid duration: {}", secs)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Play,
    Pause,
    Stop,
    Loop,
    Mute(usize),
    Seek(f64),
    Drag(f64),
    Move(f64),
    Release,
    Status,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let name = words.next().unwrap_or("");
    let mut number = || -> Result<f64, String> {
        words
            .next()
            .ok_or_else(|| format!("'{}' needs an argument", name))?
            .parse::<f64>()
            .map_err(|e| format!("bad number: {}", e))
    };

    match name {
        "play" | "p" => Ok(Command::Play),
        "pause" => Ok(Command::Pause),
        "stop" | "s" => Ok(Command::Stop),
        "loop" | "l" => Ok(Command::Loop),
        "mute" | "m" => {
            let track = number()?;
            if track < 1.0 || track.fract() != 0.0 {
                return Err(format!("bad track number: {}", track));
            }
            // Users count tracks from 1
            Ok(Command::Mute(track as usize - 1))
        }
        "seek" => Ok(Command::Seek(number()?)),
        "drag" => Ok(Command::Drag(number()?)),
        "move" => Ok(Command::Move(number()?)),
        "release" => Ok(Command::Release),
        "status" | "" => Ok(Command::Status),
        "help" | "?" => Ok(Command::Help),
        "quit" | "q" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{}', try 'help'", other)),
    }
}

const HELP: &str = "\
commands:
  play | pause | stop | loop
  mute <n>        toggle mute of track n (1-based)
  seek <0..1>     jump to a position
  drag <x>        press on the track area at x
  move <x>        drag to x
  release         let go and seek there
  status | help | quit";

/// Apply one command. Returns false when the user asked to quit.
fn apply<B: stemdeck_lib::transport::AudioBackend>(
    player: &mut Player<B>,
    command: Command,
) -> stemdeck_lib::Result<bool> {
    match command {
        Command::Play => player.play()?,
        Command::Pause => player.pause()?,
        Command::Stop => player.stop()?,
        Command::Loop => player.toggle_loop()?,
        Command::Mute(track) => player.toggle_mute(TrackId(track))?,
        Command::Seek(position) => player.seek_to(position)?,
        Command::Drag(x) => player.begin_drag(x),
        Command::Move(x) => player.update_drag(x),
        Command::Release => {
            player.end_drag()?;
        }
        Command::Status => print_status(player),
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn print_status<B: stemdeck_lib::transport::AudioBackend>(player: &Player<B>) {
    println!();
    println!(
        "{:?}, loop {}, {:.2}s / {:.2}s",
        player.phase(),
        if player.is_looping() { "on" } else { "off" },
        player.elapsed(),
        player.total_duration().unwrap_or(0.0)
    );
    for track in player.tracks() {
        println!(
            "  track {:>2}: {}",
            track.id.0 + 1,
            if track.muted { "muted" } else { "on" }
        );
    }
}

fn draw_cursor(sample: CursorSample, phase: Phase, total: f64) {
    let filled = ((sample.position * BAR_WIDTH as f64).round() as usize).min(BAR_WIDTH);
    let bar: String = (0..BAR_WIDTH)
        .map(|i| if i < filled { '=' } else { '-' })
        .collect();
    print!(
        "\r[{}] {:6.2}s {:?}{}   ",
        bar,
        sample.position * total,
        phase,
        if matches!(sample.source, stemdeck_lib::CursorSource::DragOverride) {
            " (dragging)"
        } else {
            ""
        }
    );
    let _ = std::io::stdout().flush();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut settings =
        PlayerSettings::load(&args.settings_dir).context("Failed to load settings")?;
    if let Some(duration) = args.duration {
        settings.transport.duration = duration;
    }
    if args.looping {
        settings.transport.loop_on_start = true;
    }
    if args.save_settings {
        settings
            .save(&args.settings_dir)
            .context("Failed to save settings")?;
    }

    let output = AudioOutput::new(settings.output.ring_capacity)
        .map_err(PlayerError::Output)
        .context("Failed to open audio output")?;

    let decoder = SymphoniaDecoder {
        target_sample_rate: settings.output.resample.then(|| output.sample_rate()),
    };

    let mut player = Player::new(output, &settings);
    let assets = AssetSet::load(&args.stems, decoder, settings.transport.duration)
        .await
        .context("Failed to load stems")?;
    let total = assets.total_duration();
    player.attach(assets);

    println!("{} tracks loaded, {:.2}s. Type 'help' for commands.", args.stems.len(), total);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut frames = tokio::time::interval(settings.cursor.frame_interval());
    frames.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = frames.tick() => {
                if let Some(sample) = player.tick() {
                    draw_cursor(sample, player.phase(), total);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let command = match parse_command(line.trim()) {
                    Ok(command) => command,
                    Err(message) => {
                        println!("{}", message);
                        continue;
                    }
                };
                match apply(&mut player, command) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("{}", e),
                }
            }
        }
    }

    player.stop().ok();
    println!();
    Ok(())
}
