use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use beatmaker_midi::backend_midir::MidirProvider;
use beatmaker_midi::{
    ControllerEvent, MidiEvent, MidiInputListener, MidiSettings, MidiTransport, MockProvider,
    MockTransport, TransportProvider,
};
use beatmaker_sequencer::{Beatmaker, ChannelListener, ElementId, SequencerEvent, SequencerSettings};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{select, Receiver};
use tracing_subscriber::EnvFilter;

/// Clock interval of the mock interface, roughly 100 BPM at 24 PPQN.
const MOCK_CLOCK_INTERVAL: Duration = Duration::from_millis(25);
const MIDI_SETTINGS_FILE: &str = "midi.json";
const SEQUENCER_SETTINGS_FILE: &str = "sequencer.json";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Play(args) => play(args),
        Commands::Monitor(args) => monitor(args),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Step sequencer for external MIDI instruments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the MIDI interfaces found on this machine.
    Devices,
    /// Play a pattern on a MIDI interface.
    Play(PlayArgs),
    /// Print every MIDI event received from an interface.
    Monitor(MonitorArgs),
}

#[derive(Args)]
struct ConnectionArgs {
    /// Use an in-process mock interface instead of real hardware.
    #[arg(long)]
    mock: bool,
    /// Alias of the interface to connect to.
    #[arg(long)]
    interface: Option<String>,
    /// Stop after this many seconds instead of waiting for end of input.
    #[arg(long)]
    seconds: Option<f64>,
    /// Directory holding midi.json and sequencer.json.
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

#[derive(Args)]
struct PlayArgs {
    #[command(flatten)]
    connection: ConnectionArgs,
    /// Tempo in beats per minute.
    #[arg(long)]
    bpm: Option<u32>,
    /// Step pattern for a track, such as `0:x...x...x...x...`.
    #[arg(long = "pattern", value_parser = parse_pattern)]
    patterns: Vec<Pattern>,
    /// Send output from a dedicated thread.
    #[arg(long)]
    async_output: bool,
}

#[derive(Args)]
struct MonitorArgs {
    #[command(flatten)]
    connection: ConnectionArgs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    track: usize,
    steps: Vec<bool>,
}

fn parse_pattern(value: &str) -> Result<Pattern, String> {
    let (track, steps) = value
        .split_once(':')
        .ok_or_else(|| format!("expected TRACK:STEPS, got '{value}'"))?;
    let track = track
        .trim()
        .parse()
        .map_err(|_| format!("'{track}' is not a track number"))?;
    let steps = steps
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '|')
        .map(|c| match c {
            'x' | 'X' => Ok(true),
            '.' | '-' => Ok(false),
            other => Err(format!("unexpected step character '{other}'")),
        })
        .collect::<Result<Vec<_>, _>>()?;
    if steps.is_empty() {
        return Err("pattern has no steps".into());
    }
    Ok(Pattern { track, steps })
}

struct Settings {
    midi: MidiSettings,
    sequencer: SequencerSettings,
    midi_path: Option<PathBuf>,
}

fn load_settings(config_dir: Option<&PathBuf>) -> Settings {
    match config_dir {
        Some(dir) => {
            let midi_path = dir.join(MIDI_SETTINGS_FILE);
            Settings {
                midi: MidiSettings::load_from(&midi_path),
                sequencer: SequencerSettings::load_from(&dir.join(SEQUENCER_SETTINGS_FILE)),
                midi_path: Some(midi_path),
            }
        }
        None => Settings {
            midi: beatmaker_midi::config::load(),
            sequencer: beatmaker_sequencer::config::load(),
            midi_path: beatmaker_midi::config::settings_path(),
        },
    }
}

fn provider(mock: bool, midi: &MidiSettings) -> Box<dyn TransportProvider> {
    if mock {
        let provider = Arc::new(MockProvider::new());
        provider.plug(Arc::new(
            MockTransport::new("mock:0", "Mock").with_clock(MOCK_CLOCK_INTERVAL),
        ));
        Box::new(provider)
    } else {
        Box::new(MidirProvider::new().with_poll_interval(midi.rescan_interval()))
    }
}

fn create_context(connection: &ConnectionArgs, settings: Settings) -> Result<Beatmaker> {
    let Settings {
        mut midi,
        sequencer,
        midi_path,
    } = settings;
    if let Some(alias) = &connection.interface {
        midi.preferred_interface = alias.clone();
    }
    let provider = provider(connection.mock, &midi);
    let app = Beatmaker::create(provider, midi, sequencer, midi_path)?;
    app.startup()?;

    if let Some(alias) = &connection.interface {
        if app.controller().current_interface().as_deref() != Some(alias.as_str()) {
            app.controller()
                .connect_alias(alias)
                .with_context(|| format!("failed to connect to '{alias}'"))?;
        }
    }
    match app.controller().current_interface() {
        Some(alias) => println!("Connected to {alias}"),
        None => println!("No MIDI interface connected, waiting for one to appear"),
    }
    Ok(app)
}

fn list_devices() -> Result<()> {
    let transports = MidirProvider::new()
        .query()
        .context("failed to query MIDI interfaces")?;
    if transports.is_empty() {
        println!("No MIDI interfaces found.");
        return Ok(());
    }
    println!("{:<32} {:<40} {:>5} {:>6}", "ALIAS", "ID", "IN", "OUT");
    for transport in transports {
        transport.detect_ports();
        println!(
            "{:<32} {:<40} {:>5} {:>6}",
            transport.alias(),
            transport.id(),
            yes_no(transport.default_input().is_some()),
            yes_no(transport.default_output().is_some()),
        );
    }
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn play(args: PlayArgs) -> Result<()> {
    let mut settings = load_settings(args.connection.config_dir.as_ref());
    if let Some(bpm) = args.bpm {
        if bpm == 0 {
            bail!("tempo must be greater than zero");
        }
        settings.sequencer.bpm = bpm;
    }
    if args.async_output {
        settings.midi.output_async = true;
    }

    let app = create_context(&args.connection, settings)?;
    let sequencer = app.sequencer();
    for pattern in &args.patterns {
        if pattern.track >= sequencer.num_tracks() {
            bail!(
                "track {} is out of range, the pattern has {} tracks",
                pattern.track,
                sequencer.num_tracks()
            );
        }
        for (step, active) in pattern.steps.iter().take(sequencer.num_steps()).enumerate() {
            sequencer.set_active(
                ElementId::Step {
                    track: pattern.track,
                    step,
                },
                *active,
            );
        }
    }

    let (tx, rx) = crossbeam_channel::bounded(256);
    let listener = sequencer.add_listener(Arc::new(ChannelListener::new(tx)));
    sequencer.start();
    println!("Playing at {} BPM", app.metrics().bpm());

    let events = app.controller().events();
    run_until_done(args.connection.seconds, |timeout| {
        select! {
            recv(rx) -> event => {
                if let Ok(SequencerEvent::Position { position, .. }) = event {
                    let active: String = sequencer
                        .tracks()
                        .iter()
                        .map(|track| if track.is_step_active(position.step) { 'x' } else { '.' })
                        .collect();
                    println!("{position}  {active}");
                }
            }
            recv(events) -> event => {
                if let Ok(event) = event {
                    print_controller_event(&event);
                }
            }
            default(timeout) => {}
        }
    });

    sequencer.stop();
    sequencer.remove_listener(listener);
    app.shutdown();
    Ok(())
}

struct PrintEvents;

impl MidiInputListener for PrintEvents {
    fn on_event(&self, event: &MidiEvent) {
        if *event != MidiEvent::Clock {
            println!("{event:?}");
        }
    }
}

fn monitor(args: MonitorArgs) -> Result<()> {
    let settings = load_settings(args.connection.config_dir.as_ref());
    let app = create_context(&args.connection, settings)?;
    let listener = app.controller().add_input_listener(Arc::new(PrintEvents));

    let dispatcher = app.controller().dispatcher();
    let events = app.controller().events();
    let mut last_bpm = 0;
    run_until_done(args.connection.seconds, |timeout| {
        if let Ok(event) = events.recv_timeout(timeout) {
            print_controller_event(&event);
        }
        let bpm = dispatcher.recovered_bpm();
        if bpm != last_bpm {
            println!("Clock tempo: {bpm} BPM");
            last_bpm = bpm;
        }
    });

    app.controller().remove_input_listener(listener);
    app.shutdown();
    Ok(())
}

fn print_controller_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::InterfaceAdded { alias, id } => println!("Interface added: {alias} ({id})"),
        ControllerEvent::InterfaceRemoved { alias, id } => {
            println!("Interface removed: {alias} ({id})")
        }
        ControllerEvent::Connected { alias } => println!("Connected to {alias}"),
        ControllerEvent::Disconnected { alias } => println!("Disconnected from {alias}"),
        ControllerEvent::ConnectFailed { alias, reason } => {
            println!("Failed to connect to {alias}: {reason}")
        }
    }
}

/// Calls `poll` with a short timeout until `seconds` elapse, or until
/// standard input is closed when no duration is given.
fn run_until_done(seconds: Option<f64>, mut poll: impl FnMut(Duration)) {
    const POLL: Duration = Duration::from_millis(100);

    let deadline = seconds.map(|seconds| Instant::now() + Duration::from_secs_f64(seconds.max(0.0)));
    let stdin_closed = match deadline {
        Some(_) => None,
        None => {
            println!("Press Enter or Ctrl-D to stop");
            Some(watch_stdin())
        }
    };

    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }
        if let Some(closed) = &stdin_closed {
            if closed.try_recv().is_ok() {
                break;
            }
        }
        poll(POLL);
    }
}

fn watch_stdin() -> Receiver<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        let _ = tx.send(());
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_track_patterns() {
        assert_eq!(
            parse_pattern("2:x..X|-.x.").unwrap(),
            Pattern {
                track: 2,
                steps: vec![true, false, false, true, false, false, true, false],
            }
        );
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert!(parse_pattern("x...").is_err());
        assert!(parse_pattern("a:x...").is_err());
        assert!(parse_pattern("0:x.o.").is_err());
        assert!(parse_pattern("0:").is_err());
    }

    #[test]
    fn explicit_config_dir_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = SequencerSettings {
            bpm: 93,
            ..SequencerSettings::default()
        };
        sequencer.save_to(&dir.path().join(SEQUENCER_SETTINGS_FILE));

        let settings = load_settings(Some(&dir.path().to_path_buf()));
        assert_eq!(settings.sequencer.bpm, 93);
        assert_eq!(settings.midi, MidiSettings::default());
        assert_eq!(settings.midi_path, Some(dir.path().join(MIDI_SETTINGS_FILE)));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
