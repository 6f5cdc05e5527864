use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use dome_core::{
    source::DirectoryStore, AudioArbiter, DomeError, EngineConfig, FragmentDescriptor, ItemId,
    MemoryDevice, PcmClip, ProximityPolicy, SourceRequest, ToneProfile,
};
use tracing_subscriber::EnvFilter;

mod sim;
mod speech;

use sim::Simulation;
use speech::VoiceRssService;

/// Fragment time left after the sentence request in `say --item`.
const SAY_OVER_TAIL_MS: u32 = 10_000;

fn main() -> dome_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };

    let sim = match cli.command {
        Commands::Tone(args) => run_tone(&config, &cli.run, args)?,
        Commands::Clip {
            path,
            amplitude,
            max_ms,
        } => run_clip(&config, &cli.run, &path, amplitude, max_ms)?,
        Commands::Fragment {
            fragment,
            stop_after_ms,
            stop_fade_ms,
        } => run_fragment(&config, &cli.run, fragment, stop_after_ms, stop_fade_ms)?,
        Commands::Say {
            text,
            language,
            voice,
            root,
            item,
            after_ms,
        } => {
            let over = root.zip(item);
            run_say(&config, &cli.run, &text, &language, &voice, over, after_ms)?
        }
        Commands::Sonar {
            distances,
            step_ms,
            clip,
        } => run_sonar(&config, &cli.run, &distances, step_ms, clip.as_deref())?,
    };

    let capture = sim.capture();
    capture.write_wav(&cli.run.output)?;
    tracing::info!(
        output = %cli.run.output.display(),
        duration_ms = capture.duration_ms(),
        virtual_ms = sim.now_ms(),
        "render written"
    );
    Ok(())
}

fn simulation(mut arbiter: AudioArbiter<MemoryDevice>, config: &EngineConfig, run: &RunArgs) -> Simulation {
    arbiter.set_user_level(run.level);
    Simulation::new(arbiter, config, run.max_ms)
}

fn run_tone(config: &EngineConfig, run: &RunArgs, args: ToneArgs) -> dome_core::Result<Simulation> {
    let profile = match args.distance {
        Some(distance) => ProximityPolicy::new(config.proximity.clone())
            .tone_profile(distance)
            .ok_or(DomeError::InvalidInput("distance outside the proximity range"))?,
        None => ToneProfile {
            start_hz: args.start_hz,
            end_hz: args.end_hz,
            duration_ms: args.duration_ms,
            amplitude: args.amplitude,
            noise: args.noise,
        },
    };
    tracing::info!(?profile, "rendering tone");

    let mut sim = simulation(AudioArbiter::new(MemoryDevice::new(), config), config, run);
    require(sim.runtime().request(SourceRequest::Tone(profile)), "tone")?;
    sim.run_until_idle();
    Ok(sim)
}

fn run_clip(
    config: &EngineConfig,
    run: &RunArgs,
    path: &Path,
    amplitude: f32,
    max_ms: Option<u32>,
) -> dome_core::Result<Simulation> {
    let clip = PcmClip::from_wav_path(path, config.audio.clip_sample_rate)?;

    let mut sim = simulation(AudioArbiter::new(MemoryDevice::new(), config), config, run);
    let request = SourceRequest::PcmClip {
        clip,
        amplitude,
        max_ms,
    };
    require(sim.runtime().request(request), "pcm clip")?;
    sim.run_until_idle();
    Ok(sim)
}

fn run_fragment(
    config: &EngineConfig,
    run: &RunArgs,
    fragment: FragmentArgs,
    stop_after_ms: Option<u32>,
    stop_fade_ms: Option<u32>,
) -> dome_core::Result<Simulation> {
    let (store, descriptor) = fragment.resolve();
    let arbiter = AudioArbiter::new(MemoryDevice::new(), config).with_store(store);

    let mut sim = simulation(arbiter, config, run);
    require(sim.runtime().request(SourceRequest::Fragment(descriptor)), "fragment")?;
    if let Some(after) = stop_after_ms {
        sim.run_for(after);
        tracing::info!(at_ms = sim.now_ms(), ?stop_fade_ms, "stopping fragment");
        sim.runtime().stop(stop_fade_ms);
    }
    sim.run_until_idle();
    Ok(sim)
}

fn run_say(
    config: &EngineConfig,
    run: &RunArgs,
    text: &str,
    language: &str,
    voice: &str,
    over: Option<(PathBuf, ItemId)>,
    after_ms: u32,
) -> dome_core::Result<Simulation> {
    let service = VoiceRssService::from_env(language, voice)?;
    let mut arbiter = AudioArbiter::new(MemoryDevice::new(), config).with_speech(service);

    let mut descriptor = None;
    if let Some((root, item)) = over {
        arbiter = arbiter.with_store(DirectoryStore::new(root));
        descriptor = Some(FragmentDescriptor {
            item,
            start_offset_ms: 0,
            duration_ms: after_ms.saturating_add(SAY_OVER_TAIL_MS),
            fade_ms: 1_000,
        });
    }

    let mut sim = simulation(arbiter, config, run);
    if let Some(descriptor) = descriptor {
        require(sim.runtime().request(SourceRequest::Fragment(descriptor)), "fragment")?;
        sim.run_for(after_ms);
    }
    require(sim.runtime().request(SourceRequest::Sentence(text.to_string())), "sentence")?;
    sim.run_until_idle();
    Ok(sim)
}

fn run_sonar(
    config: &EngineConfig,
    run: &RunArgs,
    distances: &[f32],
    step_ms: u32,
    clip: Option<&Path>,
) -> dome_core::Result<Simulation> {
    let clip = clip
        .map(|path| PcmClip::from_wav_path(path, config.audio.clip_sample_rate))
        .transpose()?;

    let mut sim = simulation(AudioArbiter::new(MemoryDevice::new(), config), config, run);
    sim.runtime().set_ping_clip(clip);
    for &distance in distances {
        tracing::info!(at_ms = sim.now_ms(), distance, "distance reading");
        sim.runtime().notify_distance(distance);
        sim.run_for(step_ms);
    }
    sim.runtime().silence_pings();
    sim.run_until_idle();
    tracing::info!(pings = sim.runtime().pings().pings(), "sonar run finished");
    Ok(sim)
}

fn require(started: bool, what: &str) -> dome_core::Result<()> {
    if started {
        Ok(())
    } else {
        Err(DomeError::msg(format!("{what} request was refused, see log")))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Accepts `DIR/FILE`, e.g. `3/12` or `003/012`.
fn parse_item(text: &str) -> Result<ItemId, String> {
    let (dir, file) = text
        .split_once('/')
        .ok_or_else(|| format!("expected DIR/FILE, got `{text}`"))?;
    let number = |part: &str| {
        part.trim()
            .parse::<u8>()
            .map_err(|err| format!("`{part}`: {err}"))
    };
    Ok(ItemId::new(number(dir)?, number(file)?))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Dome audio core simulator", long_about = None)]
struct Cli {
    /// JSON file with configuration overrides.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Where to write what the output device received.
    #[arg(short, long, global = true, default_value = "dome-render.wav")]
    output: PathBuf,
    /// Upper bound on simulated time.
    #[arg(long, global = true, default_value_t = 120_000)]
    max_ms: u32,
    /// User volume level in [0, 1].
    #[arg(long, global = true, default_value_t = 1.0)]
    level: f32,
}

#[derive(Args, Debug, Clone)]
struct FragmentArgs {
    /// Content root holding `DDD/FFF.wav` items.
    #[arg(long)]
    root: PathBuf,
    /// Item as DIR/FILE.
    #[arg(long, value_parser = parse_item)]
    item: ItemId,
    #[arg(long, default_value_t = 0)]
    offset_ms: u32,
    #[arg(long, default_value_t = 10_000)]
    duration_ms: u32,
    #[arg(long, default_value_t = 1_000)]
    fade_ms: u32,
}

impl FragmentArgs {
    fn resolve(self) -> (DirectoryStore, FragmentDescriptor) {
        let descriptor = FragmentDescriptor {
            item: self.item,
            start_offset_ms: self.offset_ms,
            duration_ms: self.duration_ms,
            fade_ms: self.fade_ms,
        };
        (DirectoryStore::new(self.root), descriptor)
    }
}

#[derive(Args, Debug)]
struct ToneArgs {
    /// Derive the tone from a distance reading in millimetres instead.
    #[arg(long)]
    distance: Option<f32>,
    #[arg(long, default_value_t = 800.0)]
    start_hz: f32,
    #[arg(long, default_value_t = 1100.0)]
    end_hz: f32,
    #[arg(long, default_value_t = 320.0)]
    duration_ms: f32,
    #[arg(long, default_value_t = 0.4)]
    amplitude: f32,
    #[arg(long, default_value_t = 0.0)]
    noise: f32,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesize one proximity ping.
    Tone(ToneArgs),
    /// Play a short 16-bit mono WAV clip.
    Clip {
        path: PathBuf,
        #[arg(long, default_value_t = 0.6)]
        amplitude: f32,
        /// Cut the clip off after this long.
        #[arg(long)]
        max_ms: Option<u32>,
    },
    /// Play a stored fragment with fades.
    Fragment {
        #[command(flatten)]
        fragment: FragmentArgs,
        /// Request a stop this long after the start.
        #[arg(long)]
        stop_after_ms: Option<u32>,
        /// Fade length for that stop; omit to use the fragment's own.
        #[arg(long, requires = "stop_after_ms")]
        stop_fade_ms: Option<u32>,
    },
    /// Speak a sentence through VoiceRSS (key in VOICERSS_API_KEY).
    Say {
        text: String,
        #[arg(long, default_value = "nl-nl")]
        language: String,
        #[arg(long, default_value = "Bram")]
        voice: String,
        /// Content root of a fragment to start before the sentence.
        #[arg(long, requires = "item")]
        root: Option<PathBuf>,
        /// Fragment item as DIR/FILE; the sentence preempts it.
        #[arg(long, value_parser = parse_item, requires = "root")]
        item: Option<ItemId>,
        /// Delay between the fragment start and the sentence request.
        #[arg(long, default_value_t = 2_000)]
        after_ms: u32,
    },
    /// Feed a series of distance readings to the ping responder.
    Sonar {
        /// Readings in millimetres, comma separated.
        #[arg(long, value_delimiter = ',', required = true)]
        distances: Vec<f32>,
        /// Time spent on each reading.
        #[arg(long, default_value_t = 1_000)]
        step_ms: u32,
        /// Ping with this clip instead of a synthesized tone.
        #[arg(long)]
        clip: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_ids_parse_with_or_without_padding() {
        assert_eq!(parse_item("3/12"), Ok(ItemId::new(3, 12)));
        assert_eq!(parse_item("003/012"), Ok(ItemId::new(3, 12)));
        assert!(parse_item("3").is_err());
        assert!(parse_item("3/300").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
