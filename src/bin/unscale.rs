use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use serde_json::{Value, json};
use unscale::{
    AspectRatio, DetectionOptions, Detector, MediaSource, MemorySource, ProgressCallback,
    ProgressInfo, ScoreResult, SessionSource, StepRange, TesterRegistry, set_ffmpeg_log_level,
};

const CLI_AFTER_HELP: &str = "Examples:\n  unscale info input.mkv --json\n  unscale detect input.mkv 0:2400:240 600:1001:2 --workers 8 --progress\n  unscale detect frames/ 0:4 700:1000:2 --testers bilinear,catrom --threshold 4\n  unscale testers\n  unscale completions zsh > _unscale";

const DETECT_AFTER_HELP: &str = "Each result line is: tester, WxH, frame, score, elapsed, worker.\nThe score column is the round-trip distance to the reference times 100.\nIt is not a bounded percentage: 0 means identical and larger is worse.\n\nExamples:\n  unscale detect input.mkv 0:2400:240 600:1001:2\n  unscale detect input.mkv 1000:1001 700:900 --json --save-frames candidates";

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

#[derive(Debug, Parser)]
#[command(
    name = "unscale",
    version,
    about = "Find the native resolution of upscaled video",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone, Default)]
struct GlobalOptions {
    /// Show debug logging output.
    #[arg(long, global = true)]
    verbose: bool,

    /// Show a progress bar where supported.
    #[arg(long, global = true)]
    progress: bool,

    /// FFmpeg log level (off, error, warn, info, debug, trace).
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Score rescaled frames and report candidate native resolutions.
    #[command(
        about = "Detect candidate native resolutions",
        after_help = DETECT_AFTER_HELP
    )]
    Detect {
        /// Media file, or a directory of still frames.
        input: PathBuf,
        /// Reference frames as start:stop[:step] (stop exclusive).
        frames: String,
        /// Candidate heights as start:stop[:step] (stop exclusive).
        heights: String,
        /// Display aspect ratio used to derive candidate widths.
        #[arg(long, default_value = "16:9")]
        aspect: String,
        /// Worker thread count. Defaults to the number of CPUs.
        #[arg(long)]
        workers: Option<usize>,
        /// Modified z-score above which a change is reported.
        #[arg(long, default_value_t = 5.0)]
        threshold: f64,
        /// Comma-separated testers to run. Defaults to all.
        #[arg(long, value_delimiter = ',')]
        testers: Vec<String>,
        /// Replace each worker after it scored this many items.
        #[arg(long)]
        recycle_after: Option<u64>,
        /// Seconds a worker waits for work before exiting.
        #[arg(long, default_value_t = 5.0)]
        idle_timeout: f64,
        /// Save the candidate frame of every breakpoint into this directory.
        #[arg(long)]
        save_frames: Option<PathBuf>,
        /// Output a machine-readable JSON report instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Print video information for a source.
    #[command(about = "Print source video information", visible_alias = "probe")]
    Info {
        /// Media file, or a directory of still frames.
        input: PathBuf,
        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// List the available testers.
    #[command(about = "List available testers")]
    Testers,

    /// Generate shell completion scripts.
    #[command(about = "Generate shell completion scripts")]
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(global: &GlobalOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format_timestamp(None)
        .target(env_logger::Target::Stderr);
    if global.verbose {
        builder.filter_level(LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(LevelFilter::Info);
    }
    let _ = builder.try_init();

    let ffmpeg_level = match &global.log_level {
        Some(level) => level
            .parse::<LevelFilter>()
            .map_err(|_| format!("unsupported --log-level: {level}"))?,
        None => LevelFilter::Error,
    };
    set_ffmpeg_log_level(ffmpeg_level);
    Ok(())
}

fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            IMAGE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
        })
}

fn open_source(input: &Path) -> Result<Arc<dyn SessionSource>, Box<dyn std::error::Error>> {
    if !input.is_dir() {
        return Ok(Arc::new(MediaSource::new(input)));
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(input)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| is_image_path(path))
        .collect();
    if paths.is_empty() {
        return Err(format!("no image files found in {}", input.display()).into());
    }
    paths.sort();
    Ok(Arc::new(MemorySource::open_images(&paths)?))
}

fn parse_heights(value: &str) -> Result<Vec<u32>, Box<dyn std::error::Error>> {
    let range: StepRange = value.parse()?;
    range
        .values()
        .into_iter()
        .map(|height| {
            u32::try_from(height).map_err(|_| {
                Box::<dyn std::error::Error>::from(format!("height {height} is too large"))
            })
        })
        .collect()
}

fn format_result_line(result: &ScoreResult, started_at: SystemTime) -> String {
    let elapsed = result
        .completed_at
        .duration_since(started_at)
        .unwrap_or_default();
    format!(
        "{}\t{}x{}\t{}\t{:.4}%\t{:.2}secs\tWorker-{}",
        result.tester,
        result.width,
        result.height,
        result.frame,
        result.score * 100.0,
        elapsed.as_secs_f64(),
        result.worker
    )
}

struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.green} {bar:40.cyan/blue} {pos}/{len} {msg} (eta {eta})",
        )?;
        bar.set_style(style.progress_chars("##-"));
        Ok(Self { bar })
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_progress(&self, info: &ProgressInfo) {
        if let Some(total) = info.total {
            self.bar.set_length(total);
        }
        self.bar.set_position(info.current);
        if let (Some(tester), Some(height)) = (&info.last_tester, info.last_height) {
            self.bar.set_message(format!("{height}@{tester}"));
        }
    }
}

struct DetectArgs {
    input: PathBuf,
    frames: String,
    heights: String,
    aspect: String,
    workers: Option<usize>,
    threshold: f64,
    testers: Vec<String>,
    recycle_after: Option<u64>,
    idle_timeout: f64,
    save_frames: Option<PathBuf>,
    json: bool,
}

fn detect(args: DetectArgs, global: &GlobalOptions) -> Result<(), Box<dyn std::error::Error>> {
    let aspect: AspectRatio = args.aspect.parse()?;
    let frames = args.frames.parse::<StepRange>()?.values();
    let heights = parse_heights(&args.heights)?;
    if !args.idle_timeout.is_finite() || args.idle_timeout <= 0.0 {
        return Err("--idle-timeout must be a positive number of seconds".into());
    }
    if !args.threshold.is_finite() {
        return Err("--threshold must be a finite number".into());
    }

    let defaults = TesterRegistry::with_defaults();
    let registry = if args.testers.is_empty() {
        defaults
    } else {
        defaults.select(args.testers.as_slice())?
    };
    let registry = Arc::new(registry);

    let mut options = DetectionOptions::new()
        .with_aspect_ratio(aspect)
        .with_idle_timeout(Duration::from_secs_f64(args.idle_timeout));
    if let Some(workers) = args.workers {
        options = options.with_workers(workers);
    }
    if let Some(items) = args.recycle_after {
        options = options.with_recycle_after(items);
    }

    let progress = if global.progress {
        let progress = Arc::new(TerminalProgress::new()?);
        options = options.with_progress(progress.clone());
        Some(progress)
    } else {
        None
    };

    let source = open_source(&args.input)?;
    let detector = Detector::new(source, Arc::clone(&registry), options)?;

    let started_at = SystemTime::now();
    let mut results: Vec<Value> = Vec::new();
    let bar = progress.as_ref().map(|progress| progress.bar.clone());
    let report = detector.run(&frames, &heights, |result| {
        if args.json {
            results.push(json!({
                "tester": &*result.tester,
                "width": result.width,
                "height": result.height,
                "frame": result.frame,
                "score": result.score,
                "worker": result.worker,
            }));
            return;
        }
        let line = format_result_line(result, started_at);
        match &bar {
            Some(bar) => bar.suspend(|| println!("{line}")),
            None => println!("{line}"),
        }
    })?;
    if let Some(progress) = &progress {
        progress.bar.finish_with_message("done");
    }

    let breakpoints = report.breakpoints(args.threshold);

    let mut saved = Vec::new();
    if let Some(directory) = &args.save_frames {
        fs::create_dir_all(directory)?;
        for breakpoint in &breakpoints {
            for &frame in &frames {
                let image = detector.render_candidate(&breakpoint.tester, breakpoint.height, frame)?;
                let path = directory.join(format!(
                    "{}@{}_frame_{frame:06}.png",
                    breakpoint.height, breakpoint.tester
                ));
                image.save(&path)?;
                if global.verbose {
                    eprintln!("saved {}", path.display());
                }
                saved.push(path);
            }
        }
    }

    if args.json {
        let payload = json!({
            "video": {
                "width": report.video.width,
                "height": report.video.height,
                "frame_count": report.video.frame_count,
                "fps": report.video.frames_per_second,
                "codec": report.video.codec,
            },
            "threshold": args.threshold,
            "results": results,
            "breakpoints": breakpoints.iter().map(|breakpoint| json!({
                "tester": &*breakpoint.tester,
                "height": breakpoint.height,
                "score": breakpoint.score,
            })).collect::<Vec<_>>(),
            "delivered": report.delivered,
            "lost_items": report.lost_items,
            "restarts": report.restarts,
            "elapsed_seconds": report.elapsed.as_secs_f64(),
            "saved_frames": saved.iter().map(|path| path.display().to_string()).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    if report.lost_items > 0 {
        eprintln!(
            "{} {}",
            "warning:".yellow().bold(),
            format!("{} item(s) lost with crashed workers", report.lost_items).yellow()
        );
    }

    if breakpoints.is_empty() {
        println!(
            "{} {}",
            "result:".bold(),
            format!("no breakpoints above threshold {}", args.threshold).dimmed()
        );
    }
    for breakpoint in &breakpoints {
        let color = registry
            .get(&breakpoint.tester)
            .map(|entry| entry.color.clone())
            .unwrap_or_else(|| "white".to_string());
        println!(
            "{}",
            format!(
                "{}@{} | {:.2}%",
                breakpoint.height,
                breakpoint.tester,
                breakpoint.score * 100.0
            )
            .color(color.as_str())
            .bold()
        );
    }

    println!(
        "{} {}",
        "success:".green().bold(),
        format!(
            "Scored {} item(s) in {:.2}s",
            report.delivered,
            report.elapsed.as_secs_f64()
        )
        .green()
    );
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli.global)?;

    match cli.command {
        Commands::Detect {
            input,
            frames,
            heights,
            aspect,
            workers,
            threshold,
            testers,
            recycle_after,
            idle_timeout,
            save_frames,
            json,
        } => detect(
            DetectArgs {
                input,
                frames,
                heights,
                aspect,
                workers,
                threshold,
                testers,
                recycle_after,
                idle_timeout,
                save_frames,
                json,
            },
            &cli.global,
        )?,
        Commands::Info { input, json } => {
            let source = open_source(&input)?;
            let session = source.open()?;
            let info = session.video_info();
            if json {
                let payload = json!({
                    "source": source.describe(),
                    "width": info.width,
                    "height": info.height,
                    "frame_count": info.frame_count,
                    "fps": info.frames_per_second,
                    "codec": info.codec,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("Source: {}", source.describe());
                println!(
                    "Video: {}x{} @ {:.3} fps [{}]",
                    info.width, info.height, info.frames_per_second, info.codec
                );
                println!("Frames: {}", info.frame_count);
            }
        }
        Commands::Testers => {
            for entry in TesterRegistry::with_defaults().iter() {
                println!(
                    "{}\t{}",
                    entry.name.color(entry.color.as_str()).bold(),
                    entry.color
                );
            }
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "unscale", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("{} {error}", "error:".red().bold());
        std::process::exit(1);
    }
}
