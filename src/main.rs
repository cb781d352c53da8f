use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use open_screencap::capture::{CaptureRect, FfmpegEngineFactory};
use open_screencap::recorder::LifecycleEvent;
use open_screencap::storage::SessionFileManager;
use open_screencap::utils::ErrorResponse;
use open_screencap::{
    CaptureMode, CaptureTarget, ExportPipeline, ExportQuality, SessionCoordinator, UserSettings,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "open-screencap")]
#[command(about = "Record the screen to MP4 or GIF", version)]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a session; Ctrl+C stops it
    Record {
        #[arg(short, long, value_enum, default_value = "video")]
        mode: ModeArg,

        /// fullscreen, display:ID, window:ID or area:X,Y,WxH@DISPLAY
        #[arg(short, long, default_value = "fullscreen", value_parser = parse_target)]
        target: CaptureTarget,

        /// Stop automatically after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Overrides the configured output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Convert a finished recording to an animated GIF
    Export {
        input: PathBuf,

        #[arg(short, long, value_enum, default_value = "medium")]
        quality: QualityArg,
    },

    /// Show which capture devices and encoders ffmpeg offers
    Capabilities,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Video,
    #[value(alias = "gif")]
    DerivedImage,
}

impl From<ModeArg> for CaptureMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Video => CaptureMode::Video,
            ModeArg::DerivedImage => CaptureMode::DerivedImage,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum QualityArg {
    Low,
    Medium,
    High,
    Original,
}

impl From<QualityArg> for ExportQuality {
    fn from(quality: QualityArg) -> Self {
        match quality {
            QualityArg::Low => ExportQuality::Low,
            QualityArg::Medium => ExportQuality::Medium,
            QualityArg::High => ExportQuality::High,
            QualityArg::Original => ExportQuality::Original,
        }
    }
}

fn parse_target(value: &str) -> Result<CaptureTarget, String> {
    let parse_id = |id: &str| {
        id.trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid id: {id}"))
    };

    if value == "fullscreen" {
        return Ok(CaptureTarget::fullscreen());
    }
    if let Some(id) = value.strip_prefix("display:") {
        return Ok(CaptureTarget::Fullscreen {
            display_id: Some(parse_id(id)?),
        });
    }
    if let Some(id) = value.strip_prefix("window:") {
        return Ok(CaptureTarget::Window {
            window_id: parse_id(id)?,
        });
    }
    if let Some(area) = value.strip_prefix("area:") {
        let invalid = || format!("expected area:X,Y,WxH@DISPLAY, got {value}");
        let (rect, display) = area.split_once('@').ok_or_else(invalid)?;
        let (x, rest) = rect.split_once(',').ok_or_else(invalid)?;
        let (y, size) = rest.split_once(',').ok_or_else(invalid)?;
        let (width, height) = size.split_once('x').ok_or_else(invalid)?;
        let number = |n: &str| n.trim().parse::<f64>().map_err(|_| invalid());

        return Ok(CaptureTarget::Area {
            rect: CaptureRect {
                x: number(x)?,
                y: number(y)?,
                width: number(width)?,
                height: number(height)?,
            },
            display_id: parse_id(display)?,
        });
    }

    Err(format!("unknown target: {value}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    open_screencap::init_tracing();

    let cli = Cli::parse();
    let settings = UserSettings::load(cli.config.as_deref()).context("failed to load settings")?;

    info!("Open ScreenCap v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Record {
            mode,
            target,
            seconds,
            output_dir,
        } => {
            let mut settings = settings;
            if let Some(dir) = output_dir {
                settings.output_dir = dir;
            }
            record(settings, mode.into(), target, seconds).await
        }
        Command::Export { input, quality } => export(settings, input, quality.into()).await,
        Command::Capabilities => capabilities(settings).await,
    }
}

async fn record(
    settings: UserSettings,
    mode: CaptureMode,
    target: CaptureTarget,
    seconds: Option<u64>,
) -> Result<()> {
    let coordinator = SessionCoordinator::from_settings(settings);
    report_orphans(coordinator.files());

    let mut termination = Termination::register()?;
    let mut watcher = tokio::spawn(watch_events(coordinator.subscribe()));
    if let Err(e) = coordinator.start(mode, target).await {
        watcher.abort();
        let response = ErrorResponse::from(e);
        bail!("{}: {}", response.code, response.message);
    }

    let first = tokio::select! {
        _ = stop_signal(seconds) => Phase::Stop,
        _ = termination.recv() => Phase::Terminate,
        ended = &mut watcher => Phase::Ended(ended),
    };

    let terminal = match first {
        Phase::Ended(ended) => ended?,
        Phase::Terminate => {
            coordinator.shutdown().await;
            watcher.await?
        }
        Phase::Stop => {
            coordinator.stop().await?;
            // a second Ctrl+C or a termination request abandons the export
            let finished = tokio::select! {
                ended = &mut watcher => Some(ended),
                _ = tokio::signal::ctrl_c() => None,
                _ = termination.recv() => None,
            };
            match finished {
                Some(ended) => ended?,
                None => {
                    coordinator.shutdown().await;
                    watcher.await?
                }
            }
        }
    };

    match terminal {
        Some(LifecycleEvent::Completed { output, .. }) => {
            println!("{}", output.display());
            Ok(())
        }
        Some(LifecycleEvent::Failed { reason, .. }) => {
            if let Some(path) = &reason.salvaged_path {
                println!("{}", path.display());
            }
            let response = ErrorResponse::from(&reason);
            bail!("{}: {}", response.code, response.message)
        }
        Some(LifecycleEvent::Cancelled { .. }) => bail!("recording cancelled"),
        _ => bail!("session ended without a result"),
    }
}

enum Phase {
    Stop,
    Terminate,
    Ended(Result<Option<LifecycleEvent>, tokio::task::JoinError>),
}

/// Requests to end the process, which take the cancel path
#[cfg(unix)]
struct Termination {
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Termination {
    fn register() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate()).context("failed to watch SIGTERM")?,
            hangup: signal(SignalKind::hangup()).context("failed to watch SIGHUP")?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.terminate.recv() => info!("Received SIGTERM"),
            _ = self.hangup.recv() => info!("Received SIGHUP"),
        }
    }
}

#[cfg(windows)]
struct Termination {
    close: tokio::signal::windows::CtrlClose,
    shutdown: tokio::signal::windows::CtrlShutdown,
}

#[cfg(windows)]
impl Termination {
    fn register() -> Result<Self> {
        use tokio::signal::windows::{ctrl_close, ctrl_shutdown};
        Ok(Self {
            close: ctrl_close().context("failed to watch console close")?,
            shutdown: ctrl_shutdown().context("failed to watch system shutdown")?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.close.recv() => info!("Console closed"),
            _ = self.shutdown.recv() => info!("System shutting down"),
        }
    }
}

#[cfg(not(any(unix, windows)))]
struct Termination;

#[cfg(not(any(unix, windows)))]
impl Termination {
    fn register() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

async fn stop_signal(seconds: Option<u64>) {
    match seconds {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Log lifecycle events until the session's terminal event
async fn watch_events(
    mut events: broadcast::Receiver<LifecycleEvent>,
) -> Option<LifecycleEvent> {
    loop {
        match events.recv().await {
            Ok(event) => {
                match &event {
                    LifecycleEvent::StateChanged { state } => debug!("State: {}", state),
                    LifecycleEvent::Duration { elapsed_ms, .. } => {
                        info!("Recording {}s", elapsed_ms / 1000)
                    }
                    LifecycleEvent::ExportProgress { fraction, .. } => {
                        info!("Exporting {:.0}%", fraction * 100.0)
                    }
                    other => info!("{}", other.name()),
                }
                if event.is_terminal() {
                    return Some(event);
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

fn report_orphans(files: &SessionFileManager) {
    match files.find_orphaned_partials() {
        Ok(orphans) => {
            for path in orphans {
                warn!("Incomplete recording left by a previous run: {:?}", path);
            }
        }
        Err(e) => debug!("Could not scan for incomplete recordings: {}", e),
    }
}

async fn export(settings: UserSettings, input: PathBuf, quality: ExportQuality) -> Result<()> {
    let pipeline = ExportPipeline::new(settings.ffmpeg_path, settings.ffprobe_path);
    let cancel = pipeline.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let output = pipeline
        .export(&input, quality, |progress| {
            debug!("{:?} {:.0}%", progress.stage, progress.fraction * 100.0)
        })
        .await?;
    println!("{}", output.display());
    Ok(())
}

async fn capabilities(settings: UserSettings) -> Result<()> {
    let factory = FfmpegEngineFactory::new(settings.ffmpeg_path, settings.engine);
    let capabilities = factory.capabilities().await;
    let engine = capabilities.select_engine(factory.backend(), settings.engine);

    let report = serde_json::json!({
        "backend": factory.backend().map(|b| b.device_name()),
        "engine": engine.as_ref().ok(),
        "unavailableReason": engine.as_ref().err().map(|e| e.to_string()),
        "capabilities": capabilities,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
