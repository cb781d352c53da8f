//! Session coordinator
//!
//! Owns the single active session and drives the state machine in lockstep
//! with the capture engine, the session files and the GIF export. Every
//! session ends in exactly one terminal event and the machine is back in
//! idle before the next `start` can proceed.

use crate::capture::{
    CaptureTarget, ContentProvider, DisplayCatalog, EngineEvent, EngineFactory,
    FfmpegEngineFactory, RecordingConfig,
};
use crate::export::{ExportCancel, ExportError, ExportPipeline, ExportQuality, SourceInfo};
use crate::recorder::events::{LifecycleEvent, LIFECYCLE_EVENT_CAPACITY};
use crate::recorder::session::{Session, SessionHandle, SessionSnapshot};
use crate::recorder::state::{
    CaptureMode, IllegalTransition, SessionEvent, SessionState, SessionStateMachine,
};
use crate::settings::UserSettings;
use crate::storage::manager::remove_quietly;
use crate::storage::{FileError, RecordingMetadata, SessionFileManager};
use crate::utils::error::{FailureCode, FailureReason, SessionError, SessionResult};
use chrono::Utc;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Interval of `Duration` events while recording
const DURATION_TICK: Duration = Duration::from_secs(1);

/// Everything `status()` reports, readable without the session lock
#[derive(Debug, Default)]
struct Status {
    machine: SessionStateMachine,
    session_id: Option<Uuid>,
    dropped_frames: u64,
    export_progress: Option<f64>,
    last_failure: Option<FailureReason>,
}

struct ActiveExport {
    session_id: Uuid,
    cancel: ExportCancel,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    export: Option<ActiveExport>,
}

/// How a session ended
enum Outcome {
    Completed {
        output: PathBuf,
        metadata: RecordingMetadata,
    },
    Failed(FailureReason),
    Cancelled,
}

/// Inputs of a spawned GIF export
struct ExportJob {
    session_id: Uuid,
    video: PathBuf,
    video_metadata: RecordingMetadata,
    quality: ExportQuality,
    source: SourceInfo,
    keep_video: bool,
    pipeline: ExportPipeline,
}

struct Shared {
    /// Single writer for every transition
    inner: Mutex<Inner>,
    status: RwLock<Status>,
    events: broadcast::Sender<LifecycleEvent>,
    settings: RwLock<UserSettings>,
    engines: Arc<dyn EngineFactory>,
    content: Arc<dyn ContentProvider>,
    files: SessionFileManager,
    export: ExportPipeline,
}

/// Orchestrates recording sessions
///
/// Cloning is cheap; all clones drive the same session.
#[derive(Clone)]
pub struct SessionCoordinator {
    shared: Arc<Shared>,
}

impl SessionCoordinator {
    pub fn new(
        engines: Arc<dyn EngineFactory>,
        content: Arc<dyn ContentProvider>,
        files: SessionFileManager,
        export: ExportPipeline,
        settings: UserSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(LIFECYCLE_EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                status: RwLock::new(Status::default()),
                events,
                settings: RwLock::new(settings),
                engines,
                content,
                files,
                export,
            }),
        }
    }

    /// Coordinator backed by ffmpeg and the displays listed in `settings`
    pub fn from_settings(settings: UserSettings) -> Self {
        Self::new(
            Arc::new(FfmpegEngineFactory::new(
                settings.ffmpeg_path.clone(),
                settings.engine,
            )),
            Arc::new(DisplayCatalog::new(settings.displays.clone())),
            SessionFileManager::new(settings.output_dir.clone()),
            ExportPipeline::new(settings.ffmpeg_path.clone(), settings.ffprobe_path.clone()),
            settings,
        )
    }

    pub fn files(&self) -> &SessionFileManager {
        &self.shared.files
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.events.subscribe()
    }

    /// Current state; never waits on engines or exports
    pub fn status(&self) -> SessionSnapshot {
        let status = self.shared.status.read();
        SessionSnapshot {
            session_id: status.session_id,
            state: status.machine.state().clone(),
            elapsed_ms: status.machine.elapsed().as_millis() as u64,
            dropped_frames: status.dropped_frames,
            export_progress: status.export_progress,
            last_failure: status.last_failure.clone(),
        }
    }

    /// Replace the settings used by subsequent sessions
    pub fn update_settings(&self, settings: UserSettings) {
        tracing::debug!("Settings updated");
        *self.shared.settings.write() = settings;
    }

    /// Start a new session
    ///
    /// Fails with `IllegalTransition` unless idle. Any other failure moves
    /// the session through `failed` back to idle before returning.
    pub async fn start(
        &self,
        mode: CaptureMode,
        target: CaptureTarget,
    ) -> SessionResult<SessionHandle> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.transition(SessionEvent::BeginSelection(mode))?;

        let session_id = Uuid::new_v4();
        {
            let mut status = self.shared.status.write();
            status.session_id = Some(session_id);
            status.dropped_frames = 0;
            status.export_progress = None;
            status.last_failure = None;
        }
        tracing::info!("Starting {} session {}", mode, session_id);

        let session = match self.shared.bring_up(session_id, mode, target).await {
            Ok(session) => session,
            Err(error) => {
                self.shared
                    .conclude(session_id, Outcome::Failed(error.to_failure()));
                return Err(error);
            }
        };

        let handle = session.handle();
        inner.session = Some(session);
        let _ = self.shared.events.send(LifecycleEvent::Started { session_id });

        tracing::info!(
            "Recording session {} with the {} engine to {:?}",
            session_id,
            handle.engine,
            handle.partial_path
        );
        Ok(handle)
    }

    /// Stop recording and finalize the output
    ///
    /// Returns once the video is finalized. In derived-image mode the GIF
    /// export then continues in the background and its outcome arrives as a
    /// lifecycle event.
    pub async fn stop(&self) -> SessionResult<()> {
        let mut inner = self.shared.inner.lock().await;
        let Some(mut session) = inner.session.take() else {
            return Err(SessionError::NoActiveSession);
        };
        if let Err(e) = self
            .shared
            .transition(SessionEvent::BeginStopping(session.mode))
        {
            inner.session = Some(session);
            return Err(e.into());
        }

        session.stop_monitor();
        let session_id = session.id;
        tracing::info!("Stopping session {}", session_id);

        let (output, metadata) = match self.shared.finalize(&mut session).await {
            Ok(finalized) => finalized,
            Err(error) => {
                self.shared
                    .conclude(session_id, Outcome::Failed(error.to_failure()));
                return Err(error);
            }
        };
        let _ = self.shared.events.send(LifecycleEvent::Stopped { session_id });

        match session.mode {
            CaptureMode::Video => {
                self.shared
                    .conclude(session_id, Outcome::Completed { output, metadata });
                Ok(())
            }
            CaptureMode::DerivedImage => {
                self.shared
                    .begin_export(&mut inner, &session.config, output, metadata)
            }
        }
    }

    /// Abort the active session or export
    ///
    /// Returns once engine and export processes are gone and partial files
    /// are removed. A finalized intermediate video survives a cancelled
    /// export.
    pub async fn cancel(&self) {
        let mut inner = self.shared.inner.lock().await;

        if let Some(mut session) = inner.session.take() {
            tracing::info!("Cancelling session {}", session.id);
            session.stop_monitor();
            session.engine.cancel().await;
            self.shared.files.discard(&session.temp);
            self.shared.conclude(session.id, Outcome::Cancelled);
            return;
        }

        let Some(export) = inner.export.take() else {
            tracing::debug!("Cancel requested with no active session");
            return;
        };
        // the export task takes the lock when it finishes
        drop(inner);

        tracing::info!("Cancelling export for session {}", export.session_id);
        export.cancel.cancel();
        if let Err(e) = export.task.await {
            tracing::warn!("Export task ended abnormally: {}", e);
        }

        let _inner = self.shared.inner.lock().await;
        self.shared.conclude(export.session_id, Outcome::Cancelled);
    }

    /// Process-termination hook
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down session coordinator");
        self.cancel().await;
    }
}

impl Shared {
    fn transition(&self, event: SessionEvent) -> Result<SessionState, IllegalTransition> {
        let state = self.status.write().machine.transition(event)?;
        let _ = self.events.send(LifecycleEvent::StateChanged {
            state: state.clone(),
        });
        Ok(state)
    }

    /// Selection through recording; cleans up after itself on failure
    async fn bring_up(
        self: &Arc<Self>,
        session_id: Uuid,
        mode: CaptureMode,
        target: CaptureTarget,
    ) -> SessionResult<Session> {
        let settings = self.settings.read().clone();
        let geometry = self
            .content
            .geometry(&target)
            .map_err(|e| SessionError::Configuration(e.to_string()))?;
        let config = RecordingConfig::resolve(mode, target, &settings, &geometry)
            .map_err(|e| SessionError::Configuration(e.to_string()))?;

        self.transition(SessionEvent::BeginStarting(mode))?;

        let temp = self.files.begin_session(session_id)?;
        let mut engine = self.engines.create(&config).await?;
        let engine_events = engine.subscribe();

        if let Err(e) = engine.start(&config, &temp.partial).await {
            self.files.discard(&temp);
            return Err(e.into());
        }
        if let Err(e) = self.transition(SessionEvent::BeginRecording(mode)) {
            engine.cancel().await;
            self.files.discard(&temp);
            return Err(e.into());
        }

        let monitor = tokio::spawn(monitor_engine(
            Arc::downgrade(self),
            session_id,
            engine_events,
        ));

        Ok(Session {
            id: session_id,
            mode,
            config,
            temp,
            engine,
            created_at: Utc::now(),
            monitor: Some(monitor),
        })
    }

    /// Stop the engine and promote its output
    async fn finalize(&self, session: &mut Session) -> SessionResult<(PathBuf, RecordingMetadata)> {
        let handle = match session.engine.stop().await {
            Ok(handle) => handle,
            Err(e) => {
                self.files.discard(&session.temp);
                return Err(e.into());
            }
        };
        self.status.write().dropped_frames = handle.dropped_frames;

        let output = match self.files.finalize(&session.temp) {
            Ok(output) => output,
            Err(e) => {
                // a failed rename leaves the footage where it is
                if !matches!(e, FileError::Rename { .. }) {
                    self.files.discard(&session.temp);
                }
                return Err(e.into());
            }
        };

        let metadata =
            RecordingMetadata::new(session.id, &session.config, &handle, session.created_at);
        if let Err(e) = self.files.write_metadata_sidecar(&output, &metadata) {
            tracing::warn!("Failed to write metadata for {:?}: {}", output, e);
        }
        Ok((output, metadata))
    }

    fn begin_export(
        self: &Arc<Self>,
        inner: &mut Inner,
        config: &RecordingConfig,
        video: PathBuf,
        video_metadata: RecordingMetadata,
    ) -> SessionResult<()> {
        let session_id = video_metadata.session_id;
        if let Err(e) = self.transition(SessionEvent::BeginExport) {
            let error = SessionError::from(e);
            self.conclude(session_id, Outcome::Failed(error.to_failure()));
            return Err(error);
        }
        self.status.write().export_progress = Some(0.0);
        let _ = self.events.send(LifecycleEvent::Exporting { session_id });

        let source = SourceInfo {
            width: Some(video_metadata.width),
            height: Some(video_metadata.height),
            fps: Some(video_metadata.fps as f64),
            duration: Some(Duration::from_secs_f64(
                video_metadata.duration_seconds.max(0.0),
            )),
        };
        let pipeline = self.export.fork();
        let cancel = pipeline.cancel_handle();
        let job = ExportJob {
            session_id,
            video,
            video_metadata,
            quality: config.export_quality,
            source,
            keep_video: self.settings.read().keep_intermediate_video,
            pipeline,
        };

        let task = tokio::spawn(run_export(self.clone(), job));
        inner.export = Some(ActiveExport {
            session_id,
            cancel,
            task,
        });
        Ok(())
    }

    /// Engine failure mid-recording
    async fn fail_recording(&self, session_id: Uuid, message: String) {
        let mut inner = self.inner.lock().await;
        let mut session = match inner.session.take() {
            Some(session) if session.id == session_id => session,
            other => {
                inner.session = other;
                return;
            }
        };
        // this runs on the monitor task itself
        session.monitor.take();

        tracing::error!("Engine failed during session {}: {}", session_id, message);
        let mut reason = FailureReason::new(FailureCode::EngineError, message);
        reason.salvaged_path = self.salvage(&mut session).await;
        self.conclude(session_id, Outcome::Failed(reason));
    }

    /// Promote whatever the failed engine managed to write
    async fn salvage(&self, session: &mut Session) -> Option<PathBuf> {
        let handle = match session.engine.stop().await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Failed engine did not stop cleanly: {}", e);
                session.engine.cancel().await;
                self.files.discard(&session.temp);
                return None;
            }
        };

        match self.files.finalize(&session.temp) {
            Ok(path) => {
                let metadata = RecordingMetadata::new(
                    session.id,
                    &session.config,
                    &handle,
                    session.created_at,
                )
                .salvaged();
                if let Err(e) = self.files.write_metadata_sidecar(&path, &metadata) {
                    tracing::warn!("Failed to write metadata for {:?}: {}", path, e);
                }
                tracing::info!("Salvaged footage to {:?}", path);
                Some(path)
            }
            Err(e @ FileError::Rename { .. }) => {
                tracing::error!("{}; partial kept at {:?}", e, session.temp.partial);
                None
            }
            Err(e) => {
                tracing::debug!("Nothing to salvage: {}", e);
                self.files.discard(&session.temp);
                None
            }
        }
    }

    /// Enter the terminal state, emit its event and return to idle
    fn conclude(&self, session_id: Uuid, outcome: Outcome) {
        let (event, lifecycle, failure) = match outcome {
            Outcome::Completed { output, metadata } => {
                tracing::info!("Session {} completed: {:?}", session_id, output);
                (
                    SessionEvent::MarkCompleted,
                    LifecycleEvent::Completed {
                        session_id,
                        output,
                        metadata,
                    },
                    None,
                )
            }
            Outcome::Failed(reason) => {
                tracing::error!(
                    code = %reason.code,
                    diagnostic_id = %reason.diagnostic_id,
                    "Session {} failed: {}",
                    session_id,
                    reason.message
                );
                (
                    SessionEvent::MarkFailed(reason.clone()),
                    LifecycleEvent::Failed {
                        session_id,
                        reason: reason.clone(),
                    },
                    Some(reason),
                )
            }
            Outcome::Cancelled => {
                tracing::info!("Session {} cancelled", session_id);
                (
                    SessionEvent::MarkCancelled,
                    LifecycleEvent::Cancelled { session_id },
                    None,
                )
            }
        };

        if let Err(e) = self.transition(event) {
            tracing::error!("Session {}: {}", session_id, e);
        }
        let _ = self.events.send(lifecycle);

        {
            let mut status = self.status.write();
            status.session_id = None;
            status.export_progress = None;
            if failure.is_some() {
                status.last_failure = failure;
            }
        }

        if let Err(e) = self.transition(SessionEvent::MarkIdle) {
            tracing::error!("Session {}: {}", session_id, e);
        }
    }
}

/// Forwards engine drops, duration ticks and failures for one session
async fn monitor_engine(
    shared: Weak<Shared>,
    session_id: Uuid,
    mut events: broadcast::Receiver<EngineEvent>,
) {
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + DURATION_TICK, DURATION_TICK);

    loop {
        let event = tokio::select! {
            _ = ticker.tick() => None,
            event = events.recv() => Some(event),
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };

        match event {
            None => {
                let elapsed = shared.status.read().machine.elapsed();
                let _ = shared.events.send(LifecycleEvent::Duration {
                    session_id,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            Some(Ok(EngineEvent::SampleDropped { total })) => {
                shared.status.write().dropped_frames = total;
            }
            Some(Ok(EngineEvent::Errored(message))) => {
                shared.fail_recording(session_id, message).await;
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(RecvError::Lagged(skipped))) => {
                tracing::debug!("Engine monitor skipped {} events", skipped);
            }
            Some(Err(RecvError::Closed)) => return,
        }
    }
}

async fn run_export(shared: Arc<Shared>, job: ExportJob) {
    let session_id = job.session_id;
    let reporter = shared.clone();
    let result = job
        .pipeline
        .export_with_source(&job.video, job.quality, job.source.clone(), move |progress| {
            reporter.status.write().export_progress = Some(progress.fraction);
            let _ = reporter.events.send(LifecycleEvent::ExportProgress {
                session_id,
                fraction: progress.fraction,
            });
        })
        .await;

    let mut inner = shared.inner.lock().await;
    if inner.export.as_ref().map(|e| e.session_id) != Some(session_id) {
        // cancelled; the canceller reports the outcome
        if let Ok(gif) = &result {
            remove_quietly(gif);
        }
        return;
    }
    inner.export = None;

    let outcome = match result {
        Ok(gif) => {
            let metadata = gif_metadata(&job);
            if let Err(e) = shared.files.write_metadata_sidecar(&gif, &metadata) {
                tracing::warn!("Failed to write metadata for {:?}: {}", gif, e);
            }
            if !job.keep_video {
                shared.files.remove_recording(&job.video);
            }
            Outcome::Completed {
                output: gif,
                metadata,
            }
        }
        Err(ExportError::Cancelled) => Outcome::Cancelled,
        Err(e) => {
            tracing::warn!("Export failed; keeping {:?}", job.video);
            Outcome::Failed(SessionError::Export(e).to_failure())
        }
    };
    shared.conclude(session_id, outcome);
}

/// Sidecar contents for the exported GIF
fn gif_metadata(job: &ExportJob) -> RecordingMetadata {
    let preset = job.quality.preset(&job.source);
    let width = preset.output_width(job.source.width);
    let height = match (job.source.width, job.source.height) {
        (Some(w), Some(h)) if w > 0 => (h as f64 * width as f64 / w as f64).round() as u32,
        _ => job.video_metadata.height,
    };

    RecordingMetadata {
        mode: CaptureMode::DerivedImage,
        fps: preset.fps,
        width,
        height,
        ..job.video_metadata.clone()
    }
}
