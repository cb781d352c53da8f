//! Primary capture engine
//!
//! One ffmpeg process grabs the screen and audio, encodes H.264/AAC and
//! writes fragmented MP4 straight to the partial file. Progress lines on
//! stdout report dropped frames; stderr is kept for diagnostics.

use crate::capture::config::RecordingConfig;
use crate::capture::platform::{classify_failure, CaptureBackend};
use crate::capture::traits::{
    AudioFlags, CaptureEngine, EngineError, EngineEvent, EngineKind, FinalizedHandle,
    ENGINE_EVENT_CAPACITY,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// How long the process must survive before the start counts as successful
pub const STARTUP_GRACE: Duration = Duration::from_millis(750);

/// How long a graceful stop may take before the process is killed
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug)]
enum Control {
    Stop,
    Kill,
}

enum Status {
    Idle,
    Running(Running),
    Finished(FinalizedHandle),
    Cancelled,
}

struct Running {
    control: Option<oneshot::Sender<Control>>,
    monitor: JoinHandle<std::io::Result<ExitStatus>>,
    progress: JoinHandle<()>,
    stopping: Arc<AtomicBool>,
    output: PathBuf,
    audio: AudioFlags,
    started_at: Instant,
}

pub struct PrimaryEngine {
    ffmpeg: PathBuf,
    backend: CaptureBackend,
    events: broadcast::Sender<EngineEvent>,
    dropped: Arc<AtomicU64>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    status: Status,
}

impl PrimaryEngine {
    pub fn new(ffmpeg: PathBuf, backend: CaptureBackend) -> Self {
        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        Self {
            ffmpeg,
            backend,
            events,
            dropped: Arc::new(AtomicU64::new(0)),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            status: Status::Idle,
        }
    }

    fn stderr_summary(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tell the monitor to end the process and wait for it
    async fn shut_down(&self, mut running: Running, control: Control) -> Option<ExitStatus> {
        running.stopping.store(true, Ordering::SeqCst);
        if let Some(tx) = running.control.take() {
            let _ = tx.send(control);
        }

        let status = match running.monitor.await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::error!("Failed to wait for ffmpeg: {}", e);
                None
            }
            Err(e) => {
                tracing::error!("ffmpeg monitor task failed: {}", e);
                None
            }
        };
        let _ = running.progress.await;
        status
    }
}

/// Parse `-progress` output, reporting new drops
async fn read_progress(
    stdout: tokio::process::ChildStdout,
    dropped: Arc<AtomicU64>,
    events: broadcast::Sender<EngineEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(value) = line.strip_prefix("drop_frames=") {
            if let Ok(total) = value.trim().parse::<u64>() {
                let previous = dropped.swap(total, Ordering::SeqCst);
                if total > previous {
                    tracing::debug!("ffmpeg dropped {} frames so far", total);
                    let _ = events.send(EngineEvent::SampleDropped { total });
                }
            }
        }
    }
}

async fn read_stderr(stderr: tokio::process::ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "open_screencap::ffmpeg", "{}", line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Own the child until it exits or is told to stop
async fn monitor(
    mut child: Child,
    mut stdin: ChildStdin,
    control: oneshot::Receiver<Control>,
    stopping: Arc<AtomicBool>,
    tail: Arc<Mutex<VecDeque<String>>>,
    events: broadcast::Sender<EngineEvent>,
) -> std::io::Result<ExitStatus> {
    enum Outcome {
        Exited(std::io::Result<ExitStatus>),
        Control(Control),
    }

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        control = control => Outcome::Control(control.unwrap_or(Control::Kill)),
    };

    match outcome {
        Outcome::Exited(status) => {
            let status = status?;
            if !stopping.load(Ordering::SeqCst) {
                let detail = tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");
                tracing::error!("ffmpeg exited unexpectedly ({}): {}", status, detail);
                let _ = events.send(EngineEvent::Errored(format!(
                    "ffmpeg exited unexpectedly ({status}): {detail}"
                )));
            }
            Ok(status)
        }
        Outcome::Control(Control::Stop) => {
            // ffmpeg finishes the file when it reads `q`
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
            drop(stdin);
            match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!("ffmpeg did not stop within {:?}, killing it", STOP_TIMEOUT);
                    child.kill().await?;
                    child.wait().await
                }
            }
        }
        Outcome::Control(Control::Kill) => {
            child.kill().await?;
            child.wait().await
        }
    }
}

#[async_trait]
impl CaptureEngine for PrimaryEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Primary
    }

    async fn start(&mut self, config: &RecordingConfig, output: &Path) -> Result<(), EngineError> {
        match self.status {
            Status::Idle => {}
            Status::Running(_) => return Err(EngineError::AlreadyRecording),
            Status::Finished(_) | Status::Cancelled => return Err(EngineError::NotRecording),
        }

        let command = self.backend.primary_args(config, output);
        tracing::debug!("Spawning {:?} {}", self.ffmpeg, command.args.join(" "));

        let mut child = Command::new(&self.ffmpeg)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::NoCaptureSource(format!("Failed to start ffmpeg: {}", e)))?;

        // `Child::wait` closes any stdin still left in the child
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Process("ffmpeg stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Process("ffmpeg stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Process("ffmpeg stderr unavailable".into()))?;

        let stderr_task = tokio::spawn(read_stderr(stderr, self.stderr_tail.clone()));
        let progress = tokio::spawn(read_progress(
            stdout,
            self.dropped.clone(),
            self.events.clone(),
        ));

        // permission and device problems surface as an immediate exit
        if let Ok(status) = tokio::time::timeout(STARTUP_GRACE, child.wait()).await {
            let status = status?;
            let _ = stderr_task.await;
            let _ = progress.await;
            let detail = self.stderr_summary();
            tracing::error!("ffmpeg exited during startup ({}): {}", status, detail);
            self.status = Status::Cancelled;
            return Err(classify_failure(&detail));
        }

        let (control_tx, control_rx) = oneshot::channel();
        let stopping = Arc::new(AtomicBool::new(false));
        let monitor = tokio::spawn(monitor(
            child,
            stdin,
            control_rx,
            stopping.clone(),
            self.stderr_tail.clone(),
            self.events.clone(),
        ));

        self.status = Status::Running(Running {
            control: Some(control_tx),
            monitor,
            progress,
            stopping,
            output: output.to_path_buf(),
            audio: command.audio,
            started_at: Instant::now(),
        });
        let _ = self.events.send(EngineEvent::Started);

        tracing::info!(
            "Primary engine started: {}x{} @ {}fps, output: {:?}",
            config.output.width,
            config.output.height,
            config.fps,
            output
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<FinalizedHandle, EngineError> {
        match std::mem::replace(&mut self.status, Status::Idle) {
            Status::Finished(handle) => {
                self.status = Status::Finished(handle.clone());
                Ok(handle)
            }
            Status::Idle => Err(EngineError::NotRecording),
            Status::Cancelled => {
                self.status = Status::Cancelled;
                Err(EngineError::NotRecording)
            }
            Status::Running(running) => {
                let duration = running.started_at.elapsed();
                let output = running.output.clone();
                let audio = running.audio;

                match self.shut_down(running, Control::Stop).await {
                    Some(status) if !status.success() => {
                        tracing::warn!(
                            "ffmpeg exited with status {}: {}",
                            status,
                            self.stderr_summary()
                        );
                    }
                    _ => {}
                }

                let handle = FinalizedHandle {
                    path: output,
                    engine: EngineKind::Primary,
                    duration,
                    dropped_frames: self.dropped.load(Ordering::SeqCst),
                    audio,
                };
                tracing::info!(
                    "Primary engine stopped after {:.1}s, {} frames dropped",
                    duration.as_secs_f64(),
                    handle.dropped_frames
                );
                self.status = Status::Finished(handle.clone());
                let _ = self.events.send(EngineEvent::Stopped);
                Ok(handle)
            }
        }
    }

    async fn cancel(&mut self) {
        if let Status::Running(running) = std::mem::replace(&mut self.status, Status::Cancelled) {
            self.shut_down(running, Control::Kill).await;
            tracing::info!("Primary engine cancelled");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Drop for PrimaryEngine {
    fn drop(&mut self) {
        if let Status::Running(running) = &mut self.status {
            running.stopping.store(true, Ordering::SeqCst);
            if let Some(tx) = running.control.take() {
                let _ = tx.send(Control::Kill);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::capture::config::CaptureTarget;
    use crate::capture::content::{ContentProvider, DisplayCatalog};
    use crate::recorder::state::CaptureMode;
    use crate::settings::UserSettings;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config() -> RecordingConfig {
        let target = CaptureTarget::fullscreen();
        let geometry = DisplayCatalog::new(Vec::new()).geometry(&target).unwrap();
        RecordingConfig::resolve(
            CaptureMode::Video,
            target,
            &UserSettings::default(),
            &geometry,
        )
        .unwrap()
    }

    fn backend() -> CaptureBackend {
        CaptureBackend::X11Grab {
            server: ":0.0".into(),
        }
    }

    #[tokio::test]
    async fn test_records_until_quit() {
        let dir = tempdir().unwrap();
        // finishes the file only after reading `q`, outliving the startup grace
        let ffmpeg = stub(
            dir.path(),
            r#"for last; do :; done
printf 'frame=10\ndrop_frames=0\nprogress=continue\n'
printf 'frame=20\ndrop_frames=3\nprogress=continue\n'
cmd=$(head -c 1)
[ "$cmd" = q ] || exit 1
printf 'moov' > "$last"
exit 0
"#,
        );
        let output = dir.path().join("capture.mp4.partial");
        let mut engine = PrimaryEngine::new(ffmpeg, backend());

        engine.start(&config(), &output).await.unwrap();
        let handle = tokio::time::timeout(Duration::from_secs(3), engine.stop())
            .await
            .expect("stop should not wait for the kill timeout")
            .unwrap();

        assert_eq!(handle.path, output);
        assert_eq!(handle.engine, EngineKind::Primary);
        assert_eq!(handle.dropped_frames, 3);
        assert!(handle.audio.system_audio);
        assert_eq!(std::fs::read(&output).unwrap(), b"moov");
        assert_eq!(engine.stop().await.unwrap(), handle);
    }

    #[tokio::test]
    async fn test_stdin_stays_open_while_recording() {
        let dir = tempdir().unwrap();
        // exits as soon as stdin is closed
        let ffmpeg = stub(dir.path(), "cat > /dev/null
exit 0
");
        let mut engine = PrimaryEngine::new(ffmpeg, backend());
        let mut events = engine.subscribe();

        engine
            .start(&config(), &dir.path().join("capture.mp4.partial"))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), EngineEvent::Started);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(events.try_recv().is_err());

        tokio::time::timeout(Duration::from_secs(3), engine.stop())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_early_exit_is_classified() {
        let dir = tempdir().unwrap();
        let ffmpeg = stub(
            dir.path(),
            "echo '[x11grab] Cannot open display :0.0, error 1.' >&2\nexit 1\n",
        );
        let mut engine = PrimaryEngine::new(ffmpeg, backend());
        let result = engine
            .start(&config(), &dir.path().join("capture.mp4.partial"))
            .await;
        assert!(matches!(result, Err(EngineError::NoCaptureSource(_))));

        let ffmpeg = stub(dir.path(), "echo 'Permission denied' >&2\nexit 1\n");
        let mut engine = PrimaryEngine::new(ffmpeg, backend());
        let result = engine
            .start(&config(), &dir.path().join("capture.mp4.partial"))
            .await;
        assert!(matches!(result, Err(EngineError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_unexpected_exit_emits_error() {
        let dir = tempdir().unwrap();
        let ffmpeg = stub(dir.path(), "sleep 1\necho 'device lost' >&2\nexit 1\n");
        let mut engine = PrimaryEngine::new(ffmpeg, backend());
        let mut events = engine.subscribe();

        engine
            .start(&config(), &dir.path().join("capture.mp4.partial"))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), EngineEvent::Started);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, EngineEvent::Errored(_)));
    }

    #[tokio::test]
    async fn test_cancel_then_stop() {
        let dir = tempdir().unwrap();
        let ffmpeg = stub(dir.path(), "exec sleep 30\n");
        let mut engine = PrimaryEngine::new(ffmpeg, backend());

        engine
            .start(&config(), &dir.path().join("capture.mp4.partial"))
            .await
            .unwrap();
        engine.cancel().await;
        engine.cancel().await;
        assert!(matches!(engine.stop().await, Err(EngineError::NotRecording)));
    }
}
