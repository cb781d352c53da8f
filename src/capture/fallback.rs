//! Fallback capture engine
//!
//! A capture thread pulls frames from a `FrameSource` into a bounded queue
//! and a writer thread drains it into a `FrameSink`. When the writer falls
//! behind, the newest frame is dropped and counted instead of blocking the
//! capture side. Video only.

use crate::capture::config::RecordingConfig;
use crate::capture::frames::{CapturedFrame, FrameSink, FrameSource, SinkInterrupt};
use crate::capture::traits::{
    AudioFlags, CaptureEngine, EngineError, EngineEvent, EngineKind, FinalizedHandle,
    ENGINE_EVENT_CAPACITY,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Frames buffered between capture and writer
pub const FRAME_QUEUE_CAPACITY: usize = 8;

enum Status {
    Idle,
    Running(Workers),
    Finished(FinalizedHandle),
    Cancelled,
}

struct Workers {
    running: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    interrupt: Option<SinkInterrupt>,
    capture: JoinHandle<()>,
    writer: JoinHandle<Result<(), EngineError>>,
    output: PathBuf,
    started_at: Instant,
}

pub struct FallbackEngine {
    source: Option<Box<dyn FrameSource>>,
    sink: Option<Box<dyn FrameSink>>,
    events: broadcast::Sender<EngineEvent>,
    dropped: Arc<AtomicU64>,
    status: Status,
}

impl FallbackEngine {
    pub fn new(source: Box<dyn FrameSource>, sink: Box<dyn FrameSink>) -> Self {
        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        Self {
            source: Some(source),
            sink: Some(sink),
            events,
            dropped: Arc::new(AtomicU64::new(0)),
            status: Status::Idle,
        }
    }

    /// Stop both threads; the writer flushes unless `cancel` is set
    async fn join(workers: Workers, cancel: bool) -> Result<(), EngineError> {
        if cancel {
            workers.cancelled.store(true, Ordering::SeqCst);
            if let Some(interrupt) = &workers.interrupt {
                interrupt();
            }
        }
        workers.running.store(false, Ordering::SeqCst);

        if let Err(e) = workers.capture.await {
            tracing::error!("Capture thread panicked: {}", e);
        }
        match workers.writer.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::WriteFailed(format!("writer thread panicked: {e}"))),
        }
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    tx: mpsc::Sender<CapturedFrame>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    events: broadcast::Sender<EngineEvent>,
) {
    while running.load(Ordering::SeqCst) {
        match source.next_frame() {
            Ok(Some(frame)) => match tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = dropped.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = events.send(EngineEvent::SampleDropped { total });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            },
            Ok(None) => {
                if running.load(Ordering::SeqCst) {
                    let _ = events.send(EngineEvent::Errored(
                        "capture source ended unexpectedly".into(),
                    ));
                }
                break;
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    let _ = events.send(EngineEvent::Errored(e.to_string()));
                }
                break;
            }
        }
    }
    source.close();
}

fn writer_loop(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<CapturedFrame>,
    cancelled: Arc<AtomicBool>,
    events: broadcast::Sender<EngineEvent>,
) -> Result<(), EngineError> {
    while let Some(frame) = rx.blocking_recv() {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = sink.write_frame(&frame) {
            if cancelled.load(Ordering::SeqCst) {
                sink.abort();
                return Ok(());
            }
            let _ = events.send(EngineEvent::Errored(e.to_string()));
            sink.abort();
            return Err(e);
        }
    }

    if cancelled.load(Ordering::SeqCst) {
        sink.abort();
        return Ok(());
    }
    sink.finish()
}

#[async_trait]
impl CaptureEngine for FallbackEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Fallback
    }

    async fn start(&mut self, config: &RecordingConfig, output: &Path) -> Result<(), EngineError> {
        match self.status {
            Status::Idle => {}
            Status::Running(_) => return Err(EngineError::AlreadyRecording),
            Status::Finished(_) | Status::Cancelled => return Err(EngineError::NotRecording),
        }
        let (Some(source), Some(sink)) = (self.source.take(), self.sink.take()) else {
            return Err(EngineError::NotRecording);
        };

        if config.wants_audio() {
            tracing::warn!("Fallback engine records video only; audio is skipped");
        }

        let opened = {
            let config = config.clone();
            let output = output.to_path_buf();
            tokio::task::spawn_blocking(move || {
                let mut source = source;
                let mut sink = sink;
                let format = source.open(&config)?;
                if let Err(e) = sink.open(format, &config, &output) {
                    source.close();
                    return Err(e);
                }
                Ok((source, sink))
            })
            .await
            .map_err(|e| EngineError::Process(format!("open task failed: {e}")))?
        };
        let (source, sink) = opened?;
        let interrupt = sink.interrupter();

        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let cancelled = Arc::new(AtomicBool::new(false));

        let capture = {
            let running = running.clone();
            let dropped = self.dropped.clone();
            let events = self.events.clone();
            tokio::task::spawn_blocking(move || capture_loop(source, tx, running, dropped, events))
        };
        let writer = {
            let cancelled = cancelled.clone();
            let events = self.events.clone();
            tokio::task::spawn_blocking(move || writer_loop(sink, rx, cancelled, events))
        };

        self.status = Status::Running(Workers {
            running,
            cancelled,
            interrupt,
            capture,
            writer,
            output: output.to_path_buf(),
            started_at: Instant::now(),
        });
        let _ = self.events.send(EngineEvent::Started);
        tracing::info!("Fallback engine started, writing {:?}", output);
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
            Status::Running(workers) => {
                let duration = workers.started_at.elapsed();
                let output = workers.output.clone();
                if let Err(e) = Self::join(workers, false).await {
                    self.status = Status::Cancelled;
                    return Err(e);
                }

                let handle = FinalizedHandle {
                    path: output,
                    engine: EngineKind::Fallback,
                    duration,
                    dropped_frames: self.dropped.load(Ordering::SeqCst),
                    audio: AudioFlags::default(),
                };
                tracing::info!(
                    "Fallback engine stopped after {:.1}s, {} frames dropped",
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
        if let Status::Running(workers) = std::mem::replace(&mut self.status, Status::Cancelled) {
            let _ = Self::join(workers, true).await;
            tracing::info!("Fallback engine cancelled");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Drop for FallbackEngine {
    fn drop(&mut self) {
        if let Status::Running(workers) = &self.status {
            workers.cancelled.store(true, Ordering::SeqCst);
            workers.running.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::config::CaptureTarget;
    use crate::capture::content::{ContentProvider, DisplayCatalog};
    use crate::capture::frames::FrameFormat;
    use crate::recorder::state::CaptureMode;
    use crate::settings::UserSettings;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Emits tiny frames as fast as it is asked
    struct SyntheticSource {
        interval: Duration,
        started: Instant,
    }

    impl FrameSource for SyntheticSource {
        fn open(&mut self, config: &RecordingConfig) -> Result<FrameFormat, EngineError> {
            self.started = Instant::now();
            Ok(FrameFormat {
                width: 2,
                height: 2,
                fps: config.fps,
            })
        }

        fn next_frame(&mut self) -> Result<Option<CapturedFrame>, EngineError> {
            std::thread::sleep(self.interval);
            Ok(Some(CapturedFrame {
                data: vec![0u8; 16],
                width: 2,
                height: 2,
                timestamp: self.started.elapsed(),
            }))
        }

        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct SinkLog {
        written: u64,
        finished: bool,
        aborted: bool,
    }

    /// Writes one byte per frame, sleeping to simulate a slow encoder
    struct SlowSink {
        delay: Duration,
        file: Option<std::fs::File>,
        log: Arc<Mutex<SinkLog>>,
    }

    impl FrameSink for SlowSink {
        fn open(
            &mut self,
            _format: FrameFormat,
            _config: &RecordingConfig,
            output: &Path,
        ) -> Result<(), EngineError> {
            self.file = Some(std::fs::File::create(output)?);
            Ok(())
        }

        fn write_frame(&mut self, _frame: &CapturedFrame) -> Result<(), EngineError> {
            std::thread::sleep(self.delay);
            if let Some(file) = self.file.as_mut() {
                file.write_all(b"f")?;
            }
            self.log.lock().written += 1;
            Ok(())
        }

        fn finish(&mut self) -> Result<(), EngineError> {
            self.file = None;
            self.log.lock().finished = true;
            Ok(())
        }

        fn abort(&mut self) {
            self.file = None;
            self.log.lock().aborted = true;
        }
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

    fn engine(source_interval: Duration, sink_delay: Duration) -> (FallbackEngine, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let engine = FallbackEngine::new(
            Box::new(SyntheticSource {
                interval: source_interval,
                started: Instant::now(),
            }),
            Box::new(SlowSink {
                delay: sink_delay,
                file: None,
                log: log.clone(),
            }),
        );
        (engine, log)
    }

    #[tokio::test]
    async fn test_slow_sink_drops_frames() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("capture.mp4.partial");
        let (mut engine, log) = engine(Duration::from_millis(1), Duration::from_millis(20));
        let mut events = engine.subscribe();

        engine.start(&config(), &output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let handle = engine.stop().await.unwrap();

        assert!(handle.dropped_frames > 0);
        assert_eq!(handle.dropped_frames, engine.dropped_frames());
        assert_eq!(handle.engine, EngineKind::Fallback);
        assert_eq!(handle.audio, AudioFlags::default());
        assert!(log.lock().finished);
        assert!(log.lock().written > 0);
        assert!(std::fs::metadata(&output).unwrap().len() > 0);

        let mut saw_drop = false;
        loop {
            match events.try_recv() {
                Ok(EngineEvent::SampleDropped { .. }) => saw_drop = true,
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert!(saw_drop);
    }

    #[tokio::test]
    async fn test_fast_sink_keeps_every_frame() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("capture.mp4.partial");
        let (mut engine, log) = engine(Duration::from_millis(10), Duration::ZERO);

        engine.start(&config(), &output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let handle = engine.stop().await.unwrap();

        assert_eq!(handle.dropped_frames, 0);
        assert!(log.lock().written > 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("capture.mp4.partial");
        let (mut engine, _log) = engine(Duration::from_millis(5), Duration::ZERO);

        engine.start(&config(), &output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first = engine.stop().await.unwrap();
        let second = engine.stop().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cancel_aborts_sink() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("capture.mp4.partial");
        let (mut engine, log) = engine(Duration::from_millis(5), Duration::ZERO);

        engine.start(&config(), &output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.cancel().await;
        engine.cancel().await;

        assert!(log.lock().aborted);
        assert!(!log.lock().finished);
        assert!(matches!(engine.stop().await, Err(EngineError::NotRecording)));
    }

    /// Blocks inside `write_frame` until its interrupter fires
    struct StalledSink {
        wake: Arc<Mutex<std::sync::mpsc::Sender<()>>>,
        stalled: std::sync::mpsc::Receiver<()>,
        log: Arc<Mutex<SinkLog>>,
    }

    impl FrameSink for StalledSink {
        fn open(
            &mut self,
            _format: FrameFormat,
            _config: &RecordingConfig,
            _output: &Path,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        fn write_frame(&mut self, _frame: &CapturedFrame) -> Result<(), EngineError> {
            match self.stalled.recv_timeout(Duration::from_secs(10)) {
                Ok(()) => Err(EngineError::WriteFailed("encoder killed".into())),
                Err(_) => {
                    self.log.lock().written += 1;
                    Ok(())
                }
            }
        }

        fn finish(&mut self) -> Result<(), EngineError> {
            self.log.lock().finished = true;
            Ok(())
        }

        fn abort(&mut self) {
            self.log.lock().aborted = true;
        }

        fn interrupter(&self) -> Option<SinkInterrupt> {
            let wake = self.wake.clone();
            Some(Arc::new(move || {
                let _ = wake.lock().send(());
            }))
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_writer() {
        let dir = tempdir().unwrap();
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let (wake, stalled) = std::sync::mpsc::channel();
        let mut engine = FallbackEngine::new(
            Box::new(SyntheticSource {
                interval: Duration::from_millis(5),
                started: Instant::now(),
            }),
            Box::new(StalledSink {
                wake: Arc::new(Mutex::new(wake)),
                stalled,
                log: log.clone(),
            }),
        );
        let mut events = engine.subscribe();

        engine
            .start(&config(), &dir.path().join("capture.mp4.partial"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(3), engine.cancel())
            .await
            .unwrap();

        assert!(log.lock().aborted);
        assert!(!log.lock().finished);
        assert_eq!(log.lock().written, 0);
        loop {
            match events.try_recv() {
                Ok(event) => assert!(!matches!(event, EngineEvent::Errored(_))),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (mut engine, _log) = engine(Duration::from_millis(5), Duration::ZERO);
        assert!(matches!(engine.stop().await, Err(EngineError::NotRecording)));
    }
}
