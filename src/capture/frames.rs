//! Frame sources and sinks for the fallback engine
//!
//! Both sides are blocking; the fallback engine drives them from dedicated
//! threads.

use crate::capture::config::RecordingConfig;
use crate::capture::platform::{base_args, fragmented_mp4_args, CaptureBackend};
use crate::capture::traits::EngineError;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A captured video frame
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Raw pixel data (BGRA format)
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Time since capture started
    pub timestamp: Duration,
}

/// Geometry of the frames a source produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl FrameFormat {
    /// Bytes in one BGRA frame
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Produces frames until closed
pub trait FrameSource: Send {
    fn open(&mut self, config: &RecordingConfig) -> Result<FrameFormat, EngineError>;

    /// Block until the next frame; `None` once the source has ended
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>, EngineError>;

    fn close(&mut self);
}

/// Tears a sink down from another thread, even while a write is blocked
pub type SinkInterrupt = Arc<dyn Fn() + Send + Sync>;

/// Consumes frames into an output file
pub trait FrameSink: Send {
    fn open(
        &mut self,
        format: FrameFormat,
        config: &RecordingConfig,
        output: &Path,
    ) -> Result<(), EngineError>;

    fn write_frame(&mut self, frame: &CapturedFrame) -> Result<(), EngineError>;

    /// Flush and close the output
    fn finish(&mut self) -> Result<(), EngineError>;

    /// Stop without flushing
    fn abort(&mut self);

    /// Handle that unblocks a stalled `write_frame`, if the sink has one
    fn interrupter(&self) -> Option<SinkInterrupt> {
        None
    }
}

/// Grabs raw frames from the platform's screen device
pub struct DeviceGrabber {
    ffmpeg: PathBuf,
    backend: CaptureBackend,
    process: Option<Child>,
    stdout: Option<ChildStdout>,
    format: Option<FrameFormat>,
    started_at: Instant,
}

impl DeviceGrabber {
    pub fn new(ffmpeg: PathBuf, backend: CaptureBackend) -> Self {
        Self {
            ffmpeg,
            backend,
            process: None,
            stdout: None,
            format: None,
            started_at: Instant::now(),
        }
    }
}

impl FrameSource for DeviceGrabber {
    fn open(&mut self, config: &RecordingConfig) -> Result<FrameFormat, EngineError> {
        let mut process = Command::new(&self.ffmpeg)
            .args(self.backend.grab_args(config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EngineError::NoCaptureSource(format!("Failed to start ffmpeg: {}", e)))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| EngineError::Process("ffmpeg stdout unavailable".into()))?;

        let format = FrameFormat {
            width: config.output.width,
            height: config.output.height,
            fps: config.fps,
        };

        tracing::info!(
            "Started {} grabber: {}x{} @ {}fps",
            self.backend.device_name(),
            format.width,
            format.height,
            format.fps
        );

        self.process = Some(process);
        self.stdout = Some(stdout);
        self.format = Some(format);
        self.started_at = Instant::now();
        Ok(format)
    }

    fn next_frame(&mut self) -> Result<Option<CapturedFrame>, EngineError> {
        let (Some(stdout), Some(format)) = (self.stdout.as_mut(), self.format) else {
            return Ok(None);
        };

        let mut data = vec![0u8; format.frame_len()];
        match stdout.read_exact(&mut data) {
            Ok(()) => Ok(Some(CapturedFrame {
                data,
                width: format.width,
                height: format.height,
                timestamp: self.started_at.elapsed(),
            })),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    fn close(&mut self) {
        self.stdout = None;
        if let Some(mut process) = self.process.take() {
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

impl Drop for DeviceGrabber {
    fn drop(&mut self) {
        self.close();
    }
}

/// Encodes raw frames through an ffmpeg process fed on stdin
pub struct EncoderSink {
    ffmpeg: PathBuf,
    encoder: &'static str,
    process: Arc<Mutex<Option<Child>>>,
    stdin: Option<ChildStdin>,
    frame_count: u64,
}

impl EncoderSink {
    pub fn new(ffmpeg: PathBuf, encoder: &'static str) -> Self {
        Self {
            ffmpeg,
            encoder,
            process: Arc::new(Mutex::new(None)),
            stdin: None,
            frame_count: 0,
        }
    }

    pub fn encoder_args(
        encoder: &str,
        format: FrameFormat,
        config: &RecordingConfig,
        output: &Path,
    ) -> Vec<String> {
        let mut args = base_args();
        args.extend([
            "-f".into(),
            "rawvideo".into(),
            "-pixel_format".into(),
            "bgra".into(),
            "-video_size".into(),
            format!("{}x{}", format.width, format.height),
            "-framerate".into(),
            format.fps.to_string(),
            "-i".into(),
            "-".into(),
            "-c:v".into(),
            encoder.into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-b:v".into(),
            config.bitrate.to_string(),
            "-g".into(),
            (format.fps * 2).to_string(),
        ]);
        args.extend(fragmented_mp4_args());
        args.push(output.to_string_lossy().to_string());
        args
    }
}

impl FrameSink for EncoderSink {
    fn open(
        &mut self,
        format: FrameFormat,
        config: &RecordingConfig,
        output: &Path,
    ) -> Result<(), EngineError> {
        let mut process = Command::new(&self.ffmpeg)
            .args(Self::encoder_args(self.encoder, format, config, output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Process(format!("Failed to start ffmpeg encoder: {}", e)))?;

        self.stdin = process.stdin.take();
        *self.process.lock() = Some(process);
        self.frame_count = 0;

        tracing::info!(
            "Started ffmpeg encoder ({}): {}x{} @ {}fps, output: {:?}",
            self.encoder,
            format.width,
            format.height,
            format.fps,
            output
        );
        Ok(())
    }

    fn write_frame(&mut self, frame: &CapturedFrame) -> Result<(), EngineError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EngineError::WriteFailed("encoder is not open".into()))?;
        stdin
            .write_all(&frame.data)
            .map_err(|e| EngineError::WriteFailed(e.to_string()))?;
        self.frame_count += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EngineError> {
        drop(self.stdin.take());
        let Some(process) = self.process.lock().take() else {
            return Ok(());
        };

        let output = process.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::WriteFailed(format!(
                "ffmpeg exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        tracing::info!("ffmpeg encoder finished: {} frames", self.frame_count);
        Ok(())
    }

    fn abort(&mut self) {
        drop(self.stdin.take());
        let process = self.process.lock().take();
        if let Some(mut process) = process {
            let _ = process.kill();
            let _ = process.wait();
        }
    }

    fn interrupter(&self) -> Option<SinkInterrupt> {
        let process = self.process.clone();
        Some(Arc::new(move || {
            // a blocked write then fails with a broken pipe
            if let Some(process) = process.lock().as_mut() {
                let _ = process.kill();
            }
        }))
    }
}

impl Drop for EncoderSink {
    fn drop(&mut self) {
        self.abort();
    }
}
