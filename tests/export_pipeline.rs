//! GIF export against stub ffmpeg/ffprobe scripts
#![cfg(unix)]

use open_screencap::export::{ExportError, ExportPipeline, ExportQuality, ExportStage};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Logs every invocation next to itself and writes a tiny GIF to the output
fn logging_ffmpeg(dir: &Path) -> PathBuf {
    let log = dir.join("ffmpeg.log");
    script(
        dir,
        "ffmpeg",
        &format!(
            r#"for last; do :; done
case "$1" in -version) exit 0;; esac
echo "$*" >> "{}"
printf 'GIF89a' > "$last"
exit 0
"#,
            log.display()
        ),
    )
}

fn ffprobe(dir: &Path, json: &str) -> PathBuf {
    script(dir, "ffprobe", &format!("echo '{json}'"))
}

#[tokio::test]
async fn test_original_quality_follows_probed_source() {
    let dir = tempdir().unwrap();
    let tools = dir.path().join("tools");
    std::fs::create_dir(&tools).unwrap();
    let ffmpeg = logging_ffmpeg(&tools);
    let ffprobe = ffprobe(
        &tools,
        r#"{"streams":[{"width":640,"height":480,"r_frame_rate":"30000/1001"}],"format":{"duration":"2.0"}}"#,
    );

    let input = dir.path().join("clip.mp4");
    std::fs::write(&input, b"video").unwrap();

    let output = ExportPipeline::new(ffmpeg, ffprobe)
        .export(&input, ExportQuality::Original, |_| {})
        .await
        .unwrap();
    assert_eq!(output, dir.path().join("clip.gif"));

    let log = std::fs::read_to_string(tools.join("ffmpeg.log")).unwrap();
    let passes: Vec<&str> = log.lines().collect();
    assert_eq!(passes.len(), 2);
    assert!(passes[0].contains("fps=30,scale=640:-1"));
    assert!(passes[0].contains("palettegen"));
    assert!(passes[1].contains("paletteuse"));
    assert!(passes[1].contains("-loop 0"));
    assert!(passes[1].ends_with("clip.gif.partial"));
}

#[tokio::test]
async fn test_unprobeable_source_uses_preset_defaults() {
    let dir = tempdir().unwrap();
    let tools = dir.path().join("tools");
    std::fs::create_dir(&tools).unwrap();
    let ffmpeg = logging_ffmpeg(&tools);
    let ffprobe = script(&tools, "ffprobe", "exit 1\n");

    let input = dir.path().join("clip.mp4");
    std::fs::write(&input, b"video").unwrap();

    let mut stages = Vec::new();
    ExportPipeline::new(ffmpeg, ffprobe)
        .export(&input, ExportQuality::Medium, |p| stages.push(p.stage))
        .await
        .unwrap();

    let log = std::fs::read_to_string(tools.join("ffmpeg.log")).unwrap();
    assert!(log.contains("fps=15,scale=960:-1"));
    assert_eq!(stages.first(), Some(&ExportStage::Preparing));
    assert_eq!(stages.last(), Some(&ExportStage::Complete));
}

#[tokio::test]
async fn test_existing_gif_is_never_overwritten() {
    let dir = tempdir().unwrap();
    let tools = dir.path().join("tools");
    std::fs::create_dir(&tools).unwrap();
    let ffmpeg = logging_ffmpeg(&tools);

    let input = dir.path().join("clip.mp4");
    std::fs::write(&input, b"video").unwrap();
    std::fs::write(dir.path().join("clip.gif"), b"older").unwrap();

    let result = ExportPipeline::new(ffmpeg, tools.join("no-ffprobe"))
        .export(&input, ExportQuality::Low, |_| {})
        .await;
    assert!(matches!(result, Err(ExportError::Finalize(_))));
    assert_eq!(std::fs::read(dir.path().join("clip.gif")).unwrap(), b"older");
    assert!(!dir.path().join("clip.gif.partial").exists());
}
