//! DiT generation pipeline.
//!
//! Owns the diffusion-transformer weights and renders audio for queued
//! generation jobs. The decode itself is stubbed the same way the wider
//! interface is: a deterministic placeholder waveform is written where a
//! real pipeline would run the diffusion loop, so job lifecycle, offload
//! and queue behavior are exercised end to end.

use std::path::{Path, PathBuf};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DownloadSource;
use crate::error::{ApiError, Result};
use crate::model::device::Device;

/// What kind of generation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Text-conditioned generation from scratch.
    #[serde(rename = "text2music")]
    Text2Music,
    /// Re-render an existing track with a new style.
    Cover,
    /// Regenerate a time window of an existing track.
    Repaint,
}

/// A generation job as executed by the pipeline.
#[derive(Debug, Clone)]
pub struct GenerationTask {
    pub kind: TaskKind,
    pub caption: String,
    pub lyrics: String,
    pub duration: u32,
    pub bpm: Option<u32>,
    pub seed: u64,
    /// Source track for cover and repaint.
    pub source_audio: Option<PathBuf>,
    /// Repaint window in seconds (start, end).
    pub repaint_window: Option<(f64, f64)>,
}

/// Result of a completed generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedAudio {
    pub audio_path: PathBuf,
    pub duration: u32,
    pub sample_rate: u32,
    pub seed: u64,
}

/// The loaded DiT pipeline.
#[derive(Debug)]
pub struct DitPipeline {
    device: Device,
    use_flash_attention: bool,
    output_dir: PathBuf,
}

impl DitPipeline {
    /// Load pipeline weights onto `device`.
    ///
    /// `download_source` selects where missing weights would be fetched
    /// from; generated audio lands under `output_dir`.
    pub fn load(
        device: Device,
        use_flash_attention: bool,
        download_source: DownloadSource,
        output_dir: &Path,
    ) -> Result<Self> {
        info!(
            device = %device,
            flash_attention = use_flash_attention,
            source = ?download_source,
            "loading DiT pipeline"
        );
        std::fs::create_dir_all(output_dir)?;
        Ok(Self {
            device,
            use_flash_attention,
            output_dir: output_dir.to_path_buf(),
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Move the pipeline weights to another device.
    pub fn move_to(&mut self, device: Device) {
        debug!(from = %self.device, to = %device, "moving DiT pipeline");
        self.device = device;
    }

    /// Render audio for a task. Cover and repaint require a source track;
    /// the repaint window must be non-empty and ordered.
    pub fn generate(&self, job_id: &str, task: &GenerationTask) -> Result<GeneratedAudio> {
        match task.kind {
            TaskKind::Cover | TaskKind::Repaint => {
                let source = task.source_audio.as_ref().ok_or_else(|| {
                    ApiError::validation("cover/repaint requires a source audio_path")
                })?;
                if !source.exists() {
                    return Err(ApiError::validation(format!(
                        "source audio not found: {}",
                        source.display()
                    )));
                }
            }
            TaskKind::Text2Music => {}
        }

        if task.kind == TaskKind::Repaint {
            match task.repaint_window {
                Some((start, end)) if end > start && start >= 0.0 => {}
                _ => {
                    return Err(ApiError::validation(
                        "repaint requires a window with 0 <= start < end",
                    ))
                }
            }
        }

        let sample_rate = 44_100u32;
        let output_path = self.output_dir.join(format!("acestep_{job_id}.wav"));

        // Placeholder render: a short seeded byte pattern where the real
        // diffusion loop would synthesize the waveform.
        let mut rng = ChaCha8Rng::seed_from_u64(task.seed);
        let body: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
        std::fs::write(&output_path, &body)?;

        debug!(
            job_id,
            kind = ?task.kind,
            duration = task.duration,
            output = %output_path.display(),
            "generation rendered"
        );

        Ok(GeneratedAudio {
            audio_path: output_path,
            duration: task.duration,
            sample_rate,
            seed: task.seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(dir: &Path) -> DitPipeline {
        DitPipeline::load(Device::Cpu, false, DownloadSource::Auto, dir).unwrap()
    }

    fn task(kind: TaskKind) -> GenerationTask {
        GenerationTask {
            kind,
            caption: "warm synthwave".to_string(),
            lyrics: "[inst]".to_string(),
            duration: 120,
            bpm: Some(100),
            seed: 42,
            source_audio: None,
            repaint_window: None,
        }
    }

    #[test]
    fn test_text2music_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = pipeline(dir.path());
        let audio = pipe.generate("job-1", &task(TaskKind::Text2Music)).unwrap();
        assert!(audio.audio_path.exists());
        assert_eq!(audio.duration, 120);
        assert_eq!(audio.seed, 42);
    }

    #[test]
    fn test_cover_without_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = pipeline(dir.path());
        let err = pipe.generate("job-2", &task(TaskKind::Cover)).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn test_repaint_window_validated() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = pipeline(dir.path());

        let source = dir.path().join("source.wav");
        std::fs::write(&source, b"fake").unwrap();

        let mut t = task(TaskKind::Repaint);
        t.source_audio = Some(source.clone());
        t.repaint_window = Some((30.0, 10.0));
        assert!(pipe.generate("job-3", &t).is_err());

        t.repaint_window = Some((10.0, 30.0));
        assert!(pipe.generate("job-4", &t).is_ok());
    }
}
