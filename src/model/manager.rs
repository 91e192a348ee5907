//! Model manager: owns the DiT pipeline and the language model.
//!
//! The manager is the sole mutator of which models reside in accelerator
//! memory. A per-kind `tokio::Mutex` guarantees at most one load/offload
//! transition (or generation, for the DiT) is in flight per model, so
//! concurrent workers can never race on accelerator memory.
//!
//! Offload policy: when the matching offload flag is set, a model is moved
//! to CPU memory as soon as its work item finishes (release-after-use).
//! `ensure_loaded` promotes an offloaded model back before the next use.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{Config, LmInitPolicy};
use crate::error::{ApiError, Result};
use crate::model::device::{free_accelerator_memory, AcceleratorInfo, Device};
use crate::model::dit::{DitPipeline, GeneratedAudio, GenerationTask};
use crate::model::lm::{
    FormatParams, InspireParams, LanguageModel, LmOutput, UnderstandParams,
};

/// Free accelerator memory required before `auto` loads the LM.
pub const LM_AUTO_VRAM_THRESHOLD: u64 = 6 * 1024 * 1024 * 1024;

/// The two model kinds the manager owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Dit,
    LanguageModel,
}

/// Reported residency of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loaded,
    Offloaded,
}

/// Seam between the queue workers and the generation pipeline.
#[async_trait]
pub trait AudioGenerator: Send + Sync + 'static {
    async fn run_generation(&self, job_id: &str, task: &GenerationTask) -> Result<GeneratedAudio>;
}

pub struct ModelManager {
    config: Arc<Config>,
    /// Preferred compute device resolved at startup.
    device: Device,
    dit: Mutex<Option<DitPipeline>>,
    lm: Mutex<Option<LanguageModel>>,
}

impl ModelManager {
    pub fn new(config: Arc<Config>, device: Device) -> Self {
        Self {
            config,
            device,
            dit: Mutex::new(None),
            lm: Mutex::new(None),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Load models at startup. The DiT loads eagerly; the LM follows the
    /// tri-state policy, where `auto` requires more than
    /// [`LM_AUTO_VRAM_THRESHOLD`] free accelerator memory.
    pub async fn init(&self, accelerators: &[AcceleratorInfo]) -> Result<()> {
        self.ensure_loaded(ModelKind::Dit).await?;

        let load_lm = match self.config.init_llm {
            LmInitPolicy::Enabled => true,
            LmInitPolicy::Disabled => false,
            LmInitPolicy::Auto => {
                let free = free_accelerator_memory(accelerators);
                let enough = free > LM_AUTO_VRAM_THRESHOLD;
                info!(
                    free_bytes = free,
                    threshold = LM_AUTO_VRAM_THRESHOLD,
                    load = enough,
                    "LM auto-init decision"
                );
                enough
            }
        };

        if load_lm {
            self.ensure_loaded(ModelKind::LanguageModel).await?;
        } else {
            info!("language model not initialized, /lm/* endpoints will return 503");
        }
        Ok(())
    }

    /// Load the model if needed and promote it to the preferred device.
    pub async fn ensure_loaded(&self, kind: ModelKind) -> Result<()> {
        match kind {
            ModelKind::Dit => {
                let mut slot = self.dit.lock().await;
                match slot.as_mut() {
                    Some(pipeline) => {
                        if pipeline.device() != self.device {
                            pipeline.move_to(self.device);
                        }
                    }
                    None => {
                        let output_dir = self.config.spool_dir().join("acestep-output");
                        *slot = Some(DitPipeline::load(
                            self.device,
                            self.config.use_flash_attention,
                            self.config.download_source,
                            &output_dir,
                        )?);
                    }
                }
            }
            ModelKind::LanguageModel => {
                let mut slot = self.lm.lock().await;
                match slot.as_mut() {
                    Some(lm) => {
                        if lm.device() != self.device {
                            lm.move_to(self.device);
                        }
                    }
                    None => {
                        *slot = Some(LanguageModel::load(
                            &self.config.lm_model_path,
                            self.config.lm_backend,
                            self.device,
                        )?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Release a model after use: offload to CPU when the matching flag is
    /// set, otherwise leave it resident.
    pub async fn release(&self, kind: ModelKind) {
        match kind {
            ModelKind::Dit => {
                if !self.config.dit_offload_enabled() {
                    return;
                }
                let mut slot = self.dit.lock().await;
                if let Some(pipeline) = slot.as_mut() {
                    if pipeline.device().is_accelerator() {
                        pipeline.move_to(Device::Cpu);
                    }
                }
            }
            ModelKind::LanguageModel => {
                if !self.config.lm_offload_enabled() {
                    return;
                }
                let mut slot = self.lm.lock().await;
                if let Some(lm) = slot.as_mut() {
                    if lm.device().is_accelerator() {
                        lm.move_to(Device::Cpu);
                    }
                }
            }
        }
    }

    /// Whether the language model is loaded.
    pub async fn lm_ready(&self) -> bool {
        self.lm.lock().await.is_some()
    }

    /// Residency states for health reporting: (DiT, LM).
    pub async fn states(&self) -> (ModelState, ModelState) {
        let dit = match self.dit.lock().await.as_ref() {
            None => ModelState::Unloaded,
            Some(p) if p.device() == self.device => ModelState::Loaded,
            Some(_) => ModelState::Offloaded,
        };
        let lm = match self.lm.lock().await.as_ref() {
            None => ModelState::Unloaded,
            Some(m) if m.device() == self.device => ModelState::Loaded,
            Some(_) => ModelState::Offloaded,
        };
        (dit, lm)
    }

    async fn with_lm<T>(
        &self,
        op: impl FnOnce(&LanguageModel) -> Result<T>,
    ) -> Result<T> {
        let result = {
            let mut slot = self.lm.lock().await;
            let lm = slot.as_mut().ok_or(ApiError::LmNotReady)?;
            if lm.device() != self.device {
                lm.move_to(self.device);
            }
            op(lm)
        };
        self.release(ModelKind::LanguageModel).await;
        result
    }

    pub async fn lm_inspire(&self, params: &InspireParams) -> Result<LmOutput> {
        self.with_lm(|lm| lm.inspire(params)).await
    }

    pub async fn lm_format(&self, params: &FormatParams) -> Result<LmOutput> {
        self.with_lm(|lm| lm.format(params)).await
    }

    pub async fn lm_understand(&self, params: &UnderstandParams) -> Result<LmOutput> {
        self.with_lm(|lm| lm.understand(params)).await
    }
}

#[async_trait]
impl AudioGenerator for ModelManager {
    /// Run one generation job. Holding the DiT lock for the duration keeps
    /// the single-mutator invariant; the job is released (and offloaded if
    /// configured) afterwards.
    async fn run_generation(&self, job_id: &str, task: &GenerationTask) -> Result<GeneratedAudio> {
        self.ensure_loaded(ModelKind::Dit).await?;

        let result = {
            let slot = self.dit.lock().await;
            let pipeline = slot
                .as_ref()
                .ok_or_else(|| ApiError::internal("DiT pipeline missing after ensure_loaded"))?;
            pipeline.generate(job_id, task)
        };

        if let Err(ref e) = result {
            warn!(job_id, error = %e, "generation failed");
        }

        self.release(ModelKind::Dit).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::device::stub_accelerator;
    use crate::model::dit::TaskKind;

    fn manager_with(config: Config, device: Device) -> ModelManager {
        let mut config = config;
        config.tmpdir = Some(tempfile::tempdir().unwrap().keep());
        ModelManager::new(Arc::new(config), device)
    }

    #[tokio::test]
    async fn test_lm_not_ready_before_init() {
        let mgr = manager_with(Config::default(), Device::Cpu);
        assert!(!mgr.lm_ready().await);
        let err = mgr
            .lm_inspire(&InspireParams {
                query: "anything".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::LmNotReady));
    }

    #[tokio::test]
    async fn test_init_respects_disabled_policy() {
        let mut cfg = Config::default();
        cfg.init_llm = LmInitPolicy::Disabled;
        let mgr = manager_with(cfg, Device::Cpu);
        mgr.init(&[stub_accelerator(24 * 1024 * 1024 * 1024)])
            .await
            .unwrap();
        assert!(!mgr.lm_ready().await);

        let (dit, lm) = mgr.states().await;
        assert_eq!(dit, ModelState::Loaded);
        assert_eq!(lm, ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_auto_policy_follows_vram_threshold() {
        let cfg = Config::default(); // init_llm = auto
        let mgr = manager_with(cfg.clone(), Device::Cpu);
        mgr.init(&[stub_accelerator(4 * 1024 * 1024 * 1024)])
            .await
            .unwrap();
        assert!(!mgr.lm_ready().await);

        let mgr = manager_with(cfg, Device::Cpu);
        mgr.init(&[stub_accelerator(8 * 1024 * 1024 * 1024)])
            .await
            .unwrap();
        assert!(mgr.lm_ready().await);
    }

    #[tokio::test]
    async fn test_lm_offload_after_use() {
        let mut cfg = Config::default();
        cfg.init_llm = LmInitPolicy::Enabled;
        cfg.lm_offload_to_cpu = true;
        let mgr = manager_with(cfg, Device::Cuda(0));
        mgr.init(&[stub_accelerator(8 * 1024 * 1024 * 1024)])
            .await
            .unwrap();

        mgr.lm_inspire(&InspireParams {
            query: "test".into(),
            seed: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

        let (_, lm) = mgr.states().await;
        assert_eq!(lm, ModelState::Offloaded);

        // Next use promotes it back transparently.
        mgr.lm_inspire(&InspireParams {
            query: "test".into(),
            seed: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_generation_offloads_dit_when_configured() {
        let mut cfg = Config::default();
        cfg.init_llm = LmInitPolicy::Disabled;
        cfg.offload_dit_to_cpu = true;
        let mgr = manager_with(cfg, Device::Cuda(0));
        mgr.init(&[]).await.unwrap();

        let task = GenerationTask {
            kind: TaskKind::Text2Music,
            caption: "ambient pads".into(),
            lyrics: "[inst]".into(),
            duration: 30,
            bpm: None,
            seed: 5,
            source_audio: None,
            repaint_window: None,
        };
        let audio = mgr.run_generation("job-a", &task).await.unwrap();
        assert!(audio.audio_path.exists());

        let (dit, _) = mgr.states().await;
        assert_eq!(dit, ModelState::Offloaded);
    }
}
