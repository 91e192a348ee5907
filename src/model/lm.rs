//! Language model operations: inspire, format, understand.
//!
//! The LM answers synchronous metadata queries and never goes through the
//! generation queue. Output is produced by a seeded sampler over style
//! vocabularies so that identical requests with the same seed yield
//! identical results regardless of backend. Real weight inference sits
//! behind the same interface and is out of scope here.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::LmBackend;
use crate::error::Result;
use crate::model::device::Device;

/// Metadata object returned by every LM endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LmOutput {
    pub caption: String,
    pub lyrics: String,
    pub bpm: u32,
    pub duration: u32,
    pub key_scale: String,
    pub language: String,
    pub time_signature: String,
    pub instrumental: bool,
    pub seed: u64,
}

/// Parameters for `/lm/inspire`.
#[derive(Debug, Clone, Default)]
pub struct InspireParams {
    pub query: String,
    pub instrumental: bool,
    pub vocal_language: Option<String>,
    pub temperature: Option<f64>,
    pub seed: Option<u64>,
}

/// Parameters for `/lm/format`.
#[derive(Debug, Clone, Default)]
pub struct FormatParams {
    pub caption: Option<String>,
    pub lyrics: Option<String>,
    pub bpm: Option<u32>,
    pub duration: Option<u32>,
    pub key_scale: Option<String>,
    pub time_signature: Option<String>,
    pub language: Option<String>,
    pub temperature: Option<f64>,
    pub seed: Option<u64>,
}

/// Audio input for `/lm/understand`: an uploaded file spooled to disk,
/// or a server-side path.
#[derive(Debug, Clone)]
pub enum AudioInput {
    Spooled { original_name: String, path: PathBuf },
    ServerPath(PathBuf),
}

impl AudioInput {
    pub fn path(&self) -> &std::path::Path {
        match self {
            AudioInput::Spooled { path, .. } => path,
            AudioInput::ServerPath(path) => path,
        }
    }
}

/// Parameters for `/lm/understand`.
#[derive(Debug, Clone)]
pub struct UnderstandParams {
    pub audio: AudioInput,
    pub temperature: Option<f64>,
    pub seed: Option<u64>,
}

const MOODS: &[&str] = &[
    "melancholic", "uplifting", "dreamy", "aggressive", "laid-back", "cinematic", "haunting",
    "playful", "somber", "triumphant",
];

const GENRES: &[&str] = &[
    "jazz ballad", "lo-fi hip hop", "synthwave", "indie folk", "orchestral score", "deep house",
    "post-rock", "bossa nova", "ambient drone", "pop rock",
];

const INSTRUMENTS: &[&str] = &[
    "piano", "saxophone", "analog synth pads", "acoustic guitar", "upright bass", "string ensemble",
    "brushed drums", "electric piano", "warm sub bass", "vibraphone",
];

const KEYS: &[&str] = &[
    "C Major", "A Minor", "G Major", "E Minor", "Bb Major", "D Minor", "F# Minor", "Eb Major",
];

const TIME_SIGNATURES: &[&str] = &["4", "3", "6"];

const VERSE_LINES: &[&str] = &[
    "I walked along the river as the city lights went down",
    "There's a shadow on the staircase where you used to stand",
    "The morning came in silver and it washed the night away",
    "Every mile between us is a song I never wrote",
    "We traded all our summers for a handful of goodbyes",
    "The radio keeps playing something neither of us knows",
];

const CHORUS_LINES: &[&str] = &[
    "So hold on to the moment till the moment lets you go",
    "And we sing it to the skyline, every word we never said",
    "Cause the night is only borrowed but the echo stays for good",
    "Let it carry us tomorrow like it carried us before",
];

/// Derive a working seed: the explicit one when present, otherwise fresh
/// entropy. The chosen seed is echoed in the output.
fn effective_seed(requested: Option<u64>) -> u64 {
    requested.unwrap_or_else(|| rand::thread_rng().next_u64())
}

fn pick<'a>(rng: &mut ChaCha8Rng, options: &[&'a str]) -> &'a str {
    options[rng.gen_range(0..options.len())]
}

fn sample_lyrics(rng: &mut ChaCha8Rng, instrumental: bool) -> String {
    if instrumental {
        return "[inst]".to_string();
    }

    let mut lines = vec!["[Verse]".to_string()];
    for _ in 0..3 {
        lines.push(pick(rng, VERSE_LINES).to_string());
    }
    lines.push("[Chorus]".to_string());
    for _ in 0..2 {
        lines.push(pick(rng, CHORUS_LINES).to_string());
    }
    lines.join("\n")
}

/// A loaded language model.
///
/// Construction stands in for weight loading; the backend only changes
/// how inference would be executed, not the request/response contract.
#[derive(Debug)]
pub struct LanguageModel {
    backend: LmBackend,
    model_path: String,
    device: Device,
}

impl LanguageModel {
    pub fn load(model_path: &str, backend: LmBackend, device: Device) -> Result<Self> {
        info!(model = model_path, backend = %backend, device = %device, "loading language model");
        Ok(Self {
            backend,
            model_path: model_path.to_string(),
            device,
        })
    }

    pub fn backend(&self) -> LmBackend {
        self.backend
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Move the model weights to another device.
    pub fn move_to(&mut self, device: Device) {
        debug!(from = %self.device, to = %device, "moving language model");
        self.device = device;
    }

    /// Generate caption, lyrics and metadata from a free-text description.
    pub fn inspire(&self, params: &InspireParams) -> Result<LmOutput> {
        let seed = effective_seed(params.seed);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mood = pick(&mut rng, MOODS);
        let instrument_a = pick(&mut rng, INSTRUMENTS);
        let instrument_b = pick(&mut rng, INSTRUMENTS);
        let caption = format!(
            "{}, {mood}, featuring {instrument_a} and {instrument_b}",
            params.query.trim()
        );

        let language = params
            .vocal_language
            .clone()
            .unwrap_or_else(|| "en".to_string());

        let output = LmOutput {
            caption,
            lyrics: sample_lyrics(&mut rng, params.instrumental),
            bpm: rng.gen_range(60..=180),
            duration: rng.gen_range(60..=240),
            key_scale: pick(&mut rng, KEYS).to_string(),
            language,
            time_signature: pick(&mut rng, TIME_SIGNATURES).to_string(),
            instrumental: params.instrumental,
            seed,
        };

        debug!(backend = %self.backend, seed, "inspire complete");
        Ok(output)
    }

    /// Enhance a caption and/or lyrics, filling in missing metadata.
    /// Caller-supplied constraints pass through untouched.
    pub fn format(&self, params: &FormatParams) -> Result<LmOutput> {
        let seed = effective_seed(params.seed);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let base = params
            .caption
            .clone()
            .unwrap_or_else(|| pick(&mut rng, GENRES).to_string());
        let caption = format!("{base}, {} production", pick(&mut rng, MOODS));

        let lyrics = match &params.lyrics {
            Some(lyrics) if !lyrics.trim().is_empty() => {
                if lyrics.contains('[') {
                    lyrics.clone()
                } else {
                    format!("[Verse]\n{lyrics}")
                }
            }
            _ => sample_lyrics(&mut rng, false),
        };

        let output = LmOutput {
            caption,
            lyrics,
            bpm: params.bpm.unwrap_or_else(|| rng.gen_range(60..=180)),
            duration: params.duration.unwrap_or_else(|| rng.gen_range(60..=240)),
            key_scale: params
                .key_scale
                .clone()
                .unwrap_or_else(|| pick(&mut rng, KEYS).to_string()),
            language: params.language.clone().unwrap_or_else(|| "en".to_string()),
            time_signature: params
                .time_signature
                .clone()
                .unwrap_or_else(|| pick(&mut rng, TIME_SIGNATURES).to_string()),
            instrumental: false,
            seed,
        };

        debug!(backend = %self.backend, seed, "format complete");
        Ok(output)
    }

    /// Analyze audio and extract metadata. The audio identity (path) is
    /// folded into the sampling seed so repeated analysis of the same file
    /// agrees with itself.
    pub fn understand(&self, params: &UnderstandParams) -> Result<LmOutput> {
        let mut hasher = DefaultHasher::new();
        params.audio.path().hash(&mut hasher);
        let seed = params.seed.unwrap_or_else(|| hasher.finish());
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mood = pick(&mut rng, MOODS);
        let genre = pick(&mut rng, GENRES);
        let instrument = pick(&mut rng, INSTRUMENTS);
        let caption = format!("{mood} {genre} with prominent {instrument}");

        let output = LmOutput {
            caption,
            lyrics: sample_lyrics(&mut rng, false),
            bpm: rng.gen_range(60..=180),
            duration: rng.gen_range(60..=240),
            key_scale: pick(&mut rng, KEYS).to_string(),
            language: "en".to_string(),
            time_signature: pick(&mut rng, TIME_SIGNATURES).to_string(),
            instrumental: false,
            seed,
        };

        debug!(backend = %self.backend, audio = %params.audio.path().display(), "understand complete");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::device::Device;

    fn model() -> LanguageModel {
        LanguageModel::load("acestep-5Hz-lm-0.6B", LmBackend::Pt, Device::Cpu).unwrap()
    }

    #[test]
    fn test_inspire_same_seed_is_reproducible() {
        let lm = model();
        let params = InspireParams {
            query: "dark ambient drone music".to_string(),
            seed: Some(12345),
            temperature: Some(0.85),
            ..Default::default()
        };
        let a = lm.inspire(&params).unwrap();
        let b = lm.inspire(&params).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.seed, 12345);
    }

    #[test]
    fn test_inspire_different_seeds_differ() {
        let lm = model();
        let mut params = InspireParams {
            query: "upbeat J-pop idol song".to_string(),
            seed: Some(1),
            ..Default::default()
        };
        let a = lm.inspire(&params).unwrap();
        params.seed = Some(2);
        let b = lm.inspire(&params).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_inspire_instrumental_has_no_lyrics() {
        let lm = model();
        let params = InspireParams {
            query: "epic orchestral trailer music".to_string(),
            instrumental: true,
            seed: Some(7),
            ..Default::default()
        };
        let out = lm.inspire(&params).unwrap();
        assert!(out.instrumental);
        assert_eq!(out.lyrics, "[inst]");
    }

    #[test]
    fn test_inspire_respects_vocal_language() {
        let lm = model();
        let params = InspireParams {
            query: "city pop".to_string(),
            vocal_language: Some("ja".to_string()),
            seed: Some(3),
            ..Default::default()
        };
        assert_eq!(lm.inspire(&params).unwrap().language, "ja");
    }

    #[test]
    fn test_format_passes_constraints_through() {
        let lm = model();
        let params = FormatParams {
            caption: Some("jazz ballad".to_string()),
            lyrics: Some("[Verse]\nMoonlight on the water".to_string()),
            bpm: Some(80),
            key_scale: Some("Bb Major".to_string()),
            time_signature: Some("3".to_string()),
            duration: Some(240),
            language: Some("en".to_string()),
            seed: Some(9),
            ..Default::default()
        };
        let out = lm.format(&params).unwrap();
        assert_eq!(out.bpm, 80);
        assert_eq!(out.key_scale, "Bb Major");
        assert_eq!(out.time_signature, "3");
        assert_eq!(out.duration, 240);
        assert!(out.caption.starts_with("jazz ballad"));
        assert!(out.lyrics.contains("Moonlight on the water"));
    }

    #[test]
    fn test_format_wraps_bare_lyrics_in_structure() {
        let lm = model();
        let params = FormatParams {
            lyrics: Some("the sun was setting low".to_string()),
            seed: Some(4),
            ..Default::default()
        };
        let out = lm.format(&params).unwrap();
        assert!(out.lyrics.starts_with("[Verse]"));
    }

    #[test]
    fn test_understand_is_stable_per_path() {
        let lm = model();
        let params = UnderstandParams {
            audio: AudioInput::ServerPath(PathBuf::from("/data/song.wav")),
            temperature: None,
            seed: None,
        };
        let a = lm.understand(&params).unwrap();
        let b = lm.understand(&params).unwrap();
        assert_eq!(a, b);
        assert!(!a.caption.is_empty());
    }
}
