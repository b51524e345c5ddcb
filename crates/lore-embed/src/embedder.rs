use std::path::{Path, PathBuf};
use std::sync::Mutex;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::device::select_device;
use crate::error::{EmbedError, Result};

const MAX_SEQ_LEN: usize = 512;

enum Backend {
    Model {
        model: Mutex<BertModel>,
        tokenizer: Tokenizer,
        device: Device,
        hidden_size: usize,
    },
    /// Deterministic hash-seeded vectors; lets the pipeline and retrieval
    /// math run without model files.
    Stub,
}

/// Local sentence embedder (BERT-style safetensors checkpoint, mean pooled,
/// L2 normalized). Without a model directory it runs the stub backend.
pub struct LocalEmbedder {
    backend: Backend,
    dim: usize,
    batch_size: usize,
}

impl std::fmt::Debug for LocalEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEmbedder")
            .field(
                "backend",
                &match &self.backend {
                    Backend::Model { device, .. } => format!("Model({:?})", device),
                    Backend::Stub => "Stub".to_string(),
                },
            )
            .field("dim", &self.dim)
            .finish()
    }
}

impl LocalEmbedder {
    /// Load from a model directory, or fall back to the stub when no path is
    /// configured.
    pub fn load(model_path: Option<&str>, dim: usize, batch_size: usize) -> Result<Self> {
        let Some(path) = model_path else {
            warn!("no local embedding model configured, running stub embedder");
            return Ok(Self {
                backend: Backend::Stub,
                dim,
                batch_size,
            });
        };

        let dir = PathBuf::from(path);
        if !dir.exists() {
            return Err(EmbedError::ModelNotFound {
                path: path.to_string(),
            });
        }

        let device = select_device();
        debug!(?device, "selected compute device for embedder");
        let (model, tokenizer, hidden_size) = Self::load_model(&dir, &device)?;
        info!(model_path = path, hidden_size, "local embedding model loaded");

        Ok(Self {
            backend: Backend::Model {
                model: Mutex::new(model),
                tokenizer,
                device,
                hidden_size,
            },
            dim: hidden_size,
            batch_size,
        })
    }

    fn load_model(dir: &Path, device: &Device) -> Result<(BertModel, Tokenizer, usize)> {
        let config_raw = std::fs::read_to_string(dir.join("config.json")).map_err(|e| {
            EmbedError::ModelLoadFailed {
                reason: format!("missing config.json: {}", e),
            }
        })?;
        let config: Config =
            serde_json::from_str(&config_raw).map_err(|e| EmbedError::ModelLoadFailed {
                reason: format!("bad config.json: {}", e),
            })?;

        let tokenizer =
            Tokenizer::from_file(dir.join("tokenizer.json")).map_err(|e| {
                EmbedError::ModelLoadFailed {
                    reason: format!("failed to load tokenizer: {}", e),
                }
            })?;

        let weights = dir.join("model.safetensors");
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device).map_err(|e| {
                EmbedError::ModelLoadFailed {
                    reason: format!("failed to map weights: {}", e),
                }
            })?
        };
        let hidden_size = config.hidden_size;
        let model = BertModel::load(vb, &config).map_err(|e| EmbedError::ModelLoadFailed {
            reason: e.to_string(),
        })?;
        Ok((model, tokenizer, hidden_size))
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_stub(&self) -> bool {
        matches!(self.backend, Backend::Stub)
    }

    pub fn encode(&self, text: &str) -> Result<Vec<f32>> {
        match &self.backend {
            Backend::Model {
                model,
                tokenizer,
                device,
                ..
            } => self.encode_with_model(text, model, tokenizer, device),
            Backend::Stub => Ok(self.encode_stub(text)),
        }
    }

    /// Encode many texts; sequential within the process, chunked by the
    /// configured batch size purely for log cadence.
    pub fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            out.push(self.encode(text)?);
            if (i + 1) % self.batch_size == 0 {
                debug!(done = i + 1, total = texts.len(), "embedding batch progress");
            }
        }
        Ok(out)
    }

    fn encode_with_model(
        &self,
        text: &str,
        model: &Mutex<BertModel>,
        tokenizer: &Tokenizer,
        device: &Device,
    ) -> Result<Vec<f32>> {
        let encoding = tokenizer
            .encode(text, true)
            .map_err(|e| EmbedError::TokenizationFailed {
                reason: e.to_string(),
            })?;
        let mut ids: Vec<u32> = encoding.get_ids().to_vec();
        if ids.is_empty() {
            return Ok(vec![0.0; self.dim]);
        }
        ids.truncate(MAX_SEQ_LEN);
        let mut type_ids: Vec<u32> = encoding.get_type_ids().to_vec();
        type_ids.truncate(ids.len());

        let input_ids = Tensor::new(&ids[..], device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(&type_ids[..], device)?.unsqueeze(0)?;

        let hidden = model
            .lock()
            .unwrap()
            .forward(&input_ids, &token_type_ids, None)?;

        // Mean pooling over the sequence dimension: [1, seq, hidden] -> [hidden]
        let pooled = hidden.mean(1)?.squeeze(0)?;
        let embedding: Vec<f32> = pooled.to_vec1()?;
        Ok(normalize(embedding))
    }

    fn encode_stub(&self, text: &str) -> Vec<f32> {
        let seed = fold_bytes(text.as_bytes());
        let mut state = seed;
        let mut embedding = Vec::with_capacity(self.dim);
        for _ in 0..self.dim {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let value = ((state >> 32) as f32 / u32::MAX as f32) * 2.0 - 1.0;
            embedding.push(value);
        }
        normalize(embedding)
    }
}

/// Stable byte fold so stub vectors are reproducible across runs and
/// platforms (a hasher with a random key would break retrieval tests).
fn fold_bytes(bytes: &[u8]) -> u64 {
    let mut acc: u64 = 0xcbf29ce484222325;
    for b in bytes {
        acc ^= *b as u64;
        acc = acc.wrapping_mul(0x100000001b3);
    }
    acc
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub() -> LocalEmbedder {
        LocalEmbedder::load(None, 64, 8).unwrap()
    }

    #[test]
    fn stub_vectors_are_deterministic_and_unit_norm() {
        let embedder = stub();
        let a = embedder.encode("hello world").unwrap();
        let b = embedder.encode("hello world").unwrap();
        let c = embedder.encode("different text").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn batch_encode_matches_single_encode() {
        let embedder = stub();
        let texts = vec!["one".to_string(), "two".to_string()];
        let batch = embedder.encode_batch(&texts).unwrap();
        assert_eq!(batch[0], embedder.encode("one").unwrap());
        assert_eq!(batch[1], embedder.encode("two").unwrap());
    }

    #[test]
    fn missing_model_dir_errors() {
        let err = LocalEmbedder::load(Some("/nonexistent/model"), 64, 8).unwrap_err();
        assert!(matches!(err, EmbedError::ModelNotFound { .. }));
    }
}
