use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::device::select_device;
use crate::error::{EmbedError, Result};

const MAX_SEQ_LEN: usize = 512;

/// BERT encoder with a single-logit classification head, the usual
/// cross-encoder layout (BGE-reranker and friends).
struct ClassifierModel {
    bert: BertModel,
    classifier: Linear,
}

impl ClassifierModel {
    fn load(vb: VarBuilder, config: &Config) -> candle_core::Result<Self> {
        let bert = if vb.contains_tensor("bert.embeddings.word_embeddings.weight") {
            BertModel::load(vb.pp("bert"), config)?
        } else if vb.contains_tensor("roberta.embeddings.word_embeddings.weight") {
            BertModel::load(vb.pp("roberta"), config)?
        } else {
            BertModel::load(vb.clone(), config)?
        };
        let classifier = candle_nn::linear(config.hidden_size, 1, vb.pp("classifier"))?;
        Ok(Self { bert, classifier })
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        let output = self.bert.forward(input_ids, token_type_ids, attention_mask)?;
        let cls = output.i((.., 0, ..))?;
        self.classifier.forward(&cls)
    }
}

enum Backend {
    Model {
        model: Mutex<ClassifierModel>,
        tokenizer: Tokenizer,
        device: Device,
    },
    /// Lexical-overlap scoring so rerank behavior is exercisable in tests.
    Stub,
}

/// Local cross-encoder. Scores are squashed through a sigmoid so callers
/// always see relevance in [0, 1].
pub struct CrossEncoder {
    backend: Backend,
}

impl std::fmt::Debug for CrossEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossEncoder")
            .field(
                "backend",
                &match &self.backend {
                    Backend::Model { device, .. } => format!("Model({:?})", device),
                    Backend::Stub => "Stub".to_string(),
                },
            )
            .finish()
    }
}

impl CrossEncoder {
    pub fn load(model_path: Option<&str>) -> Result<Self> {
        let Some(path) = model_path else {
            warn!("no rerank model configured, running lexical stub reranker");
            return Ok(Self {
                backend: Backend::Stub,
            });
        };

        let dir = PathBuf::from(path);
        if !dir.exists() {
            return Err(EmbedError::ModelNotFound {
                path: path.to_string(),
            });
        }

        let device = select_device();
        let (model, tokenizer) = Self::load_model(&dir, &device)?;
        info!(model_path = path, "cross-encoder reranker loaded");
        Ok(Self {
            backend: Backend::Model {
                model: Mutex::new(model),
                tokenizer,
                device,
            },
        })
    }

    fn load_model(dir: &Path, device: &Device) -> Result<(ClassifierModel, Tokenizer)> {
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
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[dir.join("model.safetensors")], DType::F32, device)
                .map_err(|e| EmbedError::ModelLoadFailed {
                    reason: e.to_string(),
                })?
        };
        let model = ClassifierModel::load(vb, &config).map_err(|e| EmbedError::ModelLoadFailed {
            reason: e.to_string(),
        })?;
        Ok((model, tokenizer))
    }

    pub fn is_stub(&self) -> bool {
        matches!(self.backend, Backend::Stub)
    }

    /// Relevance of one candidate in [0, 1].
    pub fn score(&self, query: &str, candidate: &str) -> Result<f64> {
        match &self.backend {
            Backend::Model {
                model,
                tokenizer,
                device,
            } => {
                let encoding = tokenizer.encode((query, candidate), true).map_err(|e| {
                    EmbedError::TokenizationFailed {
                        reason: e.to_string(),
                    }
                })?;
                let mut ids: Vec<u32> = encoding.get_ids().to_vec();
                ids.truncate(MAX_SEQ_LEN);
                let mut type_ids: Vec<u32> = encoding.get_type_ids().to_vec();
                type_ids.truncate(ids.len());
                let mut mask: Vec<u32> = encoding.get_attention_mask().to_vec();
                mask.truncate(ids.len());

                let input_ids = Tensor::new(&ids[..], device)?.unsqueeze(0)?;
                let token_type_ids = Tensor::new(&type_ids[..], device)?.unsqueeze(0)?;
                let attention_mask = Tensor::new(&mask[..], device)?.unsqueeze(0)?;

                let logits = model.lock().unwrap().forward(
                    &input_ids,
                    &token_type_ids,
                    Some(&attention_mask),
                )?;
                let logit = logits.flatten_all()?.to_vec1::<f32>()?[0] as f64;
                Ok(sigmoid(logit))
            }
            Backend::Stub => Ok(lexical_score(query, candidate)),
        }
    }

    /// Score every candidate and return `(index, score)` best-first.
    pub fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<(usize, f64)>> {
        debug!(candidates = candidates.len(), "reranking candidates");
        let mut scored: Vec<(usize, f64)> = Vec::with_capacity(candidates.len());
        for (idx, candidate) in candidates.iter().enumerate() {
            scored.push((idx, self.score(query, candidate)?));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored)
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Token-overlap score for stub mode: dice coefficient pushed through a
/// steep sigmoid. Not a model, but monotone in overlap, which is all the
/// tests and dev boxes need.
fn lexical_score(query: &str, candidate: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect()
    };
    let q = tokens(query);
    let c = tokens(candidate);
    if q.is_empty() || c.is_empty() {
        return 0.0;
    }
    let overlap = q.intersection(&c).count() as f64;
    let dice = 2.0 * overlap / (q.len() + c.len()) as f64;
    sigmoid(6.0 * (dice - 0.25)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_prefers_overlapping_candidates() {
        let encoder = CrossEncoder::load(None).unwrap();
        let relevant = encoder
            .score("rust borrow checker", "the rust borrow checker rejects aliasing")
            .unwrap();
        let irrelevant = encoder.score("rust borrow checker", "baking sourdough bread").unwrap();
        assert!(relevant > irrelevant);
        assert!((0.0..=1.0).contains(&relevant));
        assert!((0.0..=1.0).contains(&irrelevant));
    }

    #[test]
    fn rerank_orders_best_first() {
        let encoder = CrossEncoder::load(None).unwrap();
        let candidates = vec![
            "unrelated cooking recipe".to_string(),
            "tokio async runtime internals".to_string(),
            "tokio runtime".to_string(),
        ];
        let ranked = encoder.rerank("tokio runtime", &candidates).unwrap();
        assert_eq!(ranked[0].0, 2);
        assert!(ranked[0].1 >= ranked[1].1);
        assert!(ranked[1].1 >= ranked[2].1);
    }

    #[test]
    fn empty_inputs_score_zero() {
        let encoder = CrossEncoder::load(None).unwrap();
        assert_eq!(encoder.score("", "anything").unwrap(), 0.0);
    }
}
