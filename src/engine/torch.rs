use std::{ops::ControlFlow, path::Path, time::Instant};

use parking_lot::Mutex;
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;

use super::{EngineError, GenerationEngine, LoadTimings, SamplingParams, TokenBatch};
use crate::config::AppConfig;

const EOS_CANDIDATES: [&str; 4] = ["<|endoftext|>", "<|im_end|>", "</s>", "<eos>"];

pub struct TorchEngine {
    tokenizer: Tokenizer,
    module: Mutex<tch::CModule>,
    device: Device,
    eos_token_id: Option<i64>,
}

impl TorchEngine {
    pub fn load(config: &AppConfig) -> Result<(Self, LoadTimings), EngineError> {
        let started = Instant::now();
        let tokenizer = Tokenizer::from_file(config.tokenizer_path.as_path())
            .map_err(|e| EngineError::Load(format!("tokenizer: {e}")))?;
        let tokenizer_loaded = Instant::now();

        let device = parse_device(&config.device);
        let module = load_module(&config.module_path, device)?;
        let model_loaded = Instant::now();

        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| tokenizer.token_to_id(token))
            .map(i64::from);

        let engine = Self {
            tokenizer,
            module: Mutex::new(module),
            device,
            eos_token_id,
        };
        let timings = LoadTimings {
            tokenizer: tokenizer_loaded - started,
            model: model_loaded - tokenizer_loaded,
        };
        Ok((engine, timings))
    }

    fn next_logits(&self, module: &tch::CModule, input_ids: &[i64]) -> Result<Tensor, EngineError> {
        let input = Tensor::from_slice(input_ids)
            .reshape([1, input_ids.len() as i64])
            .to(self.device);

        let output = module
            .forward_is(&[tch::IValue::Tensor(input)])
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        // Traced models return either bare logits or a (logits, past) tuple.
        let logits = match output {
            tch::IValue::Tensor(t) => t,
            tch::IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                tch::IValue::Tensor(t) => t.shallow_clone(),
                _ => {
                    return Err(EngineError::Inference(
                        "expected tensor as first tuple element".into(),
                    ));
                }
            },
            _ => return Err(EngineError::Inference("unexpected model output format".into())),
        };

        Ok(logits.select(1, -1).squeeze())
    }
}

impl GenerationEngine for TorchEngine {
    fn tokenize(&self, prompt: &str) -> Result<TokenBatch, EngineError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        Ok(TokenBatch::new(
            encoding.get_ids().to_vec(),
            encoding.get_tokens().to_vec(),
        ))
    }

    fn generate(
        &self,
        tokens: TokenBatch,
        params: &SamplingParams,
        on_fragment: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        let mut input_ids: Vec<i64> = if tokens.is_empty() {
            vec![0]
        } else {
            tokens.ids().iter().map(|&id| i64::from(id)).collect()
        };

        // Grows with the output; max_new_tokens is client-controlled.
        let mut generated: Vec<u32> = Vec::new();
        let mut emitted_len = 0;

        no_grad(|| {
            let module = self.module.lock();

            for _ in 0..params.max_new_tokens {
                let logits = self.next_logits(&module, &input_ids)?;
                let next = sample(&logits, params);
                if Some(next) == self.eos_token_id {
                    break;
                }
                input_ids.push(next);
                generated.push(next as u32);

                let text = self
                    .tokenizer
                    .decode(&generated, true)
                    .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
                // A trailing replacement char means a multi-byte sequence is still incomplete.
                if text.len() > emitted_len
                    && text.is_char_boundary(emitted_len)
                    && !text.ends_with('\u{FFFD}')
                {
                    let flow = on_fragment(&text[emitted_len..]);
                    emitted_len = text.len();
                    if flow.is_break() {
                        break;
                    }
                }
            }

            Ok::<(), EngineError>(())
        })
    }
}

fn load_module(path: &Path, device: Device) -> Result<tch::CModule, EngineError> {
    if !path.exists() {
        return Err(EngineError::Load(format!(
            "model artifact missing: {}",
            path.display()
        )));
    }
    let mut module = tch::CModule::load_on_device(path, device)
        .map_err(|e| EngineError::Load(e.to_string()))?;
    module.set_eval();
    Ok(module)
}

fn sample(logits: &Tensor, params: &SamplingParams) -> i64 {
    if params.temperature <= 0.0 {
        return logits.argmax(0, false).int64_value(&[]);
    }

    let probs = (logits / params.temperature).softmax(0, Kind::Float);
    let (sorted, indices) = probs.sort(0, true);
    let cumulative = sorted.cumsum(0, Kind::Float);
    let outside_nucleus = (&cumulative - &sorted).gt(params.top_p);
    let kept = sorted.masked_fill(&outside_nucleus, 0.0);
    let choice = kept.multinomial(1, false).int64_value(&[0]);
    indices.int64_value(&[choice])
}

fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            return Device::Cuda(idx);
        }
    }
    Device::Cpu
}
