use std::{ops::ControlFlow, thread, time::Duration};

use super::{EngineError, GenerationEngine, SamplingParams, TokenBatch};

#[derive(Debug, Clone)]
pub enum Script {
    Echo,
    Fixed(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SyntheticEngine {
    script: Script,
    prefill_delay: Duration,
    token_delay: Duration,
    completion_delay: Duration,
    fail_after: Option<usize>,
    fail_tokenization: bool,
}

impl SyntheticEngine {
    pub fn echo() -> Self {
        Self::new(Script::Echo)
    }

    pub fn scripted<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Script::Fixed(fragments.into_iter().map(Into::into).collect()))
    }

    fn new(script: Script) -> Self {
        Self {
            script,
            prefill_delay: Duration::ZERO,
            token_delay: Duration::ZERO,
            completion_delay: Duration::ZERO,
            fail_after: None,
            fail_tokenization: false,
        }
    }

    pub fn with_prefill_delay(mut self, delay: Duration) -> Self {
        self.prefill_delay = delay;
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    // Busy after the last fragment, like a model that never hits its stop condition.
    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }

    /// Fails with an inference error once `count` fragments have been emitted.
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn failing_tokenization(mut self) -> Self {
        self.fail_tokenization = true;
        self
    }
}

impl GenerationEngine for SyntheticEngine {
    fn tokenize(&self, prompt: &str) -> Result<TokenBatch, EngineError> {
        if self.fail_tokenization {
            return Err(EngineError::Tokenizer(
                "synthetic tokenizer rejected the prompt".into(),
            ));
        }

        let pieces: Vec<String> = prompt
            .split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect();
        let ids = (0..pieces.len() as u32).collect();
        Ok(TokenBatch::new(ids, pieces))
    }

    fn generate(
        &self,
        tokens: TokenBatch,
        params: &SamplingParams,
        on_fragment: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        let fragments = match &self.script {
            Script::Echo => tokens.pieces().to_vec(),
            Script::Fixed(fragments) => fragments.clone(),
        };

        thread::sleep(self.prefill_delay);

        for (emitted, fragment) in fragments.iter().take(params.max_new_tokens).enumerate() {
            if self.fail_after == Some(emitted) {
                return Err(EngineError::Inference(format!(
                    "synthetic failure after {emitted} fragments"
                )));
            }
            if emitted > 0 {
                thread::sleep(self.token_delay);
            }
            if on_fragment(fragment).is_break() {
                return Ok(());
            }
        }

        thread::sleep(self.completion_delay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(engine: &SyntheticEngine, prompt: &str, max_new_tokens: usize) -> (Vec<String>, bool) {
        let tokens = engine.tokenize(prompt).expect("tokenize");
        let params = SamplingParams {
            max_new_tokens,
            temperature: 0.7,
            top_p: 0.95,
        };
        let mut seen = Vec::new();
        let ok = engine
            .generate(tokens, &params, &mut |fragment| {
                seen.push(fragment.to_string());
                ControlFlow::Continue(())
            })
            .is_ok();
        (seen, ok)
    }

    #[test]
    fn echo_replays_prompt_pieces_in_order() {
        let (seen, ok) = run(&SyntheticEngine::echo(), "the quick  fox", 16);
        assert!(ok);
        assert_eq!(seen, vec!["the ", "quick ", " ", "fox"]);
        assert_eq!(seen.concat(), "the quick  fox");
    }

    #[test]
    fn max_new_tokens_caps_output() {
        let (seen, _) = run(&SyntheticEngine::scripted(["a", "b", "c"]), "x", 2);
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn failure_stops_emission() {
        let engine = SyntheticEngine::scripted(["a", "b", "c"]).failing_after(1);
        let (seen, ok) = run(&engine, "x", 16);
        assert!(!ok);
        assert_eq!(seen, vec!["a"]);
    }

    #[test]
    fn break_from_callback_stops_early() {
        let engine = SyntheticEngine::scripted(["a", "b", "c"]);
        let tokens = engine.tokenize("x").unwrap();
        let mut calls = 0;
        engine
            .generate(tokens, &SamplingParams::warmup(), &mut |_| {
                calls += 1;
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn tokenize_splits_after_whitespace() {
        let engine = SyntheticEngine::echo();
        let tokens = engine.tokenize("a b\nc").unwrap();
        assert_eq!(tokens.pieces(), ["a ", "b\n", "c"]);
        assert_eq!(tokens.ids(), [0, 1, 2]);
        assert!(engine.tokenize("").unwrap().is_empty());
    }

    #[test]
    fn tokenization_failure_is_reported() {
        let err = SyntheticEngine::echo()
            .failing_tokenization()
            .tokenize("hi")
            .unwrap_err();
        assert!(matches!(err, EngineError::Tokenizer(_)));
    }
}
