use std::{sync::Arc, time::Instant};

use tokio::{sync::Semaphore, task};

use crate::{
    engine::{GenerationEngine, TokenBatch},
    error::ServiceError,
};

#[derive(Debug)]
pub struct Tokenized {
    pub tokens: TokenBatch,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Clone)]
pub struct TokenizerPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl TokenizerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// The bracket includes time spent queued for a free worker.
    pub async fn tokenize(
        &self,
        engine: Arc<dyn GenerationEngine>,
        prompt: String,
    ) -> Result<Tokenized, ServiceError> {
        let started = Instant::now();
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::Other("tokenizer pool closed".into()))?;

        let tokens = task::spawn_blocking(move || {
            let _permit = permit;
            engine.tokenize(&prompt)
        })
        .await
        .map_err(|err| ServiceError::Tokenization(format!("tokenizer task failed: {err}")))??;

        Ok(Tokenized {
            tokens,
            started,
            finished: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyntheticEngine;

    #[tokio::test]
    async fn brackets_the_tokenizer_call() {
        let pool = TokenizerPool::new(4);
        let engine: Arc<dyn GenerationEngine> = Arc::new(SyntheticEngine::echo());

        let tokenized = pool.tokenize(engine, "a b c".into()).await.unwrap();

        assert_eq!(tokenized.tokens.len(), 3);
        assert!(tokenized.finished >= tokenized.started);
    }

    #[tokio::test]
    async fn failure_surfaces_as_tokenization_error() {
        let pool = TokenizerPool::new(1);
        let engine: Arc<dyn GenerationEngine> =
            Arc::new(SyntheticEngine::echo().failing_tokenization());

        let err = pool.tokenize(engine, "a".into()).await.unwrap_err();

        assert!(matches!(err, ServiceError::Tokenization(_)));
    }

    #[test]
    fn zero_workers_still_gets_one() {
        assert_eq!(TokenizerPool::new(0).workers(), 1);
    }
}
