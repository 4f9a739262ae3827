use std::{ops::ControlFlow, sync::Arc, thread, time::Duration};

use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    engine::{GenerationEngine, SamplingParams, TokenBatch},
    error::ServiceError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerExit {
    Completed,
    ConsumerGone,
    Failed(String),
    /// The thread is left running, detached.
    TimedOut,
}

pub struct ProducerHandle {
    request_id: Uuid,
    done: oneshot::Receiver<ProducerExit>,
}

/// `permit`, when present, is held for the thread's whole lifetime.
pub fn spawn_producer(
    request_id: Uuid,
    engine: Arc<dyn GenerationEngine>,
    tokens: TokenBatch,
    params: SamplingParams,
    sink: flume::Sender<String>,
    permit: Option<OwnedSemaphorePermit>,
) -> Result<ProducerHandle, ServiceError> {
    let (done_tx, done_rx) = oneshot::channel();

    thread::Builder::new()
        .name(format!("generate-{}", request_id.simple()))
        .spawn(move || {
            let _permit = permit;
            let mut consumer_gone = false;

            let result = engine.generate(tokens, &params, &mut |fragment| {
                if sink.send(fragment.to_owned()).is_ok() {
                    ControlFlow::Continue(())
                } else {
                    consumer_gone = true;
                    ControlFlow::Break(())
                }
            });
            drop(sink);

            let exit = match result {
                Ok(()) if consumer_gone => ProducerExit::ConsumerGone,
                Ok(()) => ProducerExit::Completed,
                Err(err) => {
                    warn!(
                        %request_id,
                        error = %err,
                        "generation failed, finishing with partial output"
                    );
                    ProducerExit::Failed(err.to_string())
                }
            };
            debug!(%request_id, ?exit, "producer finished");
            let _ = done_tx.send(exit);
        })
        .map_err(|err| ServiceError::Generation(format!("failed to spawn producer: {err}")))?;

    Ok(ProducerHandle {
        request_id,
        done: done_rx,
    })
}

impl ProducerHandle {
    pub async fn join(self, timeout: Duration) -> ProducerExit {
        match tokio::time::timeout(timeout, self.done).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(_)) => {
                warn!(request_id = %self.request_id, "producer thread ended without reporting");
                ProducerExit::Failed("producer thread panicked".into())
            }
            Err(_) => {
                warn!(
                    request_id = %self.request_id,
                    timeout_secs = timeout.as_secs_f64(),
                    "producer did not finish in time, detaching"
                );
                ProducerExit::TimedOut
            }
        }
    }
}
