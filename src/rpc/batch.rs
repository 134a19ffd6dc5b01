//! Write coalescing: queueing calls and flushing them as multicalls

use crate::error::{NitrateError, NitrateResult};
use crate::rpc::{Remote, RemoteCall, RemoteFault};
use serde_json::Value;
use tracing::{debug, warn};

/// Outcome of one queued call after a batch flush
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub method: String,
    pub outcome: Result<Value, RemoteFault>,
}

impl BatchResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Queue state for a batch session
///
/// `Idle -> Collecting -> Idle`. Nesting is rejected.
#[derive(Debug)]
pub(crate) struct BatchQueue<T> {
    collecting: bool,
    items: Vec<T>,
}

impl<T> BatchQueue<T> {
    pub fn new() -> Self {
        Self {
            collecting: false,
            items: Vec::new(),
        }
    }

    pub fn begin(&mut self) -> NitrateResult<()> {
        if self.collecting {
            return Err(NitrateError::BatchActive);
        }
        self.collecting = true;
        Ok(())
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Leave the collecting state, handing back everything queued
    pub fn finish(&mut self) -> NitrateResult<Vec<T>> {
        if !self.collecting {
            return Err(NitrateError::NoBatch);
        }
        self.collecting = false;
        Ok(std::mem::take(&mut self.items))
    }
}

/// Issue `calls` in slices of at most `max_calls`, one multicall per slice
///
/// Always returns exactly one result per call, in order. A slice whose
/// multicall fails as a whole hands that fault to each of its calls; the
/// remaining slices are still sent.
pub(crate) fn flush(remote: &dyn Remote, calls: &[RemoteCall], max_calls: usize) -> Vec<BatchResult> {
    let max_calls = max_calls.max(1);
    let mut results = Vec::with_capacity(calls.len());

    for (index, slice) in calls.chunks(max_calls).enumerate() {
        debug!("Sending multicall slice {} with {} calls", index, slice.len());

        let outcomes: Vec<Result<Value, RemoteFault>> = match remote.batch_call(slice) {
            Ok(mut outcomes) => {
                if outcomes.len() != slice.len() {
                    warn!(
                        "Multicall returned {} results for {} calls",
                        outcomes.len(),
                        slice.len()
                    );
                    outcomes.truncate(slice.len());
                    while outcomes.len() < slice.len() {
                        outcomes.push(Err(RemoteFault::new(
                            RemoteFault::TRANSPORT,
                            "no result returned for call",
                        )));
                    }
                }
                outcomes
            }
            Err(fault) => {
                warn!("Multicall slice {} failed: {}", index, fault);
                vec![Err(fault); slice.len()]
            }
        };

        results.extend(slice.iter().zip(outcomes).map(|(call, outcome)| BatchResult {
            method: call.method.clone(),
            outcome,
        }));
    }

    results
}
