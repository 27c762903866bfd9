use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::job::{JobResult, RunId};

/// Outcome of routing a job result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// Queued for the run's aggregator.
    Routed,
    /// The run was already finalized; the result is dropped.
    Closed,
}

struct Route {
    sender: mpsc::UnboundedSender<JobResult>,
    receiver: Option<mpsc::UnboundedReceiver<JobResult>>,
}

impl Route {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

#[derive(Default)]
struct RouterState {
    routes: HashMap<RunId, Route>,
    closed: HashSet<RunId>,
}

/// Per-run fan-in channel between render machines and the aggregator.
///
/// Results delivered before the aggregator subscribes are buffered. Once a
/// run is closed every further result for it is refused.
#[derive(Clone, Default)]
pub struct ResultRouter {
    inner: Arc<Mutex<RouterState>>,
}

impl std::fmt::Debug for ResultRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("ResultRouter");

        match self.inner.try_lock() {
            Ok(state) => {
                debug.field("open", &state.routes.len());
                debug.field("closed", &state.closed.len());
            }
            Err(_) => {
                debug.field("routes", &"<locked>");
            }
        }

        debug.finish_non_exhaustive()
    }
}

impl ResultRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a result to the aggregator of its run.
    pub async fn deliver(&self, result: JobResult) -> Delivery {
        let mut state = self.inner.lock().await;
        if state.closed.contains(&result.run_id) {
            return Delivery::Closed;
        }

        let route = state.routes.entry(result.run_id).or_insert_with(Route::new);
        if route.sender.send(result).is_err() {
            // The subscriber went away without closing; results are recovered
            // from the step log by the next subscriber.
            tracing::debug!("result route has no live subscriber");
        }
        Delivery::Routed
    }

    /// Take the receiving end for a run. A second subscription replaces the
    /// channel; anything buffered in the old one is recovered from the step
    /// log. Returns `None` once the run is closed.
    pub async fn subscribe(&self, run_id: RunId) -> Option<ResultSubscription> {
        let mut state = self.inner.lock().await;
        if state.closed.contains(&run_id) {
            return None;
        }

        let route = state.routes.entry(run_id).or_insert_with(Route::new);
        let receiver = match route.receiver.take() {
            Some(receiver) => receiver,
            None => {
                *route = Route::new();
                route.receiver.take()?
            }
        };

        Some(ResultSubscription { run_id, receiver })
    }

    /// Stop routing results for a run.
    pub async fn close(&self, run_id: RunId) {
        let mut state = self.inner.lock().await;
        state.routes.remove(&run_id);
        state.closed.insert(run_id);
    }

    pub async fn is_closed(&self, run_id: RunId) -> bool {
        self.inner.lock().await.closed.contains(&run_id)
    }
}

/// Receiving end of a run's result channel.
#[derive(Debug)]
pub struct ResultSubscription {
    run_id: RunId,
    receiver: mpsc::UnboundedReceiver<JobResult>,
}

impl ResultSubscription {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Next result, or `None` when the run was closed.
    pub async fn recv(&mut self) -> Option<JobResult> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_results_are_buffered_until_subscription() {
        let router = ResultRouter::new();
        let run_id = RunId::for_revision("rev-1");

        let delivery = router
            .deliver(JobResult::success(run_id, "A", "generated/A_poster.pdf"))
            .await;
        assert_eq!(delivery, Delivery::Routed);

        let mut sub = router.subscribe(run_id).await.unwrap();
        let result = sub.recv().await.unwrap();
        assert_eq!(result.sku, "A");
    }

    #[tokio::test]
    async fn test_closed_run_refuses_results() {
        let router = ResultRouter::new();
        let run_id = RunId::for_revision("rev-1");

        let mut sub = router.subscribe(run_id).await.unwrap();
        router.close(run_id).await;

        assert!(sub.recv().await.is_none());
        assert!(router.is_closed(run_id).await);
        assert_eq!(
            router.deliver(JobResult::failure(run_id, "B", "late")).await,
            Delivery::Closed
        );
        assert!(router.subscribe(run_id).await.is_none());
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_channel() {
        let router = ResultRouter::new();
        let run_id = RunId::for_revision("rev-1");

        let first = router.subscribe(run_id).await.unwrap();
        drop(first);

        let mut second = router.subscribe(run_id).await.unwrap();
        router
            .deliver(JobResult::success(run_id, "C", "generated/C_poster.pdf"))
            .await;
        assert_eq!(second.recv().await.unwrap().sku, "C");
        assert_eq!(second.run_id(), run_id);
    }
}
