//! Headless immersive space manager.
//!
//! Stands in for the platform's open/dismiss service. Every request is
//! acknowledged on a helper thread after a fixed latency and the completion
//! is handed to a sink, normally a calloop channel feeding the event loop.

use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::immersion::{RequestId, SpaceCompletion, SpaceRequest, SpaceRequester, TransitionOutcome};

/// Completes immersive space requests asynchronously.
pub struct HeadlessSpaceManager<S> {
    latency: Duration,
    sink: S,
}

impl<S> HeadlessSpaceManager<S>
where
    S: Fn(SpaceCompletion) + Clone + Send + 'static,
{
    pub fn new(latency: Duration, sink: S) -> Self {
        Self { latency, sink }
    }

    fn complete_later(&self, id: RequestId, request: SpaceRequest) {
        let sink = self.sink.clone();
        let latency = self.latency;
        let spawned = thread::Builder::new()
            .name(format!("space-{}-{}", request.as_str(), id.0))
            .spawn(move || {
                thread::sleep(latency);
                debug!(request_id = id.0, "{} request completed", request.as_str());
                sink(SpaceCompletion {
                    id,
                    request,
                    outcome: TransitionOutcome::Completed,
                });
            });
        if let Err(e) = spawned {
            warn!(request_id = id.0, "failed to spawn completion thread: {}", e);
            (self.sink)(SpaceCompletion {
                id,
                request,
                outcome: TransitionOutcome::Failed,
            });
        }
    }
}

impl<S> SpaceRequester for HeadlessSpaceManager<S>
where
    S: Fn(SpaceCompletion) + Clone + Send + 'static,
{
    fn request_open(&mut self, id: RequestId) {
        self.complete_later(id, SpaceRequest::Open);
    }

    fn request_dismiss(&mut self, id: RequestId) {
        self.complete_later(id, SpaceRequest::Dismiss);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_requests_complete_asynchronously() {
        let (tx, rx) = mpsc::channel();
        let mut mgr = HeadlessSpaceManager::new(Duration::from_millis(20), move |c| {
            let _ = tx.send(c);
        });

        let start = Instant::now();
        mgr.request_open(RequestId(1));
        // The call returns before the completion exists.
        assert!(rx.try_recv().is_err());

        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(
            completion,
            SpaceCompletion {
                id: RequestId(1),
                request: SpaceRequest::Open,
                outcome: TransitionOutcome::Completed,
            }
        );

        mgr.request_dismiss(RequestId(2));
        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(completion.id, RequestId(2));
        assert_eq!(completion.request, SpaceRequest::Dismiss);
    }
}
