//! Single-flight coordination of credential refreshes.
//!
//! The coordinator is a two-state machine. The first caller that hits an
//! authorization failure while it is [`RefreshState::Idle`] becomes the
//! leader and runs the refresh; every caller that fails while it is
//! [`RefreshState::Refreshing`] parks its request in a FIFO queue and waits.
//! When the leader settles, each parked request is handed back to its owner
//! together with the outcome, in queue order.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::transport::PendingRequest;
use super::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

/// Outcome of a refresh: the new access token or the shared failure.
pub type RefreshOutcome = Result<String, GatewayError>;

/// A parked request handed back once the refresh settled.
#[derive(Debug)]
pub struct Resumption {
    pub request: PendingRequest,
    pub outcome: RefreshOutcome,
}

struct Continuation {
    request: PendingRequest,
    resume: oneshot::Sender<Resumption>,
}

struct Inner {
    state: RefreshState,
    queue: VecDeque<Continuation>,
}

pub struct RefreshCoordinator {
    inner: Mutex<Inner>,
}

pub enum Admission<'a> {
    /// This caller runs the refresh; its own request is returned untouched.
    Leader(RefreshTicket<'a>, PendingRequest),
    /// A refresh is already running; the request now waits in the queue.
    Queued(oneshot::Receiver<Resumption>),
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RefreshState::Idle,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> RefreshState {
        self.inner.lock().state
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn admit(&self, request: PendingRequest) -> Admission<'_> {
        let mut inner = self.inner.lock();
        match inner.state {
            RefreshState::Idle => {
                inner.state = RefreshState::Refreshing;
                Admission::Leader(
                    RefreshTicket {
                        coordinator: self,
                        settled: false,
                    },
                    request,
                )
            }
            RefreshState::Refreshing => {
                let (resume, rx) = oneshot::channel();
                inner.queue.push_back(Continuation { request, resume });
                Admission::Queued(rx)
            }
        }
    }

    fn finish(&self, outcome: RefreshOutcome) -> usize {
        let drained = {
            let mut inner = self.inner.lock();
            inner.state = RefreshState::Idle;
            std::mem::take(&mut inner.queue)
        };
        let count = drained.len();
        for continuation in drained {
            // A waiter that went away simply drops its request.
            let _ = continuation.resume.send(Resumption {
                request: continuation.request,
                outcome: outcome.clone(),
            });
        }
        count
    }
}

/// Held by the leader for the duration of one refresh attempt.
///
/// Dropping an unsettled ticket fails the queue and returns the coordinator
/// to idle, so the state machine can never get stuck in `Refreshing`.
pub struct RefreshTicket<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl RefreshTicket<'_> {
    /// Resumes every queued caller in FIFO order and returns to idle.
    /// Returns the number of callers resumed.
    pub fn settle(mut self, outcome: RefreshOutcome) -> usize {
        self.settled = true;
        self.coordinator.finish(outcome)
    }
}

impl Drop for RefreshTicket<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator.finish(Err(GatewayError::refresh_failed(
                GatewayError::Network("refresh abandoned".into()),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ApiRequest;

    #[test]
    fn first_admission_leads_and_later_ones_queue() {
        let coordinator = RefreshCoordinator::new();
        let ticket = match coordinator.admit(ApiRequest::get("/a")) {
            Admission::Leader(ticket, request) => {
                assert_eq!(request.path, "/a");
                ticket
            }
            Admission::Queued(_) => panic!("first caller must lead"),
        };
        assert_eq!(coordinator.state(), RefreshState::Refreshing);

        let mut receivers = Vec::new();
        for path in ["/b", "/c"] {
            match coordinator.admit(ApiRequest::get(path)) {
                Admission::Queued(rx) => receivers.push(rx),
                Admission::Leader(..) => panic!("second leader while refreshing"),
            }
        }
        assert_eq!(coordinator.queued(), 2);

        assert_eq!(ticket.settle(Ok("fresh".into())), 2);
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(coordinator.queued(), 0);

        let resumed: Vec<_> = receivers
            .into_iter()
            .map(|mut rx| rx.try_recv().unwrap())
            .collect();
        assert_eq!(resumed[0].request.path, "/b");
        assert_eq!(resumed[1].request.path, "/c");
        assert!(resumed.iter().all(|r| r.outcome == Ok("fresh".to_string())));
    }

    #[test]
    fn dropped_ticket_fails_queue_and_resets() {
        let coordinator = RefreshCoordinator::new();
        let ticket = match coordinator.admit(ApiRequest::get("/a")) {
            Admission::Leader(ticket, _) => ticket,
            Admission::Queued(_) => unreachable!(),
        };
        let mut rx = match coordinator.admit(ApiRequest::get("/b")) {
            Admission::Queued(rx) => rx,
            Admission::Leader(..) => unreachable!(),
        };

        drop(ticket);

        assert_eq!(coordinator.state(), RefreshState::Idle);
        let resumed = rx.try_recv().unwrap();
        assert!(matches!(resumed.outcome, Err(GatewayError::RefreshFailed(_))));

        // A fresh failure after the reset starts a new refresh.
        assert!(matches!(
            coordinator.admit(ApiRequest::get("/c")),
            Admission::Leader(..)
        ));
    }
}
