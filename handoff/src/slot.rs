//! Per-mode response handler slots.
//!
//! Each mode has at most one pending handler. Registering a second request on
//! an occupied slot displaces the first: its caller resolves with
//! `CoordinatorError::Superseded`, and a response that later arrives for it no
//! longer matches any slot and is dropped.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::bridge::protocol::{Mode, Response};
use crate::coordinator::CoordinatorError;

pub(crate) type Reply = Result<Response, CoordinatorError>;

/// A handler waiting on one request.
pub(crate) struct Registration {
    pub mode: Mode,
    pub id: u64,
    pub reply_tx: oneshot::Sender<Reply>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Delivered(Mode),
    /// Matched a slot but the caller had stopped waiting.
    Abandoned(Mode),
    /// No slot holds this id (superseded, or never registered).
    Unmatched,
}

#[derive(Default)]
pub(crate) struct HandlerSlots {
    pending: HashMap<Mode, Registration>,
}

impl HandlerSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Occupy the registration's mode slot, displacing any earlier handler.
    ///
    /// Returns the id of the displaced request.
    pub fn register(&mut self, registration: Registration) -> Option<u64> {
        let mode = registration.mode;
        let id = registration.id;
        let displaced = self.pending.insert(mode, registration)?;

        tracing::warn!(
            %mode,
            displaced_id = displaced.id,
            id,
            "Handler slot reused before its response arrived"
        );
        let _ = displaced.reply_tx.send(Err(CoordinatorError::Superseded {
            mode,
            id: displaced.id,
        }));
        Some(displaced.id)
    }

    /// Hand a reply to whichever slot is waiting on `id`.
    pub fn resolve(&mut self, id: u64, reply: Reply) -> Routed {
        let Some(mode) = self
            .pending
            .iter()
            .find_map(|(mode, pending)| (pending.id == id).then_some(*mode))
        else {
            return Routed::Unmatched;
        };
        let Some(pending) = self.pending.remove(&mode) else {
            return Routed::Unmatched;
        };

        let reply = reply.and_then(|response| match response.mode() {
            Some(found) if found != mode => Err(CoordinatorError::UnexpectedResponse {
                expected: mode,
                found: response.kind(),
            }),
            _ => Ok(response),
        });

        match pending.reply_tx.send(reply) {
            Ok(()) => Routed::Delivered(mode),
            Err(_) => Routed::Abandoned(mode),
        }
    }

    /// Fail every pending handler, e.g. when the worker goes away.
    pub fn fail_all(&mut self, error: impl Fn() -> CoordinatorError) {
        for (mode, pending) in self.pending.drain() {
            tracing::warn!(%mode, id = pending.id, "Failing pending request");
            let _ = pending.reply_tx.send(Err(error()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(mode: Mode, id: u64) -> (Registration, oneshot::Receiver<Reply>) {
        let (reply_tx, rx) = oneshot::channel();
        (Registration { mode, id, reply_tx }, rx)
    }

    #[test]
    fn resolve_delivers_to_matching_slot() {
        let mut slots = HandlerSlots::new();
        let (reg, mut rx) = registration(Mode::Shared, 1);
        assert_eq!(slots.register(reg), None);
        assert_eq!(slots.len(), 1);

        assert_eq!(
            slots.resolve(1, Ok(Response::SharedDone)),
            Routed::Delivered(Mode::Shared)
        );
        assert!(matches!(rx.try_recv(), Ok(Ok(Response::SharedDone))));
        assert_eq!(slots.len(), 0);
    }

    #[test]
    fn reusing_a_slot_supersedes_the_earlier_handler() {
        let mut slots = HandlerSlots::new();
        let (first, mut first_rx) = registration(Mode::Collection, 1);
        let (second, mut second_rx) = registration(Mode::Collection, 2);

        slots.register(first);
        assert_eq!(slots.register(second), Some(1));

        assert!(matches!(
            first_rx.try_recv(),
            Ok(Err(CoordinatorError::Superseded {
                mode: Mode::Collection,
                id: 1
            }))
        ));

        // late response for the displaced request is not delivered to the newer caller
        assert_eq!(
            slots.resolve(1, Ok(Response::CollectionResult(vec![]))),
            Routed::Unmatched
        );
        assert!(second_rx.try_recv().is_err());

        assert_eq!(
            slots.resolve(2, Ok(Response::CollectionResult(vec![2.0]))),
            Routed::Delivered(Mode::Collection)
        );
        assert!(matches!(
            second_rx.try_recv(),
            Ok(Ok(Response::CollectionResult(_)))
        ));
    }

    #[test]
    fn distinct_modes_do_not_interfere() {
        let mut slots = HandlerSlots::new();
        let (scalar, _scalar_rx) = registration(Mode::Scalar, 1);
        let (transfer, _transfer_rx) = registration(Mode::Transfer, 2);

        assert_eq!(slots.register(scalar), None);
        assert_eq!(slots.register(transfer), None);
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn mismatched_response_is_an_error() {
        let mut slots = HandlerSlots::new();
        let (reg, mut rx) = registration(Mode::Scalar, 5);
        slots.register(reg);

        slots.resolve(5, Ok(Response::SharedDone));
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(CoordinatorError::UnexpectedResponse {
                expected: Mode::Scalar,
                found: "SHARED_DONE"
            }))
        ));
    }

    #[test]
    fn rejection_passes_through_to_caller() {
        let mut slots = HandlerSlots::new();
        let (reg, mut rx) = registration(Mode::Scalar, 3);
        slots.register(reg);

        let rejection = Response::Unsupported {
            kind: Some("SCALAR".to_string()),
            reason: "nope".to_string(),
            returned: None,
        };
        slots.resolve(3, Ok(rejection));
        assert!(matches!(rx.try_recv(), Ok(Ok(Response::Unsupported { .. }))));
    }

    #[test]
    fn dropped_caller_is_abandoned() {
        let mut slots = HandlerSlots::new();
        let (reg, rx) = registration(Mode::Scalar, 9);
        slots.register(reg);
        drop(rx);

        assert_eq!(
            slots.resolve(9, Ok(Response::ScalarResult(1.0))),
            Routed::Abandoned(Mode::Scalar)
        );
    }

    #[test]
    fn fail_all_drains_every_slot() {
        let mut slots = HandlerSlots::new();
        let (a, mut a_rx) = registration(Mode::Scalar, 1);
        let (b, mut b_rx) = registration(Mode::Shared, 2);
        slots.register(a);
        slots.register(b);

        slots.fail_all(|| CoordinatorError::ChannelClosed);

        assert_eq!(slots.len(), 0);
        assert!(matches!(a_rx.try_recv(), Ok(Err(CoordinatorError::ChannelClosed))));
        assert!(matches!(b_rx.try_recv(), Ok(Err(CoordinatorError::ChannelClosed))));
    }
}
