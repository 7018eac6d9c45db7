use log::debug;

use super::response::ResponseMessage;
use crate::value::Value;

/// Connection-level protocol state as seen by the client.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub(crate) enum BoltState {
    /// Handshake done, HELLO not yet acknowledged.
    Connected,
    Ready,
    Streaming,
    TxReady,
    // TxStreaming is tracked pessimistically: the server transitions back to
    // TxReady when *all* open result streams are consumed. The client does
    // not need that distinction, which saves tracking the per-qid stream
    // count here.
    TxStreaming,
    Failed,
}

/// Applies server replies to the state machine.
///
/// Illegal transitions panic: the driver controls which requests are sent in
/// which state, so an unexpected reply is a driver bug, not an I/O condition.
#[derive(Debug)]
pub(crate) struct BoltStateTracker {
    state: BoltState,
}

impl BoltStateTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: BoltState::Connected,
        }
    }

    pub(crate) fn state(&self) -> BoltState {
        self.state
    }

    pub(crate) fn success(&mut self, message: ResponseMessage, meta: &Value) {
        if let Value::Map(meta) = meta {
            if matches!(meta.get("has_more"), Some(Value::Boolean(true))) {
                // the stream stays open, no state change
                return;
            }
        }
        let before = self.state;
        self.state = Self::apply(before, message);
        if self.state != before {
            debug!("{message:?}: {before:?} > {:?}", self.state);
        }
    }

    pub(crate) fn failure(&mut self) {
        self.state = BoltState::Failed;
    }

    fn apply(state: BoltState, message: ResponseMessage) -> BoltState {
        use BoltState::*;
        use ResponseMessage::*;
        match (state, message) {
            (Connected, Hello) => Ready,
            (Failed, Hello) => Failed,
            (Connected, message) => panic!("unexpected {message:?} in {state:?}"),
            (_, Reset) => Ready,
            (Ready, Run) => Streaming,
            (TxReady | TxStreaming, Run) => TxStreaming,
            (Streaming, Pull | Discard) => Ready,
            (TxStreaming, Pull | Discard) => TxStreaming,
            (Ready, Begin) => TxReady,
            (TxReady | TxStreaming, Commit | Rollback) => Ready,
            (Ready, Route) => Ready,
            (state, message) => panic!("unexpected {message:?} in {state:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value;
    use rstest::*;

    fn tracker_in(state: BoltState) -> BoltStateTracker {
        let mut tracker = BoltStateTracker::new();
        tracker.success(ResponseMessage::Hello, &value!({}));
        match state {
            BoltState::Connected => return BoltStateTracker::new(),
            BoltState::Ready => {}
            BoltState::Streaming => tracker.success(ResponseMessage::Run, &value!({})),
            BoltState::TxReady => tracker.success(ResponseMessage::Begin, &value!({})),
            BoltState::TxStreaming => {
                tracker.success(ResponseMessage::Begin, &value!({}));
                tracker.success(ResponseMessage::Run, &value!({}));
            }
            BoltState::Failed => tracker.failure(),
        }
        assert_eq!(tracker.state(), state);
        tracker
    }

    #[rstest]
    #[case(BoltState::Ready, ResponseMessage::Run, BoltState::Streaming)]
    #[case(BoltState::Ready, ResponseMessage::Begin, BoltState::TxReady)]
    #[case(BoltState::Ready, ResponseMessage::Route, BoltState::Ready)]
    #[case(BoltState::Streaming, ResponseMessage::Pull, BoltState::Ready)]
    #[case(BoltState::Streaming, ResponseMessage::Discard, BoltState::Ready)]
    #[case(BoltState::TxReady, ResponseMessage::Run, BoltState::TxStreaming)]
    #[case(BoltState::TxReady, ResponseMessage::Commit, BoltState::Ready)]
    #[case(BoltState::TxStreaming, ResponseMessage::Pull, BoltState::TxStreaming)]
    #[case(BoltState::TxStreaming, ResponseMessage::Commit, BoltState::Ready)]
    #[case(BoltState::TxStreaming, ResponseMessage::Rollback, BoltState::Ready)]
    #[case(BoltState::Failed, ResponseMessage::Reset, BoltState::Ready)]
    fn legal_transitions(
        #[case] from: BoltState,
        #[case] message: ResponseMessage,
        #[case] to: BoltState,
    ) {
        let mut tracker = tracker_in(from);
        tracker.success(message, &value!({}));
        assert_eq!(tracker.state(), to);
    }

    #[test]
    fn has_more_keeps_streaming() {
        let mut tracker = tracker_in(BoltState::Streaming);
        tracker.success(ResponseMessage::Pull, &value!({"has_more": true}));
        assert_eq!(tracker.state(), BoltState::Streaming);
        tracker.success(ResponseMessage::Pull, &value!({}));
        assert_eq!(tracker.state(), BoltState::Ready);
    }

    #[test]
    fn failure_then_reset_recovers() {
        let mut tracker = tracker_in(BoltState::Streaming);
        tracker.failure();
        assert_eq!(tracker.state(), BoltState::Failed);
        tracker.success(ResponseMessage::Reset, &value!({}));
        assert_eq!(tracker.state(), BoltState::Ready);
    }

    #[test]
    #[should_panic(expected = "unexpected")]
    fn illegal_transition_panics() {
        let mut tracker = tracker_in(BoltState::Ready);
        tracker.success(ResponseMessage::Pull, &value!({}));
    }
}
