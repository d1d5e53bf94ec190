//! Merging of remote updates into the local session copy.
//!
//! Snapshots replace the whole session object ("last writer wins" by sender
//! timestamp); participants and stories only ever grow. Concurrent divergent
//! edits are NOT merged: whichever snapshot carries the later timestamp wins
//! and the other edit is lost on every peer that sees both. Clock skew between
//! peers shifts which one that is. This is a known consistency weakness of the
//! protocol, kept as is.

use crate::model::{Participant, SessionState, Story, Vote, VoteOutcome};
use crate::protocol::{EstimatePayload, Payload, PeerMessage, VotePayload};

/// Element-level changes surfaced to the UI (toasts, notifications).
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    NewParticipant(Participant),
    NewStory(Story),
    VoteRecorded { story_id: String, vote: Vote },
    EstimateSet { story_id: String, estimate: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub state: Option<SessionState>,
    pub changed: bool,
    pub effects: Vec<SideEffect>,
}

impl Reconciled {
    fn unchanged(local: Option<&SessionState>) -> Self {
        Self {
            state: local.cloned(),
            changed: false,
            effects: Vec::new(),
        }
    }
}

/// Pure merge of one incoming payload into `local`.
pub fn reconcile(local: Option<&SessionState>, payload: &Payload) -> Reconciled {
    match payload {
        Payload::Snapshot(incoming) => {
            if local == Some(incoming) {
                return Reconciled::unchanged(local);
            }
            Reconciled {
                state: Some(incoming.clone()),
                changed: true,
                effects: Vec::new(),
            }
        }
        Payload::SyncRequest(_) => Reconciled::unchanged(local),
        element => {
            let Some(current) = local else {
                tracing::debug!(target = "sync", "no session yet; dropping element event");
                return Reconciled::unchanged(local);
            };
            let mut next = current.clone();
            let effect = apply_element(&mut next, element);
            match effect {
                Some(effect) => Reconciled {
                    state: Some(next),
                    changed: true,
                    effects: vec![effect],
                },
                None => Reconciled::unchanged(local),
            }
        }
    }
}

fn apply_element(state: &mut SessionState, payload: &Payload) -> Option<SideEffect> {
    match payload {
        Payload::Participant(participant) => state
            .add_participant(participant.clone())
            .then(|| SideEffect::NewParticipant(participant.clone())),
        Payload::Story(story) => state
            .add_story(story.clone())
            .then(|| SideEffect::NewStory(story.clone())),
        Payload::Vote(VotePayload { story_id, vote }) => {
            match state.record_vote(story_id, vote.clone()) {
                VoteOutcome::Appended | VoteOutcome::Replaced => Some(SideEffect::VoteRecorded {
                    story_id: story_id.clone(),
                    vote: vote.clone(),
                }),
                VoteOutcome::Unchanged | VoteOutcome::UnknownStory => None,
            }
        }
        Payload::Estimate(EstimatePayload { story_id, estimate }) => state
            .set_estimate(story_id, estimate)
            .then(|| SideEffect::EstimateSet {
                story_id: story_id.clone(),
                estimate: estimate.clone(),
            }),
        Payload::Snapshot(_) | Payload::SyncRequest(_) => None,
    }
}

/// Owner of the local session copy. Tracks the timestamp of the snapshot the
/// copy currently reflects so older snapshots arriving late are dropped.
#[derive(Debug, Default)]
pub struct Reconciler {
    state: Option<SessionState>,
    snapshot_at: Option<i64>,
}

impl Reconciler {
    pub fn new(initial: Option<SessionState>) -> Self {
        Self {
            state: initial,
            snapshot_at: None,
        }
    }

    pub fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    pub fn snapshot_at(&self) -> Option<i64> {
        self.snapshot_at
    }

    pub fn apply(&mut self, message: &PeerMessage, payload: &Payload) -> Reconciled {
        if matches!(payload, Payload::Snapshot(_))
            && self.snapshot_at.is_some_and(|seen| message.timestamp < seen)
        {
            tracing::debug!(
                target = "sync",
                sender = %message.sender,
                timestamp = message.timestamp,
                "dropping stale snapshot"
            );
            return Reconciled::unchanged(self.state.as_ref());
        }
        let result = reconcile(self.state.as_ref(), payload);
        if matches!(payload, Payload::Snapshot(_)) {
            self.note_snapshot(message.timestamp);
        }
        if result.changed {
            self.state = result.state.clone();
        }
        result
    }

    /// Accepts a snapshot regardless of timestamps (initial bootstrap).
    pub fn adopt(&mut self, message: &PeerMessage, state: SessionState) -> Reconciled {
        self.snapshot_at = Some(message.timestamp);
        let result = reconcile(self.state.as_ref(), &Payload::Snapshot(state));
        if result.changed {
            self.state = result.state.clone();
        }
        result
    }

    /// Runs a local edit. Returns false when there is no session to edit.
    pub fn edit(&mut self, change: impl FnOnce(&mut SessionState) -> bool) -> bool {
        match self.state.as_mut() {
            Some(state) => change(state),
            None => false,
        }
    }

    pub fn replace(&mut self, state: SessionState) {
        self.state = Some(state);
    }

    pub fn note_snapshot(&mut self, timestamp: i64) {
        self.snapshot_at = Some(self.snapshot_at.map_or(timestamp, |seen| seen.max(timestamp)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, PeerId};
    use serde_json::Value;

    fn base() -> SessionState {
        SessionState::new("S1", "Sprint", Participant::new("alice", "Alice"))
    }

    fn stamped(kind: MessageKind, timestamp: i64) -> PeerMessage {
        PeerMessage {
            kind,
            data: Value::Null,
            sender: PeerId::from("bob"),
            timestamp,
            reply_to: None,
        }
    }

    #[test]
    fn identical_snapshot_is_a_no_op() {
        let local = base();
        let result = reconcile(Some(&local), &Payload::Snapshot(local.clone()));
        assert!(!result.changed);
        assert!(result.effects.is_empty());
    }

    #[test]
    fn applying_same_snapshot_twice_has_no_second_effect() {
        let mut reconciler = Reconciler::new(None);
        let mut incoming = base();
        incoming.add_participant(Participant::new("bob", "Bob"));
        let payload = Payload::Snapshot(incoming.clone());

        let first = reconciler.apply(&stamped(MessageKind::UpdateSession, 10), &payload);
        assert!(first.changed);
        let second = reconciler.apply(&stamped(MessageKind::UpdateSession, 10), &payload);
        assert!(!second.changed);
        assert!(second.effects.is_empty());
        assert_eq!(reconciler.state(), Some(&incoming));
    }

    #[test]
    fn older_snapshot_loses_to_newer_one() {
        let mut reconciler = Reconciler::new(Some(base()));
        let mut newer = base();
        newer.name = "Newer".into();
        let mut older = base();
        older.name = "Older".into();

        reconciler.apply(&stamped(MessageKind::UpdateSession, 200), &Payload::Snapshot(newer));
        let result =
            reconciler.apply(&stamped(MessageKind::UpdateSession, 100), &Payload::Snapshot(older));
        assert!(!result.changed);
        assert_eq!(reconciler.state().map(|s| s.name.as_str()), Some("Newer"));
        assert_eq!(reconciler.snapshot_at(), Some(200));
    }

    #[test]
    fn element_events_append_once_and_raise_effects() {
        let local = base();
        let bob = Participant::new("bob", "Bob");
        let result = reconcile(Some(&local), &Payload::Participant(bob.clone()));
        assert_eq!(result.effects, vec![SideEffect::NewParticipant(bob.clone())]);

        let merged = result.state.unwrap();
        let again = reconcile(Some(&merged), &Payload::Participant(bob));
        assert!(!again.changed);
        assert!(again.effects.is_empty());

        let story = Story::new("st-1", "Checkout");
        let with_story = reconcile(Some(&merged), &Payload::Story(story.clone()));
        assert_eq!(with_story.effects, vec![SideEffect::NewStory(story)]);
    }

    #[test]
    fn element_events_merge_regardless_of_snapshot_age() {
        let mut reconciler = Reconciler::new(Some(base()));
        reconciler.note_snapshot(500);
        let carol = Participant::new("carol", "Carol");
        let result = reconciler.apply(
            &stamped(MessageKind::NewParticipant, 1),
            &Payload::Participant(carol),
        );
        assert!(result.changed);
        assert_eq!(reconciler.state().unwrap().participants.len(), 2);
    }

    #[test]
    fn votes_and_estimates_update_story() {
        let mut local = base();
        local.add_story(Story::new("st-1", "Checkout"));
        let vote = Vote {
            participant_id: "alice".into(),
            value: "5".into(),
        };
        let voted = reconcile(
            Some(&local),
            &Payload::Vote(VotePayload {
                story_id: "st-1".into(),
                vote: vote.clone(),
            }),
        );
        assert_eq!(
            voted.effects,
            vec![SideEffect::VoteRecorded {
                story_id: "st-1".into(),
                vote
            }]
        );

        let estimate = Payload::Estimate(EstimatePayload {
            story_id: "st-1".into(),
            estimate: "5".into(),
        });
        let estimated = reconcile(voted.state.as_ref(), &estimate);
        assert!(estimated.changed);
        let repeat = reconcile(estimated.state.as_ref(), &estimate);
        assert!(!repeat.changed);

        let unknown = reconcile(
            Some(&local),
            &Payload::Estimate(EstimatePayload {
                story_id: "nope".into(),
                estimate: "3".into(),
            }),
        );
        assert!(!unknown.changed);
    }

    #[test]
    fn element_event_without_session_is_dropped() {
        let result = reconcile(None, &Payload::Participant(Participant::new("bob", "Bob")));
        assert!(!result.changed);
        assert_eq!(result.state, None);
    }
}
