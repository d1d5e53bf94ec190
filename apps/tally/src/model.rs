use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_VOTING_SYSTEM: &str = "fibonacci";

/// Replicated estimation session. Every peer holds its own copy; the copy is
/// overwritten or merged as sync events arrive and no peer is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default = "default_voting_system")]
    pub voting_system: String,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub stories: Vec<Story>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub votes: Vec<Vote>,
    #[serde(default)]
    pub final_estimate: Option<String>,
    #[serde(default)]
    pub status: StoryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub participant_id: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryStatus {
    #[default]
    Pending,
    Voting,
    Discussing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Appended,
    Replaced,
    Unchanged,
    UnknownStory,
}

fn default_voting_system() -> String {
    DEFAULT_VOTING_SYSTEM.to_string()
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            joined_at: Some(Utc::now()),
        }
    }
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            votes: Vec::new(),
            final_estimate: None,
            status: StoryStatus::Pending,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl SessionState {
    /// A fresh session whose only participant is its creator.
    pub fn new(id: impl Into<String>, name: impl Into<String>, creator: Participant) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            creator: creator.name.clone(),
            voting_system: default_voting_system(),
            participants: vec![creator],
            stories: Vec::new(),
            created: Utc::now(),
        }
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    /// Appends unless a participant with the same id is already present.
    pub fn add_participant(&mut self, participant: Participant) -> bool {
        if self.participant(&participant.id).is_some() {
            return false;
        }
        self.participants.push(participant);
        true
    }

    pub fn add_story(&mut self, story: Story) -> bool {
        if self.story(&story.id).is_some() {
            return false;
        }
        self.stories.push(story);
        true
    }

    /// One vote per participant per story; a later vote replaces the earlier value.
    pub fn record_vote(&mut self, story_id: &str, vote: Vote) -> VoteOutcome {
        let Some(story) = self.stories.iter_mut().find(|s| s.id == story_id) else {
            return VoteOutcome::UnknownStory;
        };
        let outcome = match story
            .votes
            .iter_mut()
            .find(|existing| existing.participant_id == vote.participant_id)
        {
            Some(existing) if existing.value == vote.value => return VoteOutcome::Unchanged,
            Some(existing) => {
                existing.value = vote.value;
                VoteOutcome::Replaced
            }
            None => {
                story.votes.push(vote);
                VoteOutcome::Appended
            }
        };
        if story.status == StoryStatus::Pending {
            story.status = StoryStatus::Voting;
        }
        outcome
    }

    /// Returns false when the story is unknown or already carries this estimate.
    pub fn set_estimate(&mut self, story_id: &str, estimate: &str) -> bool {
        let Some(story) = self.stories.iter_mut().find(|s| s.id == story_id) else {
            return false;
        };
        if story.final_estimate.as_deref() == Some(estimate) && story.status == StoryStatus::Completed
        {
            return false;
        }
        story.final_estimate = Some(estimate.to_string());
        story.status = StoryStatus::Completed;
        true
    }

    fn completed(&self) -> impl Iterator<Item = (&Story, &str)> {
        self.stories.iter().filter_map(|story| match (&story.status, &story.final_estimate) {
            (StoryStatus::Completed, Some(estimate)) => Some((story, estimate.as_str())),
            _ => None,
        })
    }

    pub fn velocity(&self) -> f64 {
        self.completed()
            .map(|(_, estimate)| estimate_points(&self.voting_system, estimate))
            .sum()
    }

    pub fn estimate_distribution(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (_, estimate) in self.completed() {
            *counts.entry(estimate.to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn average_points(&self) -> f64 {
        let completed = self.completed().count();
        if completed == 0 {
            return 0.0;
        }
        self.velocity() / completed as f64
    }
}

/// Numeric weight of an estimate card under the given voting system.
pub fn estimate_points(voting_system: &str, estimate: &str) -> f64 {
    if voting_system == "tshirt" {
        return match estimate {
            "XS" => 1.0,
            "S" => 2.0,
            "M" => 3.0,
            "L" => 5.0,
            "XL" => 8.0,
            "XXL" => 13.0,
            _ => 0.0,
        };
    }
    if estimate == "½" {
        return 0.5;
    }
    estimate.trim().parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> SessionState {
        SessionState::new("S1", "Sprint 12", Participant::new("alice", "Alice"))
    }

    #[test]
    fn participants_are_deduplicated_by_id() {
        let mut state = session();
        assert!(state.add_participant(Participant::new("bob", "Bob")));
        assert!(!state.add_participant(Participant::new("bob", "Robert")));
        assert_eq!(state.participants.len(), 2);
        assert_eq!(state.participant("bob").map(|p| p.name.as_str()), Some("Bob"));
    }

    #[test]
    fn later_vote_replaces_earlier_vote() {
        let mut state = session();
        state.add_story(Story::new("st-1", "Login page"));
        let vote = |value: &str| Vote {
            participant_id: "alice".into(),
            value: value.into(),
        };
        assert_eq!(state.record_vote("st-1", vote("3")), VoteOutcome::Appended);
        assert_eq!(state.record_vote("st-1", vote("3")), VoteOutcome::Unchanged);
        assert_eq!(state.record_vote("st-1", vote("5")), VoteOutcome::Replaced);
        assert_eq!(state.record_vote("missing", vote("5")), VoteOutcome::UnknownStory);

        let story = state.story("st-1").unwrap();
        assert_eq!(story.votes.len(), 1);
        assert_eq!(story.votes[0].value, "5");
        assert_eq!(story.status, StoryStatus::Voting);
    }

    #[test]
    fn repeated_vote_leaves_pending_story_untouched() {
        let mut state = session();
        let mut story = Story::new("st-1", "Imported");
        story.votes.push(Vote {
            participant_id: "alice".into(),
            value: "3".into(),
        });
        state.add_story(story);
        let before = state.clone();

        let vote = Vote {
            participant_id: "alice".into(),
            value: "3".into(),
        };
        assert_eq!(state.record_vote("st-1", vote), VoteOutcome::Unchanged);
        assert_eq!(state, before);
        assert_eq!(state.story("st-1").unwrap().status, StoryStatus::Pending);
    }

    #[test]
    fn velocity_counts_completed_stories_only() {
        let mut state = session();
        for (id, estimate) in [("a", Some("5")), ("b", Some("½")), ("c", None)] {
            state.add_story(Story::new(id, id));
            if let Some(estimate) = estimate {
                assert!(state.set_estimate(id, estimate));
            }
        }
        assert!(!state.set_estimate("a", "5"));
        assert_eq!(state.velocity(), 5.5);
        assert_eq!(state.average_points(), 2.75);
        assert_eq!(state.estimate_distribution().get("5"), Some(&1));
    }

    #[test]
    fn tshirt_sizes_map_to_points() {
        assert_eq!(estimate_points("tshirt", "XL"), 8.0);
        assert_eq!(estimate_points("tshirt", "huge"), 0.0);
        assert_eq!(estimate_points("fibonacci", "13"), 13.0);
        assert_eq!(estimate_points("fibonacci", "?"), 0.0);
    }

    #[test]
    fn browser_shaped_json_deserializes_with_defaults() {
        let state: SessionState = serde_json::from_value(json!({
            "id": "S1",
            "name": "Sprint",
            "creator": "Alice",
            "participants": [{"id": "alice", "name": "Alice"}],
            "created": "2024-05-01T10:00:00.000Z"
        }))
        .unwrap();
        assert_eq!(state.voting_system, DEFAULT_VOTING_SYSTEM);
        assert!(state.stories.is_empty());
        assert_eq!(state.participants[0].joined_at, None);

        let story: Story = serde_json::from_value(json!({
            "id": "st", "title": "T", "finalEstimate": "8", "status": "completed"
        }))
        .unwrap();
        assert_eq!(story.status, StoryStatus::Completed);
        assert_eq!(story.final_estimate.as_deref(), Some("8"));
    }
}
