//! The ordered chapter sequence of a novel and the state machine governing it.
//!
//! A timeline moves between four states:
//!
//! - `Empty`: no chapters yet.
//! - `AwaitingChoice`: the last chapter offers choices and none was recorded.
//! - `ChoiceRecorded`: a choice was recorded on the last chapter and the
//!   next chapter has not been appended yet (a generation is in flight).
//! - `Concluded`: the last chapter is an ending.
//!
//! Only the last chapter may be unresolved or an ending. Every other chapter
//! carries the choice that led past it. `revert_to` is the only destructive
//! operation and is the only way out of `Concluded`.

use crate::core::error::{StoryError, StoryResult};
use crate::core::model::Chapter;
use crate::core::stage::{NarrativeStage, StageStatus};
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineState {
    Empty,
    AwaitingChoice,
    ChoiceRecorded,
    Concluded,
}

/// A stage the reader can jump back to, and the chapter that reverting
/// to it lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevertTarget {
    pub stage: NarrativeStage,
    pub chapter_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Chapter>", into = "Vec<Chapter>")]
pub struct StoryTimeline {
    chapters: Vec<Chapter>,
}

impl StoryTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Chapter> {
        self.chapters.get(index)
    }

    pub fn last(&self) -> Option<&Chapter> {
        self.chapters.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Chapter> {
        self.chapters.iter()
    }

    pub fn state(&self) -> TimelineState {
        match self.chapters.last() {
            None => TimelineState::Empty,
            Some(last) if last.is_ending => TimelineState::Concluded,
            Some(last) if last.choice_made.is_some() => TimelineState::ChoiceRecorded,
            Some(_) => TimelineState::AwaitingChoice,
        }
    }

    pub fn is_concluded(&self) -> bool {
        self.state() == TimelineState::Concluded
    }

    /// Appends a freshly generated chapter.
    ///
    /// Requires an empty timeline or a last chapter with a recorded choice.
    pub fn append(&mut self, chapter: Chapter) -> StoryResult<()> {
        match self.state() {
            TimelineState::Empty | TimelineState::ChoiceRecorded => {}
            TimelineState::AwaitingChoice => {
                return Err(StoryError::invalid_transition(
                    "cannot append before a choice is recorded on the last chapter",
                ))
            }
            TimelineState::Concluded => {
                return Err(StoryError::invalid_transition(
                    "cannot append after an ending; revert first",
                ))
            }
        }

        if chapter.choice_made.is_some() {
            return Err(StoryError::invalid_transition(
                "appended chapter must not carry a choice",
            ));
        }
        if chapter.is_ending && !chapter.choices.is_empty() {
            return Err(StoryError::invalid_transition(
                "an ending chapter cannot offer choices",
            ));
        }
        if self.chapters.iter().any(|c| c.id == chapter.id) {
            return Err(StoryError::invalid_transition(format!(
                "chapter id {} already on the timeline",
                chapter.id
            )));
        }

        debug!(
            "Appending chapter {} at stage {} (ending: {})",
            chapter.id, chapter.narrative_stage, chapter.is_ending
        );
        self.chapters.push(chapter);
        Ok(())
    }

    /// Records the reader's decision on the last chapter.
    pub fn record_choice(&mut self, choice: impl Into<String>) -> StoryResult<()> {
        self.ensure_awaiting_choice()?;
        if let Some(last) = self.chapters.last_mut() {
            last.choice_made = Some(choice.into());
        }
        Ok(())
    }

    /// Fails with the error `record_choice` would return if a choice cannot
    /// be recorded now.
    pub fn ensure_awaiting_choice(&self) -> StoryResult<()> {
        match self.state() {
            TimelineState::AwaitingChoice => {}
            TimelineState::Empty => {
                return Err(StoryError::invalid_transition(
                    "no chapter to record a choice on",
                ))
            }
            TimelineState::ChoiceRecorded => {
                return Err(StoryError::invalid_transition(
                    "a choice is already recorded on the last chapter",
                ))
            }
            TimelineState::Concluded => {
                return Err(StoryError::invalid_transition(
                    "no choice can be made after an ending",
                ))
            }
        }
        Ok(())
    }

    /// Undoes `record_choice` when the follow-up chapter could not be produced.
    /// Returns the retracted choice.
    pub fn retract_choice(&mut self) -> StoryResult<String> {
        if self.state() != TimelineState::ChoiceRecorded {
            return Err(StoryError::invalid_transition(
                "no recorded choice to retract on the last chapter",
            ));
        }
        self.chapters
            .last_mut()
            .and_then(|last| last.choice_made.take())
            .ok_or_else(|| StoryError::invalid_transition("no recorded choice to retract"))
    }

    /// `None` until the first chapter exists.
    pub fn current_stage(&self) -> Option<NarrativeStage> {
        self.chapters.last().map(|c| c.narrative_stage)
    }

    /// Truncates the timeline to `chapters[..=index]` and reopens the choice
    /// on the new last chapter. Returns the discarded chapters.
    ///
    /// Themes and character profiles elaborated from discarded chapters are
    /// kept on the novel; only the chapter sequence is rewound.
    pub fn revert_to(&mut self, index: usize) -> StoryResult<Vec<Chapter>> {
        let len = self.chapters.len();
        if index >= len {
            return Err(StoryError::IndexOutOfRange { index, len });
        }
        let discarded = self.chapters.split_off(index + 1);
        if let Some(last) = self.chapters.last_mut() {
            last.choice_made = None;
        }
        debug!(
            "Reverted timeline to chapter {} ({} discarded)",
            index,
            discarded.len()
        );
        Ok(discarded)
    }

    /// Earliest chapter index at which `stage` was reached.
    pub fn first_index_of(&self, stage: NarrativeStage) -> Option<usize> {
        self.chapters
            .iter()
            .position(|c| c.narrative_stage == stage)
    }

    pub fn stage_status(&self, stage: NarrativeStage) -> StageStatus {
        StageStatus::of(stage, self.current_stage())
    }

    /// Stages behind the current one that some chapter actually reached.
    pub fn revert_targets(&self) -> Vec<RevertTarget> {
        NarrativeStage::ALL
            .iter()
            .copied()
            .filter(|stage| self.stage_status(*stage) == StageStatus::Completed)
            .filter_map(|stage| {
                self.first_index_of(stage)
                    .map(|chapter_index| RevertTarget { stage, chapter_index })
            })
            .collect()
    }

    /// Chapter texts joined by blank lines, used as generation context.
    pub fn story_so_far(&self) -> String {
        self.chapters
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl TryFrom<Vec<Chapter>> for StoryTimeline {
    type Error = StoryError;

    /// Rebuilds a timeline from a persisted record, rejecting sequences the
    /// state machine could never have produced.
    fn try_from(chapters: Vec<Chapter>) -> Result<Self, Self::Error> {
        let mut timeline = StoryTimeline::new();
        let count = chapters.len();
        for (i, mut chapter) in chapters.into_iter().enumerate() {
            let choice = chapter.choice_made.take();
            timeline.append(chapter)?;
            if let Some(choice) = choice {
                timeline.record_choice(choice)?;
            } else if i + 1 < count {
                return Err(StoryError::invalid_transition(format!(
                    "chapter {} has no recorded choice but is followed by another",
                    i
                )));
            }
        }
        Ok(timeline)
    }
}

impl From<StoryTimeline> for Vec<Chapter> {
    fn from(timeline: StoryTimeline) -> Self {
        timeline.chapters
    }
}

impl<'a> IntoIterator for &'a StoryTimeline {
    type Item = &'a Chapter;
    type IntoIter = std::slice::Iter<'a, Chapter>;

    fn into_iter(self) -> Self::IntoIter {
        self.chapters.iter()
    }
}
