use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three acts the narrative arc is partitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Act {
    Beginning,
    Middle,
    End,
}

impl Act {
    pub const ALL: [Act; 3] = [Act::Beginning, Act::Middle, Act::End];

    pub fn as_str(&self) -> &'static str {
        match self {
            Act::Beginning => "Beginning",
            Act::Middle => "Middle",
            Act::End => "End",
        }
    }

    /// Stages belonging to this act, in arc order.
    pub fn stages(&self) -> impl Iterator<Item = NarrativeStage> + '_ {
        NarrativeStage::ALL
            .iter()
            .copied()
            .filter(move |s| s.act() == *self)
    }
}

impl fmt::Display for Act {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named position in the fixed story-arc taxonomy.
///
/// Declaration order is arc order, so the derived `Ord` compares stages by
/// their position in the story. Serialized as the display name
/// (e.g. `"Inciting Incident"`), which is also what generation backends
/// are asked to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NarrativeStage {
    #[serde(rename = "Introduction")]
    Introduction,
    #[serde(rename = "Inciting Incident")]
    IncitingIncident,
    #[serde(rename = "Goal")]
    Goal,
    #[serde(rename = "Rising Action")]
    RisingAction,
    #[serde(rename = "Character Development")]
    CharacterDevelopment,
    #[serde(rename = "Turning Points")]
    TurningPoints,
    #[serde(rename = "Climax")]
    Climax,
    #[serde(rename = "Falling Action")]
    FallingAction,
    #[serde(rename = "Resolution")]
    Resolution,
    #[serde(rename = "New Equilibrium")]
    NewEquilibrium,
    #[serde(rename = "Payoff")]
    Payoff,
}

impl NarrativeStage {
    pub const ALL: [NarrativeStage; 11] = [
        NarrativeStage::Introduction,
        NarrativeStage::IncitingIncident,
        NarrativeStage::Goal,
        NarrativeStage::RisingAction,
        NarrativeStage::CharacterDevelopment,
        NarrativeStage::TurningPoints,
        NarrativeStage::Climax,
        NarrativeStage::FallingAction,
        NarrativeStage::Resolution,
        NarrativeStage::NewEquilibrium,
        NarrativeStage::Payoff,
    ];

    /// Stage substituted when a generation backend reports a stage name
    /// outside the taxonomy.
    pub const FALLBACK: NarrativeStage = NarrativeStage::RisingAction;

    pub fn as_str(&self) -> &'static str {
        match self {
            NarrativeStage::Introduction => "Introduction",
            NarrativeStage::IncitingIncident => "Inciting Incident",
            NarrativeStage::Goal => "Goal",
            NarrativeStage::RisingAction => "Rising Action",
            NarrativeStage::CharacterDevelopment => "Character Development",
            NarrativeStage::TurningPoints => "Turning Points",
            NarrativeStage::Climax => "Climax",
            NarrativeStage::FallingAction => "Falling Action",
            NarrativeStage::Resolution => "Resolution",
            NarrativeStage::NewEquilibrium => "New Equilibrium",
            NarrativeStage::Payoff => "Payoff",
        }
    }

    pub fn act(&self) -> Act {
        match self {
            NarrativeStage::Introduction
            | NarrativeStage::IncitingIncident
            | NarrativeStage::Goal => Act::Beginning,
            NarrativeStage::RisingAction
            | NarrativeStage::CharacterDevelopment
            | NarrativeStage::TurningPoints
            | NarrativeStage::Climax => Act::Middle,
            NarrativeStage::FallingAction
            | NarrativeStage::Resolution
            | NarrativeStage::NewEquilibrium
            | NarrativeStage::Payoff => Act::End,
        }
    }

    /// Comma separated list of every stage name, for embedding in prompts.
    pub fn catalogue() -> String {
        Self::ALL
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for NarrativeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStage(pub String);

impl fmt::Display for UnknownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown narrative stage: {:?}", self.0)
    }
}

impl std::error::Error for UnknownStage {}

impl FromStr for NarrativeStage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// How a stage relates to the story's current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    Active,
    Future,
}

impl StageStatus {
    /// `current` is `None` before the first chapter exists, in which case
    /// every stage lies in the future.
    pub fn of(stage: NarrativeStage, current: Option<NarrativeStage>) -> Self {
        match current {
            Some(current) if stage < current => StageStatus::Completed,
            Some(current) if stage == current => StageStatus::Active,
            _ => StageStatus::Future,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_matches_catalogue() {
        assert!(NarrativeStage::ALL.windows(2).all(|w| w[0] < w[1]));
        assert!(NarrativeStage::Introduction < NarrativeStage::Payoff);
        assert!(NarrativeStage::Climax > NarrativeStage::TurningPoints);
    }

    #[test]
    fn test_acts_partition_stages() {
        let beginning: Vec<_> = Act::Beginning.stages().collect();
        assert_eq!(
            beginning,
            vec![
                NarrativeStage::Introduction,
                NarrativeStage::IncitingIncident,
                NarrativeStage::Goal
            ]
        );
        assert_eq!(Act::Middle.stages().count(), 4);
        assert_eq!(Act::End.stages().count(), 4);
        let total: usize = Act::ALL.iter().map(|a| a.stages().count()).sum();
        assert_eq!(total, NarrativeStage::ALL.len());
    }

    #[test]
    fn test_parse_and_serde_use_display_names() {
        assert_eq!(
            "Turning Points".parse::<NarrativeStage>(),
            Ok(NarrativeStage::TurningPoints)
        );
        assert!("Nonexistent".parse::<NarrativeStage>().is_err());
        assert!("rising action".parse::<NarrativeStage>().is_err());

        let json = serde_json::to_string(&NarrativeStage::NewEquilibrium).unwrap();
        assert_eq!(json, "\"New Equilibrium\"");
        let back: NarrativeStage = serde_json::from_str("\"Falling Action\"").unwrap();
        assert_eq!(back, NarrativeStage::FallingAction);
    }

    #[test]
    fn test_stage_status() {
        let current = Some(NarrativeStage::Goal);
        assert_eq!(
            StageStatus::of(NarrativeStage::Introduction, current),
            StageStatus::Completed
        );
        assert_eq!(StageStatus::of(NarrativeStage::Goal, current), StageStatus::Active);
        assert_eq!(StageStatus::of(NarrativeStage::Climax, current), StageStatus::Future);
        assert_eq!(
            StageStatus::of(NarrativeStage::Introduction, None),
            StageStatus::Future
        );
    }
}
