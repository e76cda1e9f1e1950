use crate::core::error::StoryResult;
use crate::core::stage::NarrativeStage;
use crate::core::timeline::StoryTimeline;
use serde::{Deserialize, Serialize};

/// Validated output of a generation call, before it is given an id and
/// placed on a timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterContent {
    pub text: String,
    pub choices: Vec<String>,
    pub new_themes: Vec<String>,
    pub new_characters: Vec<String>,
    pub is_ending: bool,
    pub narrative_stage: NarrativeStage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub choices: Vec<String>,
    pub choice_made: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_themes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_characters: Vec<String>,
    #[serde(default)]
    pub is_ending: bool,
    pub narrative_stage: NarrativeStage,
}

impl Chapter {
    pub fn from_content(id: String, content: ChapterContent) -> Self {
        Self {
            id,
            text: content.text,
            choices: content.choices,
            choice_made: None,
            new_themes: content.new_themes,
            new_characters: content.new_characters,
            is_ending: content.is_ending,
            narrative_stage: content.narrative_stage,
        }
    }
}

/// Free-text creative constraints supplied when a novel is started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_of_view: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative_voice: Option<String>,
}

impl AdvancedOptions {
    /// Non-blank options as `(label, value)` pairs in a stable order.
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        [
            ("Plot", &self.plot),
            ("Characters", &self.characters),
            ("Setting", &self.setting),
            ("Theme", &self.theme),
            ("Conflict", &self.conflict),
            ("Point Of View", &self.point_of_view),
            ("Dialogue", &self.dialogue),
            ("Narrative Voice", &self.narrative_voice),
        ]
        .into_iter()
        .filter_map(|(label, value)| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(|v| (label, v))
        })
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Theme {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterProfile {
    pub name: String,
    pub description: String,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Novel {
    pub id: String,
    pub name: String,
    pub concept: String,
    pub chapters: StoryTimeline,
    #[serde(default)]
    pub advanced_options: AdvancedOptions,
    #[serde(default)]
    pub themes: Vec<Theme>,
    #[serde(default)]
    pub character_profiles: Vec<CharacterProfile>,
    /// Epoch millis of the last successful save; set by repositories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_saved: Option<u64>,
}

impl Novel {
    pub fn new(id: impl Into<String>, concept: &str, advanced_options: AdvancedOptions) -> Self {
        Self {
            id: id.into(),
            name: concept.to_string(),
            concept: concept.to_string(),
            chapters: StoryTimeline::new(),
            advanced_options,
            themes: Vec::new(),
            character_profiles: Vec::new(),
            last_saved: None,
        }
    }

    /// Builds a novel whose first chapter is `opening`.
    pub fn from_opening(
        id: impl Into<String>,
        concept: &str,
        advanced_options: AdvancedOptions,
        opening: ChapterContent,
    ) -> StoryResult<Self> {
        let mut novel = Self::new(id, concept, advanced_options);
        novel.append_content(opening)?;
        Ok(novel)
    }

    /// Id for the chapter that would be appended next: `<novelId>-<index>`.
    pub fn next_chapter_id(&self) -> String {
        format!("{}-{}", self.id, self.chapters.len())
    }

    pub fn append_content(&mut self, content: ChapterContent) -> StoryResult<()> {
        let chapter = Chapter::from_content(self.next_chapter_id(), content);
        self.chapters.append(chapter)
    }

    pub fn has_theme(&self, name: &str) -> bool {
        self.themes.iter().any(|t| t.name == name)
    }

    pub fn has_character_profile(&self, name: &str) -> bool {
        self.character_profiles.iter().any(|c| c.name == name)
    }

    /// Returns `false` (and leaves the set untouched) if a theme with the
    /// same name already exists.
    pub fn add_theme(&mut self, theme: Theme) -> bool {
        if self.has_theme(&theme.name) {
            return false;
        }
        self.themes.push(theme);
        true
    }

    pub fn add_character_profile(&mut self, profile: CharacterProfile) -> bool {
        if self.has_character_profile(&profile.name) {
            return false;
        }
        self.character_profiles.push(profile);
        true
    }

    /// Theme names introduced by chapters on the current timeline that have
    /// not been elaborated yet, in first-seen order.
    pub fn pending_themes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for chapter in self.chapters.iter() {
            for name in &chapter.new_themes {
                if !self.has_theme(name) && !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn pending_characters(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for chapter in self.chapters.iter() {
            for name in &chapter.new_characters {
                if !self.has_character_profile(name) && !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Human-readable rendering of the whole story for copy/download.
    pub fn to_full_text(&self) -> String {
        let mut story = format!(
            "Title: {}\nConcept: {}\n\n---\n\n",
            self.name, self.concept
        );
        for (index, chapter) in self.chapters.iter().enumerate() {
            story.push_str(&format!("CHAPTER {}\n\n", index + 1));
            story.push_str(&format!("{}\n\n", chapter.text));
            if let Some(choice) = &chapter.choice_made {
                story.push_str(&format!("YOUR CHOICE: {}\n\n---\n\n", choice));
            }
        }
        story
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str, stage: NarrativeStage) -> ChapterContent {
        ChapterContent {
            text: text.to_string(),
            choices: vec!["Left".to_string(), "Right".to_string()],
            new_themes: vec![],
            new_characters: vec![],
            is_ending: false,
            narrative_stage: stage,
        }
    }

    #[test]
    fn test_chapter_ids_encode_index() {
        let mut novel = Novel::from_opening(
            "1700",
            "A lighthouse keeper",
            AdvancedOptions::default(),
            content("It was dark.", NarrativeStage::Introduction),
        )
        .unwrap();
        assert_eq!(novel.chapters.get(0).unwrap().id, "1700-0");

        novel.chapters.record_choice("Left").unwrap();
        novel
            .append_content(content("Then light.", NarrativeStage::Goal))
            .unwrap();
        assert_eq!(novel.chapters.get(1).unwrap().id, "1700-1");
        assert_eq!(novel.name, "A lighthouse keeper");
    }

    #[test]
    fn test_themes_and_profiles_are_keyed_by_name() {
        let mut novel = Novel::new("1", "c", AdvancedOptions::default());
        assert!(novel.add_theme(Theme {
            name: "Loss".into(),
            description: "first".into()
        }));
        assert!(!novel.add_theme(Theme {
            name: "Loss".into(),
            description: "second".into()
        }));
        assert_eq!(novel.themes.len(), 1);
        assert_eq!(novel.themes[0].description, "first");

        let profile = CharacterProfile {
            name: "Mara".into(),
            description: "keeper".into(),
            image_url: "data:image/png;base64,AA==".into(),
        };
        assert!(novel.add_character_profile(profile.clone()));
        assert!(!novel.add_character_profile(profile));
    }

    #[test]
    fn test_pending_elaborations_skip_known_names() {
        let mut opening = content("Once.", NarrativeStage::Introduction);
        opening.new_themes = vec!["Loss".into(), "Hope".into()];
        opening.new_characters = vec!["Mara".into()];
        let mut novel =
            Novel::from_opening("1", "c", AdvancedOptions::default(), opening).unwrap();
        novel.add_theme(Theme {
            name: "Loss".into(),
            description: "d".into(),
        });

        assert_eq!(novel.pending_themes(), vec!["Hope"]);
        assert_eq!(novel.pending_characters(), vec!["Mara"]);
    }

    #[test]
    fn test_full_text_export() {
        let mut novel = Novel::from_opening(
            "1",
            "Castaways",
            AdvancedOptions::default(),
            content("The ship sank.", NarrativeStage::Introduction),
        )
        .unwrap();
        novel.chapters.record_choice("Swim").unwrap();
        novel
            .append_content(content("They reached shore.", NarrativeStage::IncitingIncident))
            .unwrap();

        let text = novel.to_full_text();
        assert_eq!(
            text,
            "Title: Castaways\nConcept: Castaways\n\n---\n\n\
             CHAPTER 1\n\nThe ship sank.\n\nYOUR CHOICE: Swim\n\n---\n\n\
             CHAPTER 2\n\nThey reached shore.\n\n"
        );
    }

    #[test]
    fn test_advanced_option_entries_skip_blank() {
        let options = AdvancedOptions {
            setting: Some("Venice".into()),
            point_of_view: Some("First person".into()),
            dialogue: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(
            options.entries(),
            vec![("Setting", "Venice"), ("Point Of View", "First person")]
        );
        assert!(AdvancedOptions::default().is_empty());
    }

    #[test]
    fn test_novel_serializes_camel_case() {
        let novel = Novel::from_opening(
            "9",
            "c",
            AdvancedOptions {
                narrative_voice: Some("wry".into()),
                ..Default::default()
            },
            content("t", NarrativeStage::Introduction),
        )
        .unwrap();
        let json = serde_json::to_value(&novel).unwrap();
        assert_eq!(json["chapters"][0]["choiceMade"], serde_json::Value::Null);
        assert_eq!(json["chapters"][0]["narrativeStage"], "Introduction");
        assert_eq!(json["advancedOptions"]["narrativeVoice"], "wry");
        assert!(json.get("characterProfiles").is_some());

        let back: Novel = serde_json::from_value(json).unwrap();
        assert_eq!(back, novel);
    }
}
