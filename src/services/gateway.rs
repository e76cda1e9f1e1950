use crate::core::error::{StoryError, StoryResult};
use crate::core::model::{AdvancedOptions, ChapterContent};
use crate::core::stage::NarrativeStage;
use crate::services::llm::LlmClient;
use crate::services::validator::{chapter_schema, validate};
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info};

pub const SPEECH_SAMPLE_RATE: u32 = 24_000;

const STORYTELLER_SYSTEM: &str = "You are an interactive storyteller. \
Respond with ONLY a valid JSON object with the fields text, choices, newThemes, \
newCharacters, isEnding and narrativeStage.";

/// Text description and portrait of a character. `image_url` is a
/// `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterPortrait {
    pub description: String,
    pub image_url: String,
}

/// Raw signed 16-bit little-endian PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechAudio {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Everything the story engine asks of a content backend. Every call is a
/// single attempt; retrying is left to the reader.
#[async_trait]
pub trait GenerationGateway: Send + Sync {
    async fn generate_opening(
        &self,
        concept: &str,
        options: &AdvancedOptions,
    ) -> StoryResult<ChapterContent>;

    async fn generate_continuation(
        &self,
        story_so_far: &str,
        choice: &str,
        options: &AdvancedOptions,
    ) -> StoryResult<ChapterContent>;

    async fn generate_theme_note(&self, theme: &str, story_so_far: &str) -> StoryResult<String>;

    async fn generate_character_profile(
        &self,
        name: &str,
        story_so_far: &str,
        concept: &str,
    ) -> StoryResult<CharacterPortrait>;

    async fn synthesize_speech(&self, text: &str) -> StoryResult<SpeechAudio>;
}

/// Appends the non-blank advanced options to `base` as a constraint list.
pub fn build_prompt_with_options(base: &str, options: &AdvancedOptions) -> String {
    let entries = options.entries();
    if entries.is_empty() {
        return base.to_string();
    }
    let lines: Vec<String> = entries
        .iter()
        .map(|(label, value)| format!("- {}: {}", label, value))
        .collect();
    format!(
        "{}\n\nPlease adhere to these additional creative constraints:\n{}",
        base,
        lines.join("\n")
    )
}

pub struct LlmGateway {
    llm: Box<dyn LlmClient>,
}

impl LlmGateway {
    pub fn new(llm: Box<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn chapter(&self, prompt: &str) -> StoryResult<ChapterContent> {
        let raw = self
            .llm
            .chat_json(STORYTELLER_SYSTEM, prompt, &chapter_schema())
            .await
            .context("Chapter generation request failed")
            .map_err(StoryError::generation)?;
        debug!("Chapter response: {} bytes", raw.len());
        validate(&raw)
    }
}

fn stage_instruction() -> String {
    format!(
        "Determine the narrative stage of the story. Choose exactly one value from this list: [{}].",
        NarrativeStage::catalogue()
    )
}

/// Sample rate advertised in a mime type such as `audio/L16;codec=pcm;rate=24000`.
fn sample_rate_of(mime_type: &str) -> u32 {
    mime_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
        .unwrap_or(SPEECH_SAMPLE_RATE)
}

#[async_trait]
impl GenerationGateway for LlmGateway {
    async fn generate_opening(
        &self,
        concept: &str,
        options: &AdvancedOptions,
    ) -> StoryResult<ChapterContent> {
        let base = format!(
            "The user wants to write a novel with the following concept: \"{}\".",
            concept
        );
        let prompt = format!(
            "{}\n\nWrite a compelling and immersive first chapter (around 250 words). \
             After the chapter, create three distinct and intriguing choices for what happens next; \
             they should lead to significantly different story paths. \
             List significant literary themes introduced in this chapter in `newThemes` \
             and significant new characters in `newCharacters`. \
             {} It should likely be 'Introduction' or 'Inciting Incident'.",
            build_prompt_with_options(&base, options),
            stage_instruction()
        );
        info!("Generating opening chapter");
        self.chapter(&prompt).await
    }

    async fn generate_continuation(
        &self,
        story_so_far: &str,
        choice: &str,
        options: &AdvancedOptions,
    ) -> StoryResult<ChapterContent> {
        let base = format!(
            "You are continuing a novel. Here is the story so far:\n---\n{}\n---\n\
             The user has just made the following choice: \"{}\".",
            story_so_far, choice
        );
        let prompt = format!(
            "{}\n\nBased on this choice, write the next compelling chapter (around 250 words), \
             consistent in tone and style with the established narrative and constraints. \
             Then present three new, distinct choices. \
             If this chapter is a natural and satisfying conclusion, set `isEnding` to true \
             and return an empty `choices` array. \
             List new significant themes in `newThemes` and characters introduced for the first \
             time in `newCharacters`. {}",
            build_prompt_with_options(&base, options),
            stage_instruction()
        );
        info!("Generating continuation for choice: {}", choice);
        self.chapter(&prompt).await
    }

    async fn generate_theme_note(&self, theme: &str, story_so_far: &str) -> StoryResult<String> {
        let prompt = format!(
            "The following is an excerpt from a novel:\n---\n{}\n---\n\
             A key theme identified in the story is \"{}\". Write a brief, insightful analysis \
             (around 100 words) of how this theme is developed in the narrative so far, \
             focusing on its significance, symbolism and impact on the characters and plot.",
            story_so_far, theme
        );
        let note = self
            .llm
            .chat("You are a literary analyst.", &prompt)
            .await
            .with_context(|| format!("Theme analysis for {} failed", theme))
            .map_err(StoryError::generation)?;
        let note = note.trim();
        if note.is_empty() {
            return Err(StoryError::ContentBlocked(format!("analysis of {}", theme)));
        }
        Ok(note.to_string())
    }

    async fn generate_character_profile(
        &self,
        name: &str,
        story_so_far: &str,
        concept: &str,
    ) -> StoryResult<CharacterPortrait> {
        let prompt = format!(
            "The novel's concept is: \"{}\".\nHere is the story so far:\n---\n{}\n---\n\
             Based on this context, create a detailed character profile for \"{}\". \
             Describe their physical appearance, personality, background and potential \
             motivations in one compelling paragraph (around 150 words).",
            concept, story_so_far, name
        );
        let description = self
            .llm
            .chat("You are a character designer for a novel.", &prompt)
            .await
            .with_context(|| format!("Profile text for {} failed", name))
            .map_err(StoryError::generation)?;
        let description = description.trim().to_string();
        if description.is_empty() {
            return Err(StoryError::ContentBlocked(format!("profile of {}", name)));
        }

        let image_prompt = format!(
            "Generate a character portrait based on this description: \"{}\". \
             The overall theme of the story is \"{}\". The portrait should be artistic \
             and evocative of this theme.",
            description, concept
        );
        let image = self
            .llm
            .generate_image(&image_prompt)
            .await
            .with_context(|| format!("Portrait of {} failed", name))
            .map_err(StoryError::generation)?
            .ok_or_else(|| StoryError::ContentBlocked(format!("portrait of {}", name)))?;

        let mime = if image.mime_type.starts_with("image/") {
            image.mime_type.as_str()
        } else {
            "image/png"
        };
        Ok(CharacterPortrait {
            description,
            image_url: format!("data:{};base64,{}", mime, image.data),
        })
    }

    async fn synthesize_speech(&self, text: &str) -> StoryResult<SpeechAudio> {
        let prompt = format!("Say with a calm, clear narrative voice: {}", text);
        let audio = self
            .llm
            .generate_speech(&prompt)
            .await
            .context("Speech synthesis failed")
            .map_err(StoryError::generation)?
            .ok_or_else(|| StoryError::ContentBlocked("narration audio".to_string()))?;
        let pcm = STANDARD
            .decode(audio.data.as_bytes())
            .context("Speech payload is not valid base64")
            .map_err(StoryError::generation)?;
        Ok(SpeechAudio {
            pcm,
            sample_rate: sample_rate_of(&audio.mime_type),
            channels: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::InlineData;
    use anyhow::{anyhow, Result};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct MockLlm {
        responses: Mutex<Vec<Result<String>>>,
        image: Option<InlineData>,
        speech: Option<InlineData>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl MockLlm {
        fn replying(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn chat(&self, _system: &str, user: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(anyhow!("no scripted response"));
            }
            responses.remove(0)
        }

        async fn generate_image(&self, prompt: &str) -> Result<Option<InlineData>> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.image.clone())
        }

        async fn generate_speech(&self, _text: &str) -> Result<Option<InlineData>> {
            Ok(self.speech.clone())
        }
    }

    const OPENING: &str = r#"{"text": "Fog rolled in.", "choices": ["Wait", "Walk"],
        "isEnding": false, "narrativeStage": "Introduction"}"#;

    #[test]
    fn test_prompt_options_block() {
        let options = AdvancedOptions {
            setting: Some("Lisbon, 1755".into()),
            point_of_view: Some("Second person".into()),
            plot: Some(" ".into()),
            ..Default::default()
        };
        assert_eq!(
            build_prompt_with_options("Base.", &options),
            "Base.\n\nPlease adhere to these additional creative constraints:\n\
             - Setting: Lisbon, 1755\n- Point Of View: Second person"
        );
        assert_eq!(
            build_prompt_with_options("Base.", &AdvancedOptions::default()),
            "Base."
        );
    }

    #[tokio::test]
    async fn test_opening_prompt_carries_concept_and_stages() {
        let llm = MockLlm::replying(vec![Ok(OPENING.to_string())]);
        let prompts = llm.prompts.clone();
        let gateway = LlmGateway::new(Box::new(llm));

        let options = AdvancedOptions {
            theme: Some("Grief".into()),
            ..Default::default()
        };
        let content = gateway.generate_opening("A drowned city", &options).await.unwrap();
        assert_eq!(content.narrative_stage, NarrativeStage::Introduction);

        let prompts = prompts.lock().unwrap();
        assert!(prompts[0].contains("\"A drowned city\""));
        assert!(prompts[0].contains("- Theme: Grief"));
        assert!(prompts[0].contains("New Equilibrium"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_generation_error() {
        let gateway = LlmGateway::new(Box::new(MockLlm::replying(vec![Err(anyhow!(
            "connection refused"
        ))])));
        let err = gateway
            .generate_continuation("story", "Walk", &AdvancedOptions::default())
            .await
            .unwrap_err();
        match err {
            StoryError::Generation(msg) => assert!(msg.contains("connection refused")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_payload_is_malformed() {
        let gateway = LlmGateway::new(Box::new(MockLlm::replying(vec![Ok(
            r#"{"text": "x", "choices": [], "narrativeStage": "Goal"}"#.to_string(),
        )])));
        let err = gateway
            .generate_continuation("story", "Walk", &AdvancedOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoryError::MalformedContent(_)));
    }

    #[tokio::test]
    async fn test_character_profile_needs_image() {
        let gateway = LlmGateway::new(Box::new(MockLlm::replying(vec![Ok(
            "A tall ferrywoman.".to_string(),
        )])));
        let err = gateway
            .generate_character_profile("Mara", "story", "concept")
            .await
            .unwrap_err();
        assert!(matches!(err, StoryError::ContentBlocked(_)));

        let mut llm = MockLlm::replying(vec![Ok("A tall ferrywoman.".to_string())]);
        llm.image = Some(InlineData {
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        });
        let prompts = llm.prompts.clone();
        let gateway = LlmGateway::new(Box::new(llm));
        let portrait = gateway
            .generate_character_profile("Mara", "story", "River folk")
            .await
            .unwrap();
        assert_eq!(portrait.description, "A tall ferrywoman.");
        assert_eq!(portrait.image_url, "data:image/png;base64,AAAA");
        assert!(prompts.lock().unwrap()[1].contains("A tall ferrywoman."));
    }

    #[tokio::test]
    async fn test_speech_is_decoded() {
        let mut llm = MockLlm::default();
        llm.speech = Some(InlineData {
            mime_type: "audio/L16;codec=pcm;rate=16000".into(),
            data: STANDARD.encode([1u8, 0, 2, 0]),
        });
        let gateway = LlmGateway::new(Box::new(llm));
        let audio = gateway.synthesize_speech("Hello").await.unwrap();
        assert_eq!(audio.pcm, vec![1, 0, 2, 0]);
        assert_eq!(audio.sample_rate, 16_000);
        assert_eq!(audio.channels, 1);
    }

    #[test]
    fn test_sample_rate_defaults() {
        assert_eq!(sample_rate_of("audio/pcm"), SPEECH_SAMPLE_RATE);
        assert_eq!(sample_rate_of("audio/L16; rate=48000"), 48_000);
    }
}
