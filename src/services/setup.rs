use crate::core::config::Config;
use crate::services::llm::{
    default_gemini_image_model, default_gemini_model, default_gemini_speech_model, GeminiConfig,
    OllamaConfig, GEMINI_VOICES,
};
use anyhow::Result;
use inquire::{Password, Select, Text};

/// Settings the config file leaves open that a first run has to ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingSetting {
    GeminiApiKey,
    NarratorVoice,
    OllamaEndpoint,
}

pub fn missing_settings(config: &Config) -> Vec<MissingSetting> {
    let mut missing = Vec::new();
    match config.llm.provider.as_str() {
        "gemini" => match &config.llm.gemini {
            Some(cfg) => {
                if cfg.api_key.trim().is_empty() {
                    missing.push(MissingSetting::GeminiApiKey);
                }
                if cfg.voice.is_none() {
                    missing.push(MissingSetting::NarratorVoice);
                }
            }
            None => {
                missing.push(MissingSetting::GeminiApiKey);
                missing.push(MissingSetting::NarratorVoice);
            }
        },
        "ollama" => {
            if config.llm.ollama.is_none() {
                missing.push(MissingSetting::OllamaEndpoint);
            }
        }
        _ => {}
    }
    missing
}

pub async fn run_setup(config: &mut Config) -> Result<()> {
    let missing = missing_settings(config);
    if missing.is_empty() {
        return Ok(());
    }

    for setting in missing {
        match setting {
            MissingSetting::GeminiApiKey => {
                let api_key = Password::new("Gemini API key:")
                    .without_confirmation()
                    .prompt()?;
                gemini_mut(config).api_key = api_key.trim().to_string();
            }
            MissingSetting::NarratorVoice => {
                let voice = Select::new("Select Narrator Voice:", GEMINI_VOICES.to_vec()).prompt()?;
                gemini_mut(config).voice = Some(voice.to_string());
            }
            MissingSetting::OllamaEndpoint => {
                let base_url = Text::new("Ollama base URL:")
                    .with_default("http://localhost:11434")
                    .prompt()?;
                let model = Text::new("Ollama model:").with_default("llama3").prompt()?;
                config.llm.ollama = Some(OllamaConfig { base_url, model });
            }
        }
    }

    config.save()?;
    println!("Configuration saved.");
    Ok(())
}

fn gemini_mut(config: &mut Config) -> &mut GeminiConfig {
    config.llm.gemini.get_or_insert_with(|| GeminiConfig {
        api_key: String::new(),
        model: default_gemini_model(),
        image_model: default_gemini_image_model(),
        speech_model: default_gemini_speech_model(),
        voice: None,
    })
}
