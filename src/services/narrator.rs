//! Read-aloud control. At most one chapter is narrated at a time; starting a
//! new one stops the current one, and asking again for the chapter that is
//! being prepared or played stops it.

use crate::core::error::StoryResult;
use crate::services::gateway::{GenerationGateway, SpeechAudio};
use crate::utils::audio::{duration_of, write_wav};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarrationState {
    Idle,
    Generating(String),
    Playing(String),
}

/// Destination for synthesized speech. `play` resolves when playback ends;
/// dropping the future stops playback.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, clip_id: &str, audio: SpeechAudio) -> Result<()>;
}

/// Writes each clip to `<folder>/<clip id>.wav` and stays active for the
/// clip's duration.
pub struct WavFileSink {
    folder: PathBuf,
}

impl WavFileSink {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }
}

#[async_trait]
impl AudioSink for WavFileSink {
    async fn play(&self, clip_id: &str, audio: SpeechAudio) -> Result<()> {
        let path = self.folder.join(format!("{}.wav", clip_id));
        write_wav(&path, &audio).await?;
        println!("Narration saved to {}", path.display());
        tokio::time::sleep(duration_of(&audio)).await;
        Ok(())
    }
}

/// The clip currently being synthesized or played. `token` tells a
/// finished synthesis whether it is still the one the reader asked for.
struct ActiveClip {
    chapter_id: String,
    token: u64,
    handle: AbortHandle,
}

pub struct Narrator {
    gateway: Arc<dyn GenerationGateway>,
    sink: Arc<dyn AudioSink>,
    state: Arc<Mutex<NarrationState>>,
    active: Mutex<Option<ActiveClip>>,
    next_token: AtomicU64,
}

fn set_state(state: &Mutex<NarrationState>, next: NarrationState) {
    *state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
}

impl Narrator {
    pub fn new(gateway: Arc<dyn GenerationGateway>, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            gateway,
            sink,
            state: Arc::new(Mutex::new(NarrationState::Idle)),
            active: Mutex::new(None),
            next_token: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> NarrationState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveClip>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts narrating `text` as `chapter_id`, or stops it if that chapter
    /// is already being prepared or played. Returns the resulting state.
    ///
    /// Synthesis runs in its own task, so `stop` or another `toggle` cancels
    /// it without waiting for the backend.
    pub async fn toggle(&self, chapter_id: &str, text: &str) -> StoryResult<NarrationState> {
        let (token, synthesis) = {
            let mut active = self.active();
            let current = self.state();
            let same_chapter = current == NarrationState::Playing(chapter_id.to_string())
                || current == NarrationState::Generating(chapter_id.to_string());
            if let Some(clip) = active.take() {
                debug!("Stopping narration of {}", clip.chapter_id);
                clip.handle.abort();
            }
            if same_chapter {
                set_state(&self.state, NarrationState::Idle);
                return Ok(NarrationState::Idle);
            }

            set_state(&self.state, NarrationState::Generating(chapter_id.to_string()));
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            let gateway = self.gateway.clone();
            let text = text.to_string();
            let synthesis = tokio::spawn(async move { gateway.synthesize_speech(&text).await });
            *active = Some(ActiveClip {
                chapter_id: chapter_id.to_string(),
                token,
                handle: synthesis.abort_handle(),
            });
            (token, synthesis)
        };

        let audio = match synthesis.await {
            Ok(Ok(audio)) => audio,
            Ok(Err(e)) => {
                warn!("Narration of {} failed: {}", chapter_id, e);
                let mut active = self.active();
                if active.as_ref().is_some_and(|clip| clip.token == token) {
                    *active = None;
                    set_state(&self.state, NarrationState::Idle);
                }
                return Err(e);
            }
            Err(_) => {
                debug!("Narration of {} was cancelled", chapter_id);
                return Ok(self.state());
            }
        };

        let mut active = self.active();
        if !active.as_ref().is_some_and(|clip| clip.token == token) {
            debug!("Discarding superseded narration of {}", chapter_id);
            return Ok(self.state());
        }
        set_state(&self.state, NarrationState::Playing(chapter_id.to_string()));
        let sink = self.sink.clone();
        let state = self.state.clone();
        let id = chapter_id.to_string();
        let playback = tokio::spawn(async move {
            if let Err(e) = sink.play(&id, audio).await {
                warn!("Playback of {} failed: {}", id, e);
            }
            let mut current = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *current == NarrationState::Playing(id.clone()) {
                *current = NarrationState::Idle;
            }
        });
        info!("Narrating {}", chapter_id);
        *active = Some(ActiveClip {
            chapter_id: chapter_id.to_string(),
            token,
            handle: playback.abort_handle(),
        });
        Ok(NarrationState::Playing(chapter_id.to_string()))
    }

    pub async fn stop(&self) {
        if let Some(clip) = self.active().take() {
            clip.handle.abort();
        }
        set_state(&self.state, NarrationState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::StoryError;
    use crate::core::model::{AdvancedOptions, ChapterContent};
    use crate::services::gateway::CharacterPortrait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SpeechOnly;

    /// Text the mock backend never finishes synthesizing.
    const STALLED: &str = "stalled";

    #[async_trait]
    impl GenerationGateway for SpeechOnly {
        async fn generate_opening(
            &self,
            _concept: &str,
            _options: &AdvancedOptions,
        ) -> StoryResult<ChapterContent> {
            Err(StoryError::Generation("unused".into()))
        }

        async fn generate_continuation(
            &self,
            _story: &str,
            _choice: &str,
            _options: &AdvancedOptions,
        ) -> StoryResult<ChapterContent> {
            Err(StoryError::Generation("unused".into()))
        }

        async fn generate_theme_note(&self, _theme: &str, _story: &str) -> StoryResult<String> {
            Err(StoryError::Generation("unused".into()))
        }

        async fn generate_character_profile(
            &self,
            _name: &str,
            _story: &str,
            _concept: &str,
        ) -> StoryResult<CharacterPortrait> {
            Err(StoryError::Generation("unused".into()))
        }

        async fn synthesize_speech(&self, text: &str) -> StoryResult<SpeechAudio> {
            if text == STALLED {
                std::future::pending::<()>().await;
            }
            if text.is_empty() {
                return Err(StoryError::ContentBlocked("narration audio".into()));
            }
            Ok(SpeechAudio {
                pcm: text.as_bytes().to_vec(),
                sample_rate: 24_000,
                channels: 1,
            })
        }
    }

    /// Plays until aborted.
    #[derive(Default)]
    struct EndlessSink {
        finished: AtomicUsize,
    }

    #[async_trait]
    impl AudioSink for EndlessSink {
        async fn play(&self, _clip_id: &str, _audio: SpeechAudio) -> Result<()> {
            std::future::pending::<()>().await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_toggle_same_chapter_stops() {
        let sink = Arc::new(EndlessSink::default());
        let narrator = Narrator::new(Arc::new(SpeechOnly), sink.clone());

        let state = narrator.toggle("1-0", "Once upon a time").await.unwrap();
        assert_eq!(state, NarrationState::Playing("1-0".into()));

        let state = narrator.toggle("1-0", "Once upon a time").await.unwrap();
        assert_eq!(state, NarrationState::Idle);
        assert_eq!(narrator.state(), NarrationState::Idle);
        assert_eq!(sink.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_new_chapter_replaces_current() {
        let sink = Arc::new(EndlessSink::default());
        let narrator = Narrator::new(Arc::new(SpeechOnly), sink.clone());

        narrator.toggle("1-0", "First").await.unwrap();
        let state = narrator.toggle("1-1", "Second").await.unwrap();
        assert_eq!(state, NarrationState::Playing("1-1".into()));

        narrator.stop().await;
        assert_eq!(narrator.state(), NarrationState::Idle);
    }

    async fn wait_until_generating(narrator: &Narrator) {
        while narrator.state() == NarrationState::Idle {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_synthesis() {
        let narrator = Arc::new(Narrator::new(
            Arc::new(SpeechOnly),
            Arc::new(EndlessSink::default()),
        ));
        let background = narrator.clone();
        let toggled = tokio::spawn(async move { background.toggle("1-0", STALLED).await });
        wait_until_generating(&narrator).await;
        assert_eq!(narrator.state(), NarrationState::Generating("1-0".into()));

        tokio::time::timeout(std::time::Duration::from_secs(1), narrator.stop())
            .await
            .expect("stop must not wait for synthesis");
        assert_eq!(narrator.state(), NarrationState::Idle);
        assert_eq!(toggled.await.unwrap(), Ok(NarrationState::Idle));
    }

    #[tokio::test]
    async fn test_new_chapter_supersedes_pending_synthesis() {
        let narrator = Arc::new(Narrator::new(
            Arc::new(SpeechOnly),
            Arc::new(EndlessSink::default()),
        ));
        let background = narrator.clone();
        let first = tokio::spawn(async move { background.toggle("1-0", STALLED).await });
        wait_until_generating(&narrator).await;

        let state = narrator.toggle("1-1", "Second").await.unwrap();
        assert_eq!(state, NarrationState::Playing("1-1".into()));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(narrator.state(), NarrationState::Playing("1-1".into()));

        narrator.stop().await;
    }

    #[tokio::test]
    async fn test_failed_synthesis_returns_to_idle() {
        let narrator = Narrator::new(Arc::new(SpeechOnly), Arc::new(EndlessSink::default()));
        let err = narrator.toggle("1-0", "").await.unwrap_err();
        assert!(matches!(err, StoryError::ContentBlocked(_)));
        assert_eq!(narrator.state(), NarrationState::Idle);
    }

    #[tokio::test]
    async fn test_finished_clip_returns_to_idle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let narrator = Narrator::new(Arc::new(SpeechOnly), Arc::new(WavFileSink::new(dir.path())));

        narrator.toggle("7-0", "Hi").await.unwrap();
        for _ in 0..100 {
            if narrator.state() == NarrationState::Idle {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(narrator.state(), NarrationState::Idle);
        assert!(dir.path().join("7-0.wav").exists());
        Ok(())
    }
}
