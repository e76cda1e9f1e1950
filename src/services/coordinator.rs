//! Session orchestration: the only place the active novel is mutated.
//!
//! Every mutating call takes the busy flag for its whole duration, so at most
//! one generation or persistence round trip is in flight per session. Session
//! state lives behind a plain mutex that is never held across an await; the
//! busy flag is what serialises mutations.

use crate::core::error::{StoryError, StoryResult};
use crate::core::model::{AdvancedOptions, CharacterProfile, Novel, Theme};
use crate::core::policy::{AccessPolicy, PendingChoice};
use crate::core::repository::{now_millis, HeldChoice, NovelRepository, OwnerKey};
use crate::core::stage::NarrativeStage;
use crate::services::gateway::GenerationGateway;
use crate::services::identity::BillingCollaborator;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceOutcome {
    /// A new chapter was appended and awaits the next choice.
    Advanced,
    /// The appended chapter is an ending.
    Concluded,
    /// The trial is used up. The choice is held until the reader subscribes.
    NeedsUpgrade,
}

/// Read-only copy of the session, for rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub novel: Option<Novel>,
    pub user_id: Option<String>,
    pub is_subscribed: bool,
    pub pending_choice: Option<String>,
    pub has_unsaved_changes: bool,
}

#[derive(Default)]
struct SessionState {
    novel: Option<Novel>,
    user_id: Option<String>,
    subscribed: bool,
    pending: PendingChoice,
    unsaved: bool,
}

impl SessionState {
    fn owner(&self) -> OwnerKey {
        OwnerKey::from_user(self.user_id.as_deref())
    }

    fn novel_mut(&mut self, id: &str) -> StoryResult<&mut Novel> {
        self.novel
            .as_mut()
            .filter(|n| n.id == id)
            .ok_or(StoryError::NoActiveNovel)
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SessionCoordinator {
    gateway: Arc<dyn GenerationGateway>,
    repository: Arc<dyn NovelRepository>,
    billing: Arc<dyn BillingCollaborator>,
    policy: AccessPolicy,
    state: Mutex<SessionState>,
    busy: AtomicBool,
}

impl SessionCoordinator {
    pub fn new(
        gateway: Arc<dyn GenerationGateway>,
        repository: Arc<dyn NovelRepository>,
        billing: Arc<dyn BillingCollaborator>,
        policy: AccessPolicy,
    ) -> Self {
        Self {
            gateway,
            repository,
            billing,
            policy,
            state: Mutex::new(SessionState::default()),
            busy: AtomicBool::new(false),
        }
    }

    fn begin(&self) -> StoryResult<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| StoryError::Busy)?;
        Ok(BusyGuard(&self.busy))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.with_state(|s| SessionSnapshot {
            novel: s.novel.clone(),
            user_id: s.user_id.clone(),
            is_subscribed: s.subscribed,
            pending_choice: s.pending.peek().map(str::to_string),
            has_unsaved_changes: s.unsaved,
        })
    }

    pub fn export_text(&self) -> StoryResult<String> {
        self.with_state(|s| {
            s.novel
                .as_ref()
                .map(Novel::to_full_text)
                .ok_or(StoryError::NoActiveNovel)
        })
    }

    /// Saves `novel` for `owner`. On failure the in-memory novel stays as it
    /// is and the session is flagged unsaved until `retry_save` succeeds.
    async fn commit(&self, owner: &OwnerKey, novel: &Novel) -> StoryResult<()> {
        let result: StoryResult<()> = async {
            self.repository.save(owner, novel).await?;
            if *owner == OwnerKey::Local {
                self.repository.set_local_active(Some(&novel.id)).await?;
            }
            Ok(())
        }
        .await;
        self.with_state(|s| s.unsaved = result.is_err());
        match &result {
            Ok(()) => debug!("Committed novel {} ({} chapters)", novel.id, novel.chapters.len()),
            Err(e) => error!("Failed to persist novel {}: {}", novel.id, e),
        }
        result
    }

    /// Clears the held choice stored on this device. A failure is logged and
    /// otherwise ignored.
    async fn release_held_choice(&self) {
        if let Err(e) = self.repository.set_held_choice(None).await {
            warn!("Could not clear the held choice: {}", e);
        }
    }

    /// Reinstates a held choice stored by an earlier session, if it belongs
    /// to the active novel.
    async fn restore_held_choice(&self) {
        let held = match self.repository.load_held_choice().await {
            Ok(Some(held)) => held,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not read the held choice: {}", e);
                return;
            }
        };
        self.with_state(|s| {
            let matches = s.novel.as_ref().is_some_and(|n| n.id == held.novel_id);
            if matches && s.pending.peek().is_none() {
                info!("Restored held choice {:?} for novel {}", held.choice, held.novel_id);
                s.pending.store(held.choice);
            }
        });
    }

    /// Generates the opening chapter for `concept` and makes the new novel
    /// active.
    pub async fn start_novel(&self, concept: &str, options: AdvancedOptions) -> StoryResult<()> {
        let _guard = self.begin()?;
        let concept = concept.trim();
        if concept.is_empty() {
            return Err(StoryError::invalid_transition("a novel needs a concept"));
        }

        let opening = self.gateway.generate_opening(concept, &options).await?;
        let novel = Novel::from_opening(now_millis().to_string(), concept, options, opening)?;
        info!("Started novel {}: {}", novel.id, novel.name);

        let (owner, dropped) = self.with_state(|s| {
            s.novel = Some(novel.clone());
            (s.owner(), s.pending.take().is_some())
        });
        if dropped {
            self.release_held_choice().await;
        }
        self.commit(&owner, &novel).await
    }

    pub async fn submit_choice(&self, choice: &str) -> StoryResult<ChoiceOutcome> {
        let _guard = self.begin()?;
        self.advance(choice).await
    }

    /// Records `choice` optimistically, generates the next chapter and either
    /// appends it or retracts the choice.
    async fn advance(&self, choice: &str) -> StoryResult<ChoiceOutcome> {
        let policy = self.policy;
        let prepared = self.with_state(|s| {
            let owner = s.owner();
            let subscribed = s.subscribed;
            let novel = s.novel.as_mut().ok_or(StoryError::NoActiveNovel)?;
            novel.chapters.ensure_awaiting_choice()?;
            if !policy.can_proceed(novel.chapters.len(), subscribed) {
                let held = HeldChoice {
                    novel_id: novel.id.clone(),
                    choice: choice.to_string(),
                };
                s.pending.store(choice);
                return Ok(Err(held));
            }
            novel.chapters.record_choice(choice)?;
            Ok::<_, StoryError>(Ok((
                owner,
                novel.id.clone(),
                novel.chapters.story_so_far(),
                novel.advanced_options.clone(),
            )))
        })?;
        let (owner, novel_id, story, options) = match prepared {
            Ok(prepared) => prepared,
            Err(held) => {
                info!("Trial limit reached, holding choice until subscription");
                if let Err(e) = self.repository.set_held_choice(Some(&held)).await {
                    warn!("Could not store the held choice: {}", e);
                }
                return Ok(ChoiceOutcome::NeedsUpgrade);
            }
        };

        let generated = self
            .gateway
            .generate_continuation(&story, choice, &options)
            .await;

        let novel = self.with_state(|s| {
            let novel = s.novel_mut(&novel_id)?;
            match generated.and_then(|content| novel.append_content(content)) {
                Ok(()) => Ok(novel.clone()),
                Err(e) => {
                    if let Err(retract) = novel.chapters.retract_choice() {
                        error!("Could not retract choice on novel {}: {}", novel_id, retract);
                    }
                    warn!("Rolled back choice {:?}: {}", choice, e);
                    Err(e)
                }
            }
        })?;

        self.commit(&owner, &novel).await?;
        if novel.chapters.is_concluded() {
            info!("Novel {} reached an ending", novel.id);
            Ok(ChoiceOutcome::Concluded)
        } else {
            Ok(ChoiceOutcome::Advanced)
        }
    }

    /// Rewinds the active novel to `chapter_index`.
    pub async fn revert_to(&self, chapter_index: usize) -> StoryResult<()> {
        let _guard = self.begin()?;
        let (owner, novel, dropped) = self.with_state(|s| {
            let owner = s.owner();
            let novel = s.novel.as_mut().ok_or(StoryError::NoActiveNovel)?;
            let discarded = novel.chapters.revert_to(chapter_index)?;
            info!(
                "Reverted novel {} to chapter {} ({} discarded)",
                novel.id,
                chapter_index,
                discarded.len()
            );
            let novel = novel.clone();
            let dropped = s.pending.take().is_some();
            Ok::<_, StoryError>((owner, novel, dropped))
        })?;
        if dropped {
            self.release_held_choice().await;
        }
        self.commit(&owner, &novel).await
    }

    /// Rewinds to the first chapter that reached `stage`. Only stages behind
    /// the current one qualify.
    pub async fn revert_to_stage(&self, stage: NarrativeStage) -> StoryResult<()> {
        let index = self.with_state(|s| {
            let novel = s.novel.as_ref().ok_or(StoryError::NoActiveNovel)?;
            novel
                .chapters
                .revert_targets()
                .into_iter()
                .find(|target| target.stage == stage)
                .map(|target| target.chapter_index)
                .ok_or_else(|| {
                    StoryError::invalid_transition(format!("{} is not a revert target", stage))
                })
        })?;
        self.revert_to(index).await
    }

    /// Writes an analysis of `theme`. Returns `false` if the theme was
    /// already explored.
    pub async fn explore_theme(&self, theme: &str) -> StoryResult<bool> {
        let _guard = self.begin()?;
        let prepared = self.with_state(|s| {
            let novel = s.novel.as_ref().ok_or(StoryError::NoActiveNovel)?;
            if novel.has_theme(theme) {
                return Ok(None);
            }
            Ok::<_, StoryError>(Some((s.owner(), novel.id.clone(), novel.chapters.story_so_far())))
        })?;
        let Some((owner, novel_id, story)) = prepared else {
            return Ok(false);
        };

        let description = self.gateway.generate_theme_note(theme, &story).await?;
        let novel = self.with_state(|s| {
            let novel = s.novel_mut(&novel_id)?;
            novel.add_theme(Theme {
                name: theme.to_string(),
                description,
            });
            Ok::<_, StoryError>(novel.clone())
        })?;
        info!("Explored theme {} in novel {}", theme, novel_id);
        self.commit(&owner, &novel).await?;
        Ok(true)
    }

    /// Generates a profile and portrait for `name`. Returns `false` if the
    /// character already has one.
    pub async fn generate_profile(&self, name: &str) -> StoryResult<bool> {
        let _guard = self.begin()?;
        let prepared = self.with_state(|s| {
            let novel = s.novel.as_ref().ok_or(StoryError::NoActiveNovel)?;
            if novel.has_character_profile(name) {
                return Ok(None);
            }
            Ok::<_, StoryError>(Some((
                s.owner(),
                novel.id.clone(),
                novel.chapters.story_so_far(),
                novel.concept.clone(),
            )))
        })?;
        let Some((owner, novel_id, story, concept)) = prepared else {
            return Ok(false);
        };

        let portrait = self
            .gateway
            .generate_character_profile(name, &story, &concept)
            .await?;
        let novel = self.with_state(|s| {
            let novel = s.novel_mut(&novel_id)?;
            novel.add_character_profile(CharacterProfile {
                name: name.to_string(),
                description: portrait.description,
                image_url: portrait.image_url,
            });
            Ok::<_, StoryError>(novel.clone())
        })?;
        info!("Generated profile of {} in novel {}", name, novel_id);
        self.commit(&owner, &novel).await?;
        Ok(true)
    }

    /// Saved novels of the current reader, most recently saved first.
    pub async fn list_novels(&self) -> StoryResult<Vec<Novel>> {
        let owner = self.with_state(|s| s.owner());
        self.repository.list_all(&owner).await
    }

    pub async fn load_novel(&self, novel_id: &str) -> StoryResult<()> {
        let _guard = self.begin()?;
        let owner = self.with_state(|s| s.owner());
        let novel = self
            .repository
            .list_all(&owner)
            .await?
            .into_iter()
            .find(|n| n.id == novel_id)
            .ok_or_else(|| StoryError::NotFound(novel_id.to_string()))?;
        if owner == OwnerKey::Local {
            self.repository.set_local_active(Some(novel_id)).await?;
        }
        info!("Loaded novel {} ({} chapters)", novel.id, novel.chapters.len());
        let dropped = self.with_state(|s| {
            s.novel = Some(novel);
            s.unsaved = false;
            s.pending.take().is_some()
        });
        if dropped {
            self.release_held_choice().await;
        }
        Ok(())
    }

    pub async fn delete_novel(&self, novel_id: &str) -> StoryResult<()> {
        let _guard = self.begin()?;
        let owner = self.with_state(|s| s.owner());
        self.repository.delete_one(&owner, novel_id).await?;
        let dropped = self.with_state(|s| {
            if s.novel.as_ref().is_some_and(|n| n.id == novel_id) {
                s.novel = None;
                s.unsaved = false;
                s.pending.take().is_some()
            } else {
                false
            }
        });
        if dropped {
            self.release_held_choice().await;
        }
        Ok(())
    }

    /// Drops the active novel so a new concept can be entered.
    pub async fn start_new(&self) -> StoryResult<()> {
        let _guard = self.begin()?;
        let (owner, dropped) = self.with_state(|s| {
            s.novel = None;
            s.unsaved = false;
            (s.owner(), s.pending.take().is_some())
        });
        if dropped {
            self.release_held_choice().await;
        }
        if owner == OwnerKey::Local {
            self.repository.set_local_active(None).await?;
        }
        Ok(())
    }

    /// Re-derives subscription and the active novel for a new identity.
    ///
    /// Signing in moves the local active novel into the account and opens
    /// the account's most recent novel. Signing out reopens the local active
    /// novel, if one is left.
    pub async fn handle_identity_change(&self, user_id: Option<String>) -> StoryResult<()> {
        let _guard = self.begin()?;
        match user_id {
            Some(user_id) => {
                let subscribed = self
                    .billing
                    .is_subscribed(&user_id)
                    .await
                    .map_err(StoryError::account)?;
                let account = OwnerKey::Account(user_id.clone());

                if let Some(local) = self.repository.load_local_active().await? {
                    info!("Moving local novel {} into account {}", local.id, user_id);
                    self.repository.save(&account, &local).await?;
                    self.repository.set_local_active(None).await?;
                }

                let active = self.repository.list_all(&account).await?.into_iter().next();
                info!(
                    "Signed in as {} (subscribed: {}, active novel: {:?})",
                    user_id,
                    subscribed,
                    active.as_ref().map(|n| n.id.as_str())
                );
                self.with_state(|s| {
                    s.user_id = Some(user_id);
                    s.subscribed = subscribed;
                    s.novel = active;
                    s.unsaved = false;
                });
            }
            None => {
                let active = self.repository.load_local_active().await?;
                info!("Anonymous session (active novel: {:?})", active.as_ref().map(|n| n.id.as_str()));
                self.with_state(|s| {
                    s.user_id = None;
                    s.subscribed = false;
                    s.novel = active;
                    s.unsaved = false;
                });
            }
        }
        self.restore_held_choice().await;
        Ok(())
    }

    /// Starts a checkout for the signed-in reader and returns its URL.
    pub async fn request_upgrade(&self) -> StoryResult<String> {
        let user_id = self
            .with_state(|s| s.user_id.clone())
            .ok_or(StoryError::SignInRequired)?;
        self.billing
            .start_checkout(&user_id)
            .await
            .map_err(StoryError::account)
    }

    /// Re-checks the subscription. Once it is active the held choice, if any,
    /// is submitted; it is discarded whatever the outcome.
    pub async fn confirm_subscription(&self) -> StoryResult<Option<ChoiceOutcome>> {
        let _guard = self.begin()?;
        let user_id = self
            .with_state(|s| s.user_id.clone())
            .ok_or(StoryError::SignInRequired)?;
        let subscribed = self
            .billing
            .is_subscribed(&user_id)
            .await
            .map_err(StoryError::account)?;
        let pending = self.with_state(|s| {
            s.subscribed = subscribed;
            if subscribed {
                s.pending.take()
            } else {
                None
            }
        });
        if !subscribed {
            return Ok(None);
        }
        match pending {
            Some(choice) => {
                info!("Subscription confirmed, replaying choice {:?}", choice);
                self.release_held_choice().await;
                self.advance(&choice).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Re-attempts saving the active novel after a persistence failure.
    pub async fn retry_save(&self) -> StoryResult<()> {
        let _guard = self.begin()?;
        let (owner, novel) = self.with_state(|s| {
            s.novel
                .clone()
                .map(|n| (s.owner(), n))
                .ok_or(StoryError::NoActiveNovel)
        })?;
        self.commit(&owner, &novel).await
    }
}
