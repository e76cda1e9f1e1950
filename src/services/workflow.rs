//! Interactive terminal front end driving a [`SessionCoordinator`].

use crate::core::config::Config;
use crate::core::error::{StoryError, StoryResult};
use crate::core::model::{AdvancedOptions, Chapter, Novel};
use crate::core::stage::{Act, NarrativeStage, StageStatus};
use crate::core::timeline::TimelineState;
use crate::services::coordinator::{ChoiceOutcome, SessionCoordinator, SessionSnapshot};
use crate::services::identity::{AuthSession, ConfigBilling, LocalAuthSession};
use crate::services::narrator::{NarrationState, Narrator};
use anyhow::{Context, Result};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, Select, Text};
use log::{debug, info, warn};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Choose(String),
    Revert(NarrativeStage, usize),
    ExploreTheme(String),
    ProfileCharacter(String),
    ReadAloud,
    ShowNovel,
    Export,
    RetrySave,
    LoadNovel,
    DeleteNovel,
    NewNovel,
    SignIn,
    SignOut,
    Quit,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Choose(choice) => write!(f, "> {}", choice),
            Action::Revert(stage, index) => {
                write!(f, "Return to {} (chapter {})", stage, index + 1)
            }
            Action::ExploreTheme(name) => write!(f, "Explore theme: {}", name),
            Action::ProfileCharacter(name) => write!(f, "Character profile: {}", name),
            Action::ReadAloud => write!(f, "Read the chapter aloud"),
            Action::ShowNovel => write!(f, "Show the whole novel"),
            Action::Export => write!(f, "Export the novel as text"),
            Action::RetrySave => write!(f, "Retry saving"),
            Action::LoadNovel => write!(f, "Load a saved novel"),
            Action::DeleteNovel => write!(f, "Delete a saved novel"),
            Action::NewNovel => write!(f, "Start a new novel"),
            Action::SignIn => write!(f, "Sign in"),
            Action::SignOut => write!(f, "Sign out"),
            Action::Quit => write!(f, "Quit"),
        }
    }
}

/// Menu for the current session, choices first.
fn menu_actions(snapshot: &SessionSnapshot) -> Vec<Action> {
    let mut actions = Vec::new();
    if let Some(novel) = &snapshot.novel {
        if novel.chapters.state() == TimelineState::AwaitingChoice {
            if let Some(last) = novel.chapters.last() {
                actions.extend(last.choices.iter().cloned().map(Action::Choose));
            }
        }
        actions.extend(
            novel
                .chapters
                .revert_targets()
                .into_iter()
                .map(|t| Action::Revert(t.stage, t.chapter_index)),
        );
        actions.extend(
            novel
                .pending_themes()
                .into_iter()
                .map(|name| Action::ExploreTheme(name.to_string())),
        );
        actions.extend(
            novel
                .pending_characters()
                .into_iter()
                .map(|name| Action::ProfileCharacter(name.to_string())),
        );
        actions.push(Action::ReadAloud);
        actions.push(Action::ShowNovel);
        actions.push(Action::Export);
        if snapshot.has_unsaved_changes {
            actions.push(Action::RetrySave);
        }
    }
    actions.push(Action::LoadNovel);
    actions.push(Action::DeleteNovel);
    actions.push(Action::NewNovel);
    if snapshot.user_id.is_some() {
        actions.push(Action::SignOut);
    } else {
        actions.push(Action::SignIn);
    }
    actions.push(Action::Quit);
    actions
}

/// One line per act, marking completed (`x`), active (`>`) and future (` `)
/// stages.
fn render_progress(novel: &Novel) -> String {
    Act::ALL
        .iter()
        .map(|act| {
            let stages: Vec<String> = act
                .stages()
                .map(|stage| {
                    let mark = match novel.chapters.stage_status(stage) {
                        StageStatus::Completed => 'x',
                        StageStatus::Active => '>',
                        StageStatus::Future => ' ',
                    };
                    format!("[{}] {}", mark, stage)
                })
                .collect();
            format!("{:<10} {}", act.as_str(), stages.join("  "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_chapter(index: usize, chapter: &Chapter) -> String {
    let mut out = format!(
        "\n=== Chapter {} ({}) ===\n\n{}\n",
        index + 1,
        chapter.narrative_stage,
        chapter.text
    );
    if chapter.is_ending {
        out.push_str("\n~ The End ~\n");
    }
    out
}

fn novel_label(novel: &Novel) -> String {
    format!("{} [{}] ({} chapters)", novel.name, novel.id, novel.chapters.len())
}

pub struct WorkflowManager {
    config: Config,
    coordinator: Arc<SessionCoordinator>,
    narrator: Narrator,
    auth: Arc<LocalAuthSession>,
    billing: Arc<ConfigBilling>,
    identity_changes: BoxStream<'static, Option<String>>,
}

impl WorkflowManager {
    pub fn new(
        config: Config,
        coordinator: Arc<SessionCoordinator>,
        narrator: Narrator,
        auth: Arc<LocalAuthSession>,
        billing: Arc<ConfigBilling>,
    ) -> Self {
        let identity_changes = auth.subscribe();
        Self {
            config,
            coordinator,
            narrator,
            auth,
            billing,
            identity_changes,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let initial = self.auth.current_user_id();
        if let Err(e) = with_spinner(
            "Loading your library...",
            self.coordinator.handle_identity_change(initial),
        )
        .await
        {
            report(e.into())?;
        }

        let mut shown = None;
        loop {
            let snapshot = self.coordinator.snapshot();
            let Some(novel) = &snapshot.novel else {
                if !self.prompt_new_novel().await? {
                    break;
                }
                continue;
            };

            let position = (novel.id.clone(), novel.chapters.len());
            if shown.as_ref() != Some(&position) {
                println!("\n{}\n", render_progress(novel));
                if let Some(last) = novel.chapters.last() {
                    println!("{}", render_chapter(novel.chapters.len() - 1, last));
                }
                shown = Some(position);
            }

            let action = Select::new("What next?", menu_actions(&snapshot)).prompt()?;
            debug!("Selected action: {:?}", action);
            if action == Action::Quit {
                break;
            }
            if let Err(e) = self.perform(action, &snapshot).await {
                report(e)?;
            }
        }

        self.narrator.stop().await;
        println!("Goodbye!");
        Ok(())
    }

    /// Asks for a concept and starts a novel. Returns `false` if the reader
    /// chose to quit instead.
    async fn prompt_new_novel(&mut self) -> Result<bool> {
        let concept = Text::new("What is your novel about?")
            .with_help_message("Leave empty to open the menu")
            .prompt()?;
        if concept.trim().is_empty() {
            let snapshot = self.coordinator.snapshot();
            let action = Select::new("What next?", menu_actions(&snapshot)).prompt()?;
            if action == Action::Quit {
                return Ok(false);
            }
            if let Err(e) = self.perform(action, &snapshot).await {
                report(e)?;
            }
            return Ok(true);
        }

        let options = if Confirm::new("Add advanced creative options?")
            .with_default(false)
            .prompt()?
        {
            prompt_advanced_options()?
        } else {
            AdvancedOptions::default()
        };

        let result = with_spinner(
            "Writing the first chapter...",
            self.coordinator.start_novel(&concept, options),
        )
        .await;
        if let Err(e) = result {
            report(e.into())?;
        }
        Ok(true)
    }

    async fn perform(&mut self, action: Action, snapshot: &SessionSnapshot) -> Result<()> {
        match action {
            Action::Choose(choice) => {
                let outcome = with_spinner(
                    "Writing the next chapter...",
                    self.coordinator.submit_choice(&choice),
                )
                .await?;
                self.after_choice(outcome).await?;
            }
            Action::Revert(stage, _) => {
                if Confirm::new(&format!(
                    "Return to {}? Later chapters will be discarded.",
                    stage
                ))
                .with_default(false)
                .prompt()?
                {
                    self.coordinator.revert_to_stage(stage).await?;
                }
            }
            Action::ExploreTheme(name) => {
                with_spinner(
                    &format!("Exploring {}...", name),
                    self.coordinator.explore_theme(&name),
                )
                .await?;
                if let Some(theme) = self
                    .coordinator
                    .snapshot()
                    .novel
                    .and_then(|n| n.themes.into_iter().find(|t| t.name == name))
                {
                    println!("\n** {} **\n{}\n", theme.name, theme.description);
                }
            }
            Action::ProfileCharacter(name) => {
                with_spinner(
                    &format!("Imagining {}...", name),
                    self.coordinator.generate_profile(&name),
                )
                .await?;
                if let Some(profile) = self.coordinator.snapshot().novel.and_then(|n| {
                    n.character_profiles.into_iter().find(|c| c.name == name)
                }) {
                    println!("\n** {} **\n{}\n", profile.name, profile.description);
                    println!("(portrait: {} bytes of image data)", profile.image_url.len());
                }
            }
            Action::ReadAloud => {
                if let Some(last) = snapshot.novel.as_ref().and_then(|n| n.chapters.last()) {
                    let state = with_spinner(
                        "Preparing narration...",
                        self.narrator.toggle(&last.id, &last.text),
                    )
                    .await?;
                    if state == NarrationState::Idle {
                        println!("Narration stopped.");
                    }
                }
            }
            Action::ShowNovel => {
                println!("\n{}", self.coordinator.export_text()?);
            }
            Action::Export => {
                let text = self.coordinator.export_text()?;
                if let Some(novel) = &snapshot.novel {
                    let path = Path::new(&self.config.output_folder).join(format!("{}.txt", novel.id));
                    tokio::fs::write(&path, text)
                        .await
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    println!("Saved to {}", path.display());
                }
            }
            Action::RetrySave => {
                with_spinner("Saving...", self.coordinator.retry_save()).await?;
                println!("Saved.");
            }
            Action::LoadNovel => {
                let novels = self.coordinator.list_novels().await?;
                if novels.is_empty() {
                    println!("No saved novels yet.");
                    return Ok(());
                }
                let labels: Vec<String> = novels.iter().map(novel_label).collect();
                let picked = Select::new("Load which novel?", labels.clone()).prompt()?;
                if let Some(index) = labels.iter().position(|l| *l == picked) {
                    self.narrator.stop().await;
                    self.coordinator.load_novel(&novels[index].id).await?;
                }
            }
            Action::DeleteNovel => {
                let novels = self.coordinator.list_novels().await?;
                if novels.is_empty() {
                    println!("No saved novels yet.");
                    return Ok(());
                }
                let labels: Vec<String> = novels.iter().map(novel_label).collect();
                let picked = Select::new("Delete which novel?", labels.clone()).prompt()?;
                if let Some(index) = labels.iter().position(|l| *l == picked) {
                    if Confirm::new("This cannot be undone. Delete?")
                        .with_default(false)
                        .prompt()?
                    {
                        self.coordinator.delete_novel(&novels[index].id).await?;
                    }
                }
            }
            Action::NewNovel => {
                self.narrator.stop().await;
                self.coordinator.start_new().await?;
            }
            Action::SignIn => {
                self.sign_in().await?;
            }
            Action::SignOut => {
                self.switch_identity(None).await?;
            }
            Action::Quit => {}
        }
        Ok(())
    }

    async fn after_choice(&mut self, outcome: ChoiceOutcome) -> Result<()> {
        match outcome {
            ChoiceOutcome::Advanced => {}
            ChoiceOutcome::Concluded => {
                println!("Your story has reached an ending. You can return to an earlier stage to explore another path.");
            }
            ChoiceOutcome::NeedsUpgrade => {
                println!("Your free chapter is used up. Subscribe to keep writing.");
                if !Confirm::new("Subscribe now?").with_default(true).prompt()? {
                    return Ok(());
                }
                if self.coordinator.snapshot().user_id.is_none() {
                    self.sign_in().await?;
                }
                let url = self.coordinator.request_upgrade().await?;
                println!("Complete your checkout at:\n  {}", url);
                if !Confirm::new("Have you completed the checkout?")
                    .with_default(true)
                    .prompt()?
                {
                    return Ok(());
                }
                if let Some(user_id) = self.coordinator.snapshot().user_id {
                    self.billing.mark_subscribed(&user_id)?;
                }
                let replayed = with_spinner(
                    "Confirming your subscription...",
                    self.coordinator.confirm_subscription(),
                )
                .await?;
                match replayed {
                    Some(outcome) => Box::pin(self.after_choice(outcome)).await?,
                    None if self.coordinator.snapshot().is_subscribed => {
                        println!("Subscription active.")
                    }
                    None => println!("The subscription is not active yet."),
                }
            }
        }
        Ok(())
    }

    async fn sign_in(&mut self) -> Result<()> {
        let user_id = Text::new("Account id:").prompt()?;
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Ok(());
        }
        self.switch_identity(Some(user_id.to_string())).await
    }

    /// Signs in as `user_id` (or out, for `None`). If the coordinator cannot
    /// follow, the auth session is put back to the identity it still holds.
    async fn switch_identity(&mut self, user_id: Option<String>) -> Result<()> {
        self.narrator.stop().await;
        let previous = self.coordinator.snapshot().user_id;
        set_identity(&self.auth, user_id);
        if let Err(e) = self.sync_identity().await {
            warn!("Identity change failed, staying as {:?}: {:#}", previous, e);
            set_identity(&self.auth, previous);
            // Swallow the notification for the rollback itself.
            self.identity_changes.next().await;
            return Err(e);
        }
        Ok(())
    }

    /// Applies the next identity change to the coordinator.
    async fn sync_identity(&mut self) -> Result<()> {
        if let Some(user_id) = self.identity_changes.next().await {
            info!("Identity changed: {:?}", user_id);
            with_spinner(
                "Syncing your library...",
                self.coordinator.handle_identity_change(user_id),
            )
            .await?;
        }
        Ok(())
    }
}

fn set_identity(auth: &LocalAuthSession, user_id: Option<String>) {
    match user_id {
        Some(user_id) => auth.sign_in(user_id),
        None => auth.sign_out(),
    }
}

fn prompt_advanced_options() -> Result<AdvancedOptions> {
    let ask = |label: &str| -> Result<Option<String>> {
        let value = Text::new(&format!("{} (optional):", label)).prompt()?;
        let value = value.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    };
    Ok(AdvancedOptions {
        plot: ask("Plot")?,
        characters: ask("Characters")?,
        setting: ask("Setting")?,
        theme: ask("Theme")?,
        conflict: ask("Conflict")?,
        point_of_view: ask("Point of view")?,
        dialogue: ask("Dialogue")?,
        narrative_voice: ask("Narrative voice")?,
    })
}

async fn with_spinner<T>(message: &str, work: impl Future<Output = StoryResult<T>>) -> StoryResult<T> {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    let result = work.await;
    pb.finish_and_clear();
    result
}

/// Prints recoverable errors for the reader. Contract violations and
/// aborted prompts end the session.
fn report(e: anyhow::Error) -> Result<()> {
    match e.downcast_ref::<StoryError>() {
        Some(story) if story.is_recoverable() => {
            eprintln!("{}", story.user_message());
            debug!("{:#}", e);
            Ok(())
        }
        Some(_) => Err(e),
        None if e.is::<inquire::InquireError>() => Err(e),
        None => {
            eprintln!("Error: {:#}", e);
            Ok(())
        }
    }
}
