use anyhow::Result;
use pagemaster::core::config::Config;
use pagemaster::core::io::NativeStorage;
use pagemaster::core::policy::AccessPolicy;
use pagemaster::core::repository::StorageNovelRepository;
use pagemaster::services::coordinator::SessionCoordinator;
use pagemaster::services::gateway::{GenerationGateway, LlmGateway};
use pagemaster::services::identity::{ConfigBilling, LocalAuthSession};
use pagemaster::services::llm::create_llm;
use pagemaster::services::narrator::{Narrator, WavFileSink};
use pagemaster::services::setup;
use pagemaster::services::workflow::WorkflowManager;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load Config
    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with an 'llm' section.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    // 2. Ask for anything the config leaves open
    setup::run_setup(&mut config).await?;

    // 3. Generation backend
    let llm = create_llm(&config.llm)?;
    let gateway: Arc<dyn GenerationGateway> = Arc::new(LlmGateway::new(llm));

    // 4. Storage, identity and billing
    let repository = Arc::new(StorageNovelRepository::new(
        config.data_folder.clone(),
        Arc::new(NativeStorage::new()),
    ));
    let billing = Arc::new(ConfigBilling::new(&config.account));
    let auth = Arc::new(LocalAuthSession::new(config.account.user_id.clone()));

    let coordinator = Arc::new(SessionCoordinator::new(
        gateway.clone(),
        repository,
        billing.clone(),
        AccessPolicy::new(config.trial_limit),
    ));
    let audio_folder = Path::new(&config.output_folder).join("audio");
    let narrator = Narrator::new(gateway, Arc::new(WavFileSink::new(audio_folder)));

    // 5. Run
    let mut manager = WorkflowManager::new(config, coordinator, narrator, auth, billing);
    manager.run().await?;

    Ok(())
}
