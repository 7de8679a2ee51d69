use anyhow::{Context, Result};
use colored::Colorize;
use ragdesk_core::config::Config;
use ragdesk_core::{
    AppState, CredentialSource, Dispatcher, EnvCredentials, OpenAiDocumentStore, OpenAiProvider,
    Outcome, StateObserver, StateUpdate,
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// A dispatcher wired to the OpenAI services, plus the observer that mirrors its state.
pub struct Session {
    pub dispatcher: Dispatcher,
    pub observer: StateObserver,
}

impl Session {
    pub fn connect(config: &Config) -> Result<Self> {
        let api_key = EnvCredentials::from_config(&config.credentials)
            .api_key()
            .context("No API key available")?;
        info!(model = %config.llm.model, base_url = %config.llm.base_url, "Connecting");

        let provider = OpenAiProvider::new(&config.llm, &api_key)
            .context("Failed to create the model client")?;
        let store = OpenAiDocumentStore::new(&config.llm, &api_key)
            .context("Failed to create the document store client")?;

        let (dispatcher, observer) = Dispatcher::new(
            config,
            Arc::new(provider),
            Arc::new(store),
            Handle::current(),
        );
        Ok(Self {
            dispatcher,
            observer,
        })
    }

    /// Loads the knowledge cache and then relists every collection from the store.
    pub async fn sync_knowledge(&mut self) -> Result<()> {
        let op = self.dispatcher.load_knowledge_cache()?;
        let loaded = self.observer.until_finished(op, report_retry).await;
        debug!(outcome = ?loaded, "Knowledge cache loaded");

        let op = self.dispatcher.refresh_knowledge(None)?;
        let outcome = self.observer.until_finished(op, report_retry).await;
        check(outcome)
    }
}

/// Prints retry diagnostics as they happen.
pub fn report_retry(update: &StateUpdate, _: &AppState) {
    if let StateUpdate::Retrying {
        channel,
        attempt,
        delay,
        reason,
    } = update
    {
        let line = format!(
            "  {channel} attempt {attempt} failed ({reason}); retrying in {:.1}s",
            delay.as_secs_f64()
        );
        eprintln!("{}", line.yellow());
    }
}

/// Turns a finished operation's outcome into a CLI result.
pub fn check(outcome: Option<Outcome>) -> Result<()> {
    match outcome {
        Some(Outcome::Completed) => Ok(()),
        Some(Outcome::Cancelled) => anyhow::bail!("Cancelled"),
        Some(Outcome::Failed(failure)) => Err(anyhow::anyhow!(failure.description())),
        None => anyhow::bail!("The dispatcher stopped unexpectedly"),
    }
}
