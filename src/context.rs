use crate::config::Config;
use crate::error::Result;
use crate::store::GlobalStore;
use crate::transfer::Transfer;
use reqwest::blocking::Client;
use std::fmt;
use std::time::Duration;

/// Shared state for one invocation: configuration, the opened store and the HTTP stack
pub struct Context {
    config: Config,
    store: GlobalStore,
    transfer: Transfer,
    hf_token: Option<String>,
    quiet: bool,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("store", &self.store)
            .field("hf_token", &self.hf_token.as_ref().map(|_| "***"))
            .field("quiet", &self.quiet)
            .finish_non_exhaustive()
    }
}

/// `HF_TOKEN`, else the token saved by `hf auth login`
fn discover_hf_token() -> Option<String> {
    std::env::var("HF_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| hf_hub::Cache::default().token())
        .map(|t| t.trim().to_string())
}

impl Context {
    /// Open the configured store and build the shared HTTP client
    pub fn new(config: Config) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.network.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.network.timeout_secs))
            // No overall deadline; metadata requests set their own
            .timeout(None)
            .build()?;
        let transfer = Transfer::new(
            client,
            Duration::from_millis(config.network.progress_interval_ms),
        );
        let store = GlobalStore::open(config.store.path.clone())?;
        let hf_token = discover_hf_token();
        if hf_token.is_some() {
            tracing::debug!("Using HuggingFace token");
        }

        Ok(Self {
            config,
            store,
            transfer,
            hf_token,
            quiet: false,
        })
    }

    /// Suppress progress bars
    #[must_use]
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &GlobalStore {
        &self.store
    }

    #[must_use]
    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    #[must_use]
    pub fn hf_token(&self) -> Option<&str> {
        self.hf_token.as_deref()
    }

    #[must_use]
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.config.network.timeout_secs)
    }

    #[must_use]
    pub fn show_progress(&self) -> bool {
        !self.quiet
    }
}
