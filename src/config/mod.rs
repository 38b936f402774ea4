//! User configuration: store location, default transport, container engine
//! and network settings.
//!
//! Read from `$XDG_CONFIG_HOME/depot/config.toml` (or `~/.config/depot/config.toml`).
//! Every field has a default, so a missing file or a partial one is fine.
//!
//! ```no_run
//! use depot::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Store: {}", config.store.path.display());
//! println!("Engine strategy: {}", config.engine.strategy);
//! ```

pub mod schema;

pub use schema::{config_path, Config};
