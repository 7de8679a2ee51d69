//! ragdesk - chat with a hosted model grounded in your own documents
//!
//! This is the convenience wrapper crate that re-exports the ragdesk core.
//!
//! # Quick Start
//!
//! ```toml
//! [dependencies]
//! ragdesk = "0.1"
//! ```

pub use ragdesk_core::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use ragdesk_core::config::Config;
    pub use ragdesk_core::{
        AppState, Channel, DispatchError, Dispatcher, DocumentStore, Outcome, Provider,
        StateObserver, StateUpdate,
    };
}
