//! The Rust SDK for GrowthBook, an open-source feature flagging and experimentation platform.
//!
//! # Overview
//!
//! Features are defined in a [`FeaturePayload`], usually fetched from the GrowthBook API. Each
//! feature has a default value and an ordered list of rules: forced values, percentage rollouts
//! and experiments, targeted with conditions over user attributes. Evaluating a feature for a user
//! results in a [`FeatureResult`] carrying the value and why it was chosen.
//!
//! There are three ways to evaluate:
//! - [`Client`] serves many users. Each call takes the [`UserContext`] to evaluate for.
//! - [`UserScopedClient`] binds one user to a shared [`Client`].
//! - [`GrowthBook`] is a single-user instance. It also supports remote evaluation.
//!
//! A tracking callback (see [`ClientConfig::tracking_callback`]) should be provided to save
//! experiment exposures to your analytics tool.
//!
//! Payloads fetched from the API are cached and shared by every client in the process. When the
//! server supports it, updates are streamed in the background (see [`sync`]).
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Evaluation never fails: unknown features, malformed rules and unexpected attribute types all
//! evaluate to a value. Errors only come from loading features and from storage backends. In
//! production, it is recommended to log them and carry on with the last known payload.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages,
//! under the `growthbook` target. Consider integrating a `log`-compatible logger implementation
//! for better visibility into SDK operations.
//!
//! # Examples
//!
//! ```
//! # use growthbook::{ClientConfig, FeaturePayload, UserContext};
//! let payload = FeaturePayload::from_json(br#"{
//!     "features": {
//!         "new-checkout": {
//!             "defaultValue": false,
//!             "rules": [{"condition": {"country": "US"}, "force": true}]
//!         }
//!     }
//! }"#)?;
//! let client = ClientConfig::offline().payload(payload).to_client();
//!
//! let user = UserContext::new(serde_json::json!({"id": "1", "country": "US"}).as_object().cloned().unwrap_or_default());
//! assert!(client.is_on("new-checkout", &user));
//! # Ok::<(), growthbook::Error>(())
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

mod attributes;
mod client;
pub mod condition;
mod config;
mod error;
pub mod eval;
pub mod events;
pub mod experiment;
pub mod hashing;
pub mod payload;
pub mod payload_store;
mod scoped;
pub mod sticky_bucket;
pub mod storage;
pub mod sync;
pub mod tracking;
pub mod url_targeting;

pub use attributes::Attributes;
pub use client::Client;
pub use condition::Condition;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use eval::{EvalOptions, UserContext};
pub use experiment::{Experiment, ExperimentResult, FeatureResult};
pub use payload::{FeaturePayload, SavedGroups};
pub use scoped::{GrowthBook, UserScopedClient};
