//! Feature and experiment evaluation.
//!
//! Evaluation functions are pure with respect to the outside world: they read a payload snapshot,
//! client options, and a user through an [`EvalContext`], and record side effects
//! ([`EvalEvent`](crate::events::EvalEvent)s) in the context instead of performing them. Client
//! adapters dispatch the events after evaluation.
//!
//! # Examples
//! ```
//! # use growthbook::{eval::{eval_feature, EvalContext, EvalOptions, UserContext}, FeaturePayload};
//! let payload = FeaturePayload::from_json(br#"{"features": {"dark-mode": {"defaultValue": true}}}"#)?;
//! let options = EvalOptions::default();
//! let user = UserContext::default();
//!
//! let mut ctx = EvalContext::new(&payload, &options, &user);
//! assert!(eval_feature("dark-mode", &mut ctx).on);
//! # Ok::<(), growthbook::Error>(())
//! ```
mod context;
mod experiment;
mod feature;
mod rollout;

pub use context::{EvalContext, EvalOptions, UserContext};
pub use experiment::run_experiment;
pub use feature::eval_feature;
