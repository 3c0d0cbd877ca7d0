//! # llm-router
//!
//! A multi-backend LLM request router: an adaptive scorer picks a backend
//! per request from weighted cost/latency/availability, with per-backend
//! circuit breakers and a fallback chain across the rest of the candidate
//! list; a fingerprinted response cache memoises completed calls; and a
//! persistent quota ledger records every fulfilled request for cost and
//! usage accounting.
//!
//! ## Core concepts
//!
//! - **[`Dispatcher`]** — the single entry point (C1). Owns the router,
//!   cache, and ledger for the lifetime of one core instance.
//! - **[`router::Router`]** (C2) — candidate selection: weighted scoring,
//!   per-backend circuit breakers, forced-backend honouring, health-probe
//!   caching.
//! - **[`backend::Backend`]** (C3) — the uniform adapter contract, with one
//!   concrete implementation per wire protocol
//!   ([`backend::OpenAiBackend`], [`backend::AnthropicBackend`],
//!   [`backend::SelfHostedOpenAiBackend`], [`backend::GenericSelfHostedBackend`]).
//! - **[`cache::Cache`]** (C4) — fingerprint-keyed, TTL- and size-bounded
//!   memoisation of completed responses.
//! - **[`ledger::SqliteLedger`]** (C5) — the embedded store backing both
//!   the cache's write-through persistence and the append-only quota
//!   ledger.
//!
//! ## Quick start
//!
//! ```no_run
//! use llm_router::{Dispatcher, RequestOptions, RouterConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RouterConfig::from_json_str(r#"{
//!         "backends": {
//!             "local": {
//!                 "name": "local",
//!                 "kind": "openai-compatible-self-hosted",
//!                 "baseUrl": "http://localhost:11434",
//!                 "model": "llama3.2:3b"
//!             }
//!         }
//!     }"#)?;
//!
//!     let dispatcher = Dispatcher::new(config)?;
//!     let response = dispatcher
//!         .optimize("why is the sky blue?", vec![], RequestOptions::default())
//!         .await?;
//!     println!("{} ({})", response.content, response.backend_used);
//!     dispatcher.close().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod ctx;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod request;
pub mod router;

pub use cache::{Cache, CacheStats};
pub use config::{BackendDescriptor, BackendKind, Features, RouterConfig, RoutingConfig, Thresholds};
pub use credentials::{CredentialResolver, EnvCredentialResolver};
pub use ctx::{CallCtx, CancelHandle};
pub use dispatcher::{Dispatcher, StatusSnapshot};
pub use error::{AdapterError, AdapterResult, Result, RouterError};
pub use ledger::SqliteLedger;
pub use request::{Request, RequestOptions, Response};
pub use router::{BackendStatus, BreakerState, Router};
