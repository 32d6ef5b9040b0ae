//! # Ensemble core types
//!
//! Shared vocabulary for the workflow engine and the persona workers:
//!
//! - [`wire`] - the stream field schemas (persona requests and response
//!   events) and status folding
//! - [`personas`] - the persona roster
//! - [`config`] - process configuration loaded from file + environment
//! - [`dashboard`] - client interface to the external task dashboard
//! - [`info`] - information-acquisition requests and artifact persistence
//!
//! This crate carries no business logic for any persona; personas are opaque
//! handlers identified by name.

pub mod client;
pub mod config;
pub mod dashboard;
pub mod info;
pub mod personas;
pub mod wire;

pub use client::{
    new_corr_id, request_persona, send_persona_request, wait_for_persona_completion,
    PersonaClientError,
};
pub use config::{EnsembleConfig, TransportKind};
pub use dashboard::{DashboardClient, DashboardError, MemoryDashboard, NewTask, TaskSummary};
pub use wire::{ContractError, PersonaEvent, PersonaRequest, PersonaStatus};
