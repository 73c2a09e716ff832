// Workflow execution core
// DAG scheduler, node runtime, run lifecycle manager, and trigger layer
// for a visual AI-workflow platform.

//! # Workflow Core
//!
//! This crate implements the execution core described by the workflow
//! platform's specification: a DAG scheduler that turns a workflow
//! definition plus input bindings into an ordered, observable, resumable
//! execution with retry and failure isolation.
//!
//! ## Layering
//!
//! - [`dag`] builds the dependency graph from a [`WorkflowDefinition`].
//! - [`condition`] compiles and evaluates the boolean expression DSL used by
//!   edge conditions and `branch` nodes.
//! - [`state`] defines the run-scoped key/value map ([`RunState`]) that
//!   templates and conditions read from.
//! - [`nodes`] is the registry of typed node builders producing uniform
//!   "agents" with a streamed event contract.
//! - [`executor`] spawns one cooperative task per node and enforces
//!   trigger-rule gating.
//! - [`workflow_service`] composes the executor with session setup and
//!   translates raw executor events into the public `WorkflowEvent`
//!   taxonomy.
//! - [`run_manager`] owns the per-run event buffer, subscriber fan-out, and
//!   TTL-based garbage collection backing SSE reconnects.
//! - [`concurrency`], [`retry`], [`scheduler`], and [`webhook`] form the
//!   trigger layer: concurrency limiting, retry with backoff, cron, and
//!   webhook intake.
//! - [`history`] and [`repositories`] are the persistence-facing traits
//!   (backed here by in-memory implementations; real adapters are an
//!   external collaborator per the specification).
//! - [`api`] binds all of the above to an axum HTTP router.

pub mod concurrency;
pub mod condition;
pub mod config;
pub mod dag;
pub mod executor;
pub mod handle;
pub mod history;
pub mod llm;
pub mod nodes;
pub mod repositories;
pub mod retry;
pub mod run_manager;
pub mod scheduler;
pub mod state;
pub mod template;
pub mod webhook;
pub mod workflow_service;

pub mod api;

pub use dag::{Dag, EdgeDefinition, NodeDefinition, TriggerRule, WorkflowDefinition};
pub use state::{RunState, Value};

use thiserror::Error;

/// Crate-wide error type.
///
/// Variants map 1:1 onto the error kinds of the specification: `validation`
/// (pre-run, 400), `not_found` (404), `unauthorized` (401), `forbidden`
/// (403), `timeout` (node-level), `retryable_transient` (classified by
/// [`retry`]), `fatal_node` (unhandled, uncancellable), and `cancelled`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("node timeout: {0}")]
    NodeTimeout(String),

    #[error("retryable transient error: {0}")]
    RetryableTransient(String),

    #[error("fatal node error: {0}")]
    FatalNode(String),

    #[error("cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cron error: {0}")]
    Cron(String),

    #[error("other: {0}")]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a [`CoreError`], used by HTTP handlers to map
/// errors onto status codes without re-matching the full enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Forbidden,
    Timeout,
    RetryableTransient,
    FatalNode,
    Cancelled,
    Internal,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Unauthorized(_) => ErrorKind::Unauthorized,
            CoreError::Forbidden(_) => ErrorKind::Forbidden,
            CoreError::NodeTimeout(_) => ErrorKind::Timeout,
            CoreError::RetryableTransient(_) => ErrorKind::RetryableTransient,
            CoreError::FatalNode(_) => ErrorKind::FatalNode,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::Serialization(_)
            | CoreError::Io(_)
            | CoreError::Http(_)
            | CoreError::Cron(_)
            | CoreError::Other(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
