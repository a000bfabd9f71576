//! # Floe (v0.1)
//!
//! Embedded engine for declarative flow execution.
//!
//! ## Overview
//!
//! A **flow** is a directed graph of activity tasks connected by control or
//! dependency links, loaded from JSON. Floe instantiates flow definitions
//! and drives each instance through a step-based work-item loop:
//!
//! - **Definitions**: immutable task/link graphs with attributes and mappers
//! - **Execution**: FIFO work-item scheduling, one step at a time, with a
//!   panic barrier and error-handler fallback
//! - **Mapping**: declarative attribute transfer between scopes
//! - **Link conditions**: `$var` expressions compiled once per definition
//! - **Recovery**: every mutation tracked per step and offered to a state
//!   recorder
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use floe::config::EngineConfig;
//! use floe::engine::Engine;
//! use floe::action::RunOptions;
//!
//! let engine = Engine::new(EngineConfig::default_config(), embedded_flows);
//! let result = engine
//!     .action()
//!     .run("embedded://demo", RunOptions::default(), None)
//!     .await?;
//! println!("instance {} finished: {:?}", result.instance_id, result.status);
//! # Ok::<(), floe::error::EngineError>(())
//! ```
//!
//! ## Modules
//!
//! - [`value`] / [`path`] / [`scope`] - typed attributes, coercion, path
//!   addressing, scopes
//! - [`mapper`] - declarative attribute-to-attribute transfer
//! - [`definition`] - the immutable flow graph and its JSON form
//! - [`linkexpr`] - link condition precompiler and evaluator
//! - [`model`] - pluggable flow/task behaviors (`simple` is the default)
//! - [`instance`] - the flow instance executor
//! - [`tracker`] - per-step change batches
//! - [`support`] - test-time patches and interceptors
//! - [`activity`] - pluggable activities and the registry
//! - [`provider`] / [`recorder`] - flow resolution and state recording
//! - [`action`] / [`engine`] / [`config`] - running flows in a host

pub mod action;
pub mod activity;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod instance;
pub mod linkexpr;
pub mod mapper;
pub mod model;
pub mod path;
pub mod provider;
pub mod recorder;
pub mod scope;
pub mod support;
pub mod tracker;
pub mod value;

pub use action::{ActionOptions, FlowAction, RunOptions, RunResult};
pub use activity::{Activity, ActivityContext, ActivityError, ActivityMetadata, ActivityRegistry, ReplyHandler};
pub use config::EngineConfig;
pub use definition::{Definition, DefinitionRep, Link, LinkType, Task};
pub use engine::Engine;
pub use error::EngineError;
pub use instance::{EnvId, ExecType, Instance, LinkState, Status, TaskCtx};
pub use mapper::{Mapper, Mapping, MappingKind};
pub use model::{FlowBehavior, FlowModel, ModelRegistry, TaskBehavior};
pub use provider::{EmbeddedFlowManager, FlowProvider, RemoteFlowProvider};
pub use recorder::{NoopStateRecorder, RemoteStateRecorder, StateRecorder};
pub use scope::{Attribute, Scope};
pub use support::{Interceptor, Patch, TaskInterceptor, TaskPatch};
pub use value::Type;
