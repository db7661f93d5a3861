//! The profiler controller: lifecycle dispatch, process/module/boundary
//! state, the ReJIT-coordinator binding, the loader injector, and the
//! rule-ingestion surface the native entry points drive.
//!
//! This crate owns nothing about bytecode or wire formats itself — it
//! composes `profiler_il`'s metadata model, `profiler_rewrite`'s two
//! strategies, and `profiler_rejit`'s coordinator behind a single
//! [`host::RuntimeHost`] capability record, the seam every test in this
//! crate drives through a fake implementation instead of a live CLR.

pub mod config;
pub mod controller;
pub mod errors;
pub mod external;
pub mod host;
pub mod loader;
pub mod process_state;
pub mod registry;
pub mod rejit_adapter;

pub use config::{EngineConfig, EnvSource, FixedEnv, ProcessEnv, RuntimeKind};
pub use controller::ProfilerController;
pub use errors::{CoreError, EngineEvent, Result};
pub use external::{parse_rule_record, PayloadBridge, RuleRecord, RuleRecordError, RuleSource};
pub use host::{PInvokeMap, RuntimeHost, TypeDefInfo, WrapperMember};
pub use loader::LoaderInjector;
pub use process_state::{BoundaryState, ProcessState};
pub use registry::ModuleRegistry;
pub use rejit_adapter::CoreRejitHost;
