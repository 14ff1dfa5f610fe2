#![doc = include_str!("../README.md")]
//!
//! # Module Structure
//!
//! - [`error`]: Domain error types (`CpiError`, `LifecycleError`, `ErrorRecord`)
//! - [`config`]: Per-run configuration (`LifecycleConfig`, builder)
//! - [`cpi`]: Backend contract (`CloudBackend`, `CloudInspector`, `CloudProvider`)
//! - [`registry`]: Agent settings side channel (`AgentRegistry`, `InMemoryRegistry`)
//! - [`simulated`]: In-memory provider with fault injection (`SimulatedCloud`)
//! - [`provisioner`]: Acquisition wrapper (`ResourceProvisioner`)
//! - [`verifier`]: Post-conditions (`LifecycleVerifier`)
//! - [`teardown`]: Cleanup stack (`TeardownAggregator`, `CleanupAction`)
//! - [`lifecycle`]: Run state machine (`VmLifecycle`, `vm_lifecycle`)
//! - [`scenario`]: Scenario table (`ScenarioMatrix`, `Scenario`)
//! - [`runner`]: Sequential matrix runner (`ScenarioRunner`)
//! - [`logging`]: Tracing subscriber setup
//!
//! # Architecture
//!
//! ```text
//! ScenarioMatrix --> ScenarioRunner
//!                        |
//!                   VmLifecycle (state machine)
//!                        |
//!       ResourceProvisioner --register--> TeardownAggregator
//!              |                                 |
//!        LifecycleVerifier                 unwind (reverse)
//!              |                                 |
//!        CloudBackend / CloudInspector <---------+
//! ```

pub mod config;
pub mod cpi;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod provisioner;
pub mod registry;
pub mod runner;
pub mod scenario;
pub mod simulated;
pub mod teardown;
pub mod verifier;

// --- Public API Re-exports ---

// Runner
pub use runner::{MatrixReport, ScenarioReport, ScenarioRunner};

// Configuration
pub use config::{LifecycleConfig, LifecycleConfigBuilder};

// Error
pub use error::{CpiError, ErrorClass, ErrorRecord, LifecycleError, Phase};

// Backend contract
pub use cpi::{CloudBackend, CloudInspector, CloudProvider, ConfigDrive, CpiOperation, CpiOptions};
pub use registry::{AgentRegistry, AgentSettings, InMemoryRegistry};
pub use simulated::SimulatedCloud;

// Lifecycle
pub use lifecycle::{LifecycleProbe, LifecycleState, VmLifecycle, vm_lifecycle};
pub use provisioner::ResourceProvisioner;
pub use teardown::{CleanupAction, ResourceReleaser, TeardownAggregator, TeardownReport};
pub use verifier::LifecycleVerifier;

// Scenarios
pub use scenario::{Expectation, ExpectedOutcome, Procedure, Scenario, ScenarioMatrix, Topology};
