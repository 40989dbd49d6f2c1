//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Shared primitives and utilities for the driver runtime."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Shared primitives for the FlockLink workspace.
//! This crate exposes configuration loading, tracing initialisation and the
//! vehicle identifier formatting rules consumed across the workspace.

pub mod config;
pub mod ids;
pub mod logging;

pub use config::{AppConfig, DriverConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, ReassemblyConfig};
pub use ids::{make_valid_vehicle_id, IdFormat, IdFormatError};
pub use logging::{init_tracing, LogFormat};
