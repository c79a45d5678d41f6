//! carina-controller: a control plane sitting between a microscopic traffic
//! simulator and a learning core, responsible for arbitrating commands,
//! enforcing operator overrides and failsafes, and turning raw per-step
//! state into telemetry and longer-horizon engineering analysis.

pub mod analysis;
pub mod config;
pub mod controller;
pub mod errors;
pub mod learning_core;
pub mod model;
pub mod safety;
pub mod simulator;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod watchdog;
