pub mod configuration;
pub mod core;
pub mod helper;
pub mod startup;
pub mod telemetry;
