pub mod agent;
pub mod channel;
pub mod cli;
pub mod config;
pub mod control_loop;
pub mod controller;
pub mod coords;
pub mod correlation;
pub mod keys;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod state;
pub mod telemetry;
