//! Syncs a single attribute of Keycloak users onto the matching cluster user objects, as a
//! label and/or annotation.

pub mod cli;
pub mod controller;
pub mod crd;
pub mod keycloak;
pub mod logging;
pub mod pacing;
pub mod schedule;
pub mod status;
pub mod store;
pub mod transport;
pub mod updater;
