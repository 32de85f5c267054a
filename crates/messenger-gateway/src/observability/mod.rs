//! Ops-plane surface: health probes and the status endpoint.

pub mod health;
