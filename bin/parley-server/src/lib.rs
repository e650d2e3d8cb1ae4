//! parley-server: REST and WebSocket front end for the parley conversation
//! pipeline.

pub mod cache;
pub mod config;
pub mod entities;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod schemas;
pub mod state;
pub mod transport;
