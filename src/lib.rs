#![forbid(unsafe_code)]

pub mod batch;
pub mod classify;
pub mod cli;
pub mod config;
pub mod epub;
pub mod extract;
pub mod formats;
pub mod ingest;
pub mod logging;
pub mod mail;
pub mod normalize;
pub mod send;
pub mod sync;
pub mod sync_state;
