//! HTTP gateway that converts YouTube videos to MP3 with `yt-dlp` and serves
//! each converted file for a one-time download.

pub mod app;
pub mod config;
pub mod error;
pub mod extractor;
pub mod routes;
pub mod store;
pub mod youtube;

pub use app::{AppState, build_cors_layer, build_router};
