//! Telegram front-end for apkforge: list batches, confirm builds, deliver APKs.

pub mod app;
pub mod commands;
pub mod config;
pub mod render;
pub mod telegram;
