//! Folder-as-a-service controller: configuration and the HTTP surface

pub mod api;
pub mod config;
