//! Core library for the rewardboard admin dashboard.
//!
//! This crate holds the session and presence machinery that every screen of
//! the dashboard relies on:
//!
//! - `auth`: credential store, single-flight token refresh, login/logout
//! - `api`: the request pipeline that attaches and renews bearer tokens
//! - `gate`: the per-route authentication gate
//! - `presence`: the "who is online" tracker (polling or STOMP push)
//! - `config`: user configuration and the typed settings derived from it
//!
//! `AuthContext` wires one instance of each together.

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod gate;
pub mod models;
pub mod presence;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use context::AuthContext;
