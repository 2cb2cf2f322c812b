//! HTTP Request Handlers

pub mod auth;
pub mod health;
