//! Shared types for the roomdrop transfer engine and its control plane.

pub mod api;
pub mod events;
pub mod models;
