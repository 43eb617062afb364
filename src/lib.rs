//! Language-server plumbing for a modal terminal editor.
//!
//! [`lsp`] speaks JSON-RPC to external servers and pools one client per
//! workspace, [`pipeline`] turns a cursor position into a jump without
//! blocking the editor loop, and [`editor`] is the small buffer host the
//! `mlsp` binary drives.

pub mod cli;
pub mod commands;
pub mod config;
pub mod editor;
pub mod lsp;
pub mod pipeline;
pub mod utils;
pub mod workspace;
