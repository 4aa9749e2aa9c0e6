//! ABOUTME: Thin CLI wrapper over the orchestration core for local operation (spec §6 exit codes)

pub mod cli;
pub mod commands;
pub mod output;
