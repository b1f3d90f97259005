//! Core domain models for convoy orchestration.
//!
//! This module contains the task data model and the dependency analyzer
//! that turns a task list into an ordered wave plan.

pub mod analyzer;
pub mod task;
