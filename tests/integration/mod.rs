//! End-to-end tests driving the orchestrator against real git
//! repositories and real child processes (plain `sh` scripts standing in
//! for the agent).

mod fixtures;
mod orchestration;
