// ABOUTME: Orchestrator module: worker trait, tool-call correlation, planning, routing, and tracking.
// ABOUTME: The service module holds the capability handlers the worker binary runs.

pub mod decomposer;
pub mod router;
pub mod service;
pub mod tool_bridge;
pub mod tracker;
pub mod types;
pub mod worker;
