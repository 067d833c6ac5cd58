// ABOUTME: Core library for the hive worker runtime.
// ABOUTME: Wires configuration, providers, and a capability handler onto the stdio channel.

use anyhow::Context;
use log::info;
use std::path::Path;
use std::sync::Arc;

pub mod channel;
pub mod config;
pub mod memory;
pub mod orchestrator;
pub mod providers;
pub mod runtime;

use config::RuntimeConfig;
use memory::AgentMemory;
use orchestrator::router::RoutingTable;
use orchestrator::service::{AssistantWorker, ProjectManagerWorker};
use orchestrator::worker::Worker;
use providers::ProviderDispatcher;
use runtime::{HostLink, WorkerRuntime};

/// Agent id that runs the orchestrating project manager.
pub const PROJECT_MANAGER_ID: &str = "pm";

/// Build the capability handler for `agent_id`. The project manager keeps
/// its learned approaches under `memory_dir`.
pub fn build_worker(
    agent_id: &str,
    display_name: &str,
    dispatcher: Arc<ProviderDispatcher>,
    memory_dir: &Path,
) -> Arc<dyn Worker> {
    if agent_id == PROJECT_MANAGER_ID {
        Arc::new(ProjectManagerWorker::new(
            agent_id,
            display_name,
            dispatcher,
            RoutingTable::default(),
            AgentMemory::for_agent(memory_dir, agent_id),
        ))
    } else {
        Arc::new(AssistantWorker::new(agent_id, display_name, dispatcher))
    }
}

/// Run one worker process: `hive-worker <agent-id> [display name]`.
///
/// Records go to stdout, diagnostics to stderr. Returns when the host closes
/// stdin, which is reported as an error so the host can restart the worker.
pub async fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let agent_id = args.next().unwrap_or_else(|| PROJECT_MANAGER_ID.to_string());
    let display_name = {
        let rest: Vec<String> = args.collect();
        if rest.is_empty() {
            agent_id.clone()
        } else {
            rest.join(" ")
        }
    };

    let config = RuntimeConfig::from_env().context("Invalid runtime configuration")?;
    let dispatcher = Arc::new(ProviderDispatcher::from_config(&config));
    info!(
        "[Main] Starting {} ({}) with providers {:?}",
        display_name,
        agent_id,
        dispatcher.provider_names()
    );

    let worker = build_worker(&agent_id, &display_name, dispatcher, &config.memory_dir);
    let host = HostLink::new(
        agent_id.clone(),
        display_name,
        tokio::io::stdout(),
        config.tool_timeout,
    );
    let runtime = WorkerRuntime::new(worker, host);

    runtime
        .run(tokio::io::stdin())
        .await
        .with_context(|| format!("Worker {} stopped", agent_id))
}
