//! orb-agent
//!
//! Control-plane side of a fleet agent:
//! - connects to core over the bridge transport and announces capabilities
//! - follows group membership and applies agent policies
//! - heartbeats until core stops it or the process is interrupted
//!
//! Exit codes: 0 on interrupt, 3 when core sent `agent-stop`, 1 on error.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use orb_agent::config::{self, AgentConfig};
use orb_agent::obs::AgentMetrics;
use orb_agent::policy::{Backend, LocalBackend, LocalPolicyManager};
use orb_agent::session::{AgentSession, Termination, EXIT_STOPPED_BY_CORE};
use orb_agent::transport::WsConnector;
use orb_agent::{app_state, router};
use orb_agent_core::error::{AgentError, Result};

#[derive(Debug, Parser)]
#[command(name = "orb-agent", version, about = "orb fleet agent control plane")]
struct Cli {
    /// Path to the agent config file.
    #[arg(long, env = "ORB_AGENT_CONFIG", default_value = "orb-agent.yaml")]
    config: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(&cli).await {
        Ok(Termination::Interrupted) => {
            tracing::info!("orb-agent interrupted, exiting");
            ExitCode::SUCCESS
        }
        Ok(Termination::Stopped { reason }) => {
            tracing::info!(reason = %reason, "orb-agent stopped by core");
            ExitCode::from(EXIT_STOPPED_BY_CORE)
        }
        Err(e) => {
            tracing::error!(error = %e, code = e.code().as_str(), "orb-agent failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<Termination> {
    let cfg: AgentConfig = config::load_from_file(&cli.config)?;
    tracing::info!(
        agent_id = %cfg.agent.id,
        channel_id = %cfg.agent.channel_id,
        url = %cfg.transport.url,
        "orb-agent starting"
    );

    let backends: Vec<Arc<dyn Backend>> = cfg
        .backends
        .iter()
        .map(|b| Arc::new(LocalBackend::new(b.name.clone(), b.version.clone())) as Arc<dyn Backend>)
        .collect();
    let policies = Arc::new(LocalPolicyManager::new(
        cfg.backends.iter().map(|b| b.name.clone()),
    ));
    let connector = Arc::new(WsConnector::new(
        cfg.transport.clone(),
        cfg.agent.id.clone(),
        cfg.agent.key.clone(),
    ));
    let ops_listen = cfg.ops.listen.clone();
    let agent_id = cfg.agent.id.clone();

    let session = AgentSession::new(
        Arc::new(cfg),
        connector,
        policies,
        backends,
        Arc::new(AgentMetrics::default()),
    );

    let ops = match ops_listen {
        Some(listen) => {
            let addr: SocketAddr = listen
                .parse()
                .map_err(|e| AgentError::Config(format!("ops.listen {listen}: {e}")))?;
            let app = router::build_router(app_state::AppState::new(agent_id, &session));
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| AgentError::Config(format!("bind ops listener {addr}: {e}")))?;
            tracing::info!(%addr, "ops endpoints listening");
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "ops server failed");
                }
            }))
        }
        None => None,
    };

    let res = session
        .run(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Some(ops) = ops {
        ops.abort();
    }
    res
}
