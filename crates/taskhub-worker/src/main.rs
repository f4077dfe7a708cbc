use clap::Parser;
use std::sync::Arc;
use taskhub_worker::{
    GrpcTaskHubClient, HandlerResult, ProtocolHandler, activity_handler, orchestration_handler,
    proto::{
        ActivityRequest, ActivityResponse, CompleteOrchestrationAction, OrchestrationStatus,
        OrchestratorAction, OrchestratorRequest, OrchestratorResponse, history_event::EventType,
        orchestrator_action::OrchestratorActionType,
    },
    worker::{
        config::{CliArgs, WorkerConfig},
        telemetry::init_telemetry,
    },
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = WorkerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let client = Arc::new(GrpcTaskHubClient::connect_lazy(config.address.clone())?);
    let worker = ProtocolHandler::with_options(client, config.options);

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(cancel.clone()));

    worker
        .start(
            orchestration_handler(echo_orchestration),
            activity_handler(echo_activity),
            cancel,
        )
        .await;
    signals.abort();

    tracing::info!("Worker shut down successfully");
    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &WorkerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting worker against {} with full config: {:#?}",
            config.address,
            config.options
        );
    } else {
        tracing::info!(
            "Starting worker against {} ({} orchestrations, {} activities)",
            config.address,
            config.options.max_concurrent_work_items(),
            config.options.max_concurrent_activities()
        );
    }
}

/// Completes the orchestration with the input it was started with.
async fn echo_orchestration(request: OrchestratorRequest) -> HandlerResult<OrchestratorResponse> {
    let input = request
        .past_events
        .iter()
        .chain(&request.new_events)
        .find_map(|event| match &event.event_type {
            Some(EventType::ExecutionStarted(started)) => Some(started.input.clone()),
            _ => None,
        })
        .flatten();

    Ok(OrchestratorResponse {
        instance_id: request.instance_id,
        actions: vec![OrchestratorAction {
            id: -1,
            orchestrator_action_type: Some(OrchestratorActionType::CompleteOrchestration(
                CompleteOrchestrationAction {
                    orchestration_status: OrchestrationStatus::Completed as i32,
                    result: input,
                    ..Default::default()
                },
            )),
        }],
        ..Default::default()
    })
}

/// Returns the activity's input as its result.
async fn echo_activity(request: ActivityRequest) -> HandlerResult<ActivityResponse> {
    Ok(ActivityResponse {
        result: request.input,
        ..Default::default()
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Shutdown signal received, stopping worker...");
    cancel.cancel();
}
