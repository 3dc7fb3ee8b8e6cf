use erp_flow_runner::RunnerConfig;
use erp_flow_workflow::ExecutionStatus;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match RunnerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.engine.validate() {
        tracing::error!(error = %e, "invalid engine configuration");
        return ExitCode::FAILURE;
    }

    let snapshot = match erp_flow_runner::run(&config).await {
        Ok(snapshot) => snapshot,
        Err(report) => {
            tracing::error!(error = %report, "workflow run could not start");
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode execution snapshot");
            return ExitCode::FAILURE;
        }
    }

    if snapshot.status == ExecutionStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}
