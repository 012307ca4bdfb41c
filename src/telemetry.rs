use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured
/// level when set.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| anyhow!("Invalid log level '{}': {}", config.log_level, e))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()?;
    }

    tracing::info!("Pipeline telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn create_transition_span(
    entity_id: &str,
    idempotency_key: &str,
    correlation_id: &str,
) -> tracing::Span {
    tracing::info_span!(
        "workflow_transition",
        entity.id = entity_id,
        idempotency.key = idempotency_key,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

pub fn create_dispatch_span(instance_id: &str, claim_token: &str) -> tracing::Span {
    tracing::info_span!(
        "outbox_dispatch",
        dispatcher.instance = instance_id,
        claim.token = claim_token,
        otel.kind = "internal"
    )
}

pub fn create_lock_span(operation: &str, entity_id: &str, holder_id: Option<&str>) -> tracing::Span {
    tracing::debug_span!(
        "generation_lock",
        operation = operation,
        entity.id = entity_id,
        holder.id = holder_id,
        otel.kind = "internal"
    )
}

/// Shutdown telemetry gracefully
pub fn shutdown_telemetry() {
    // For structured logging, no explicit shutdown needed
    tracing::info!("Pipeline telemetry shutdown complete");
}
