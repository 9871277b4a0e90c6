use std::time::Duration;

use ajo_webhooks::{Dispatcher, DispatcherConfig, EventData, EventMetadata, NewEndpoint, RetryPolicy, WebhookEventType};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DispatcherConfig::from_env()?.with_request_timeout(Duration::from_secs(5));
    let dispatcher = Dispatcher::new(config)?;
    dispatcher.load_from_environment().await;

    let id = dispatcher
        .register_endpoint(
            NewEndpoint::new(
                "https://example.com/webhooks/ajo",
                [WebhookEventType::GroupCreated, WebhookEventType::ContributionMade],
            )
            .with_secret("supersecret")
            .with_retry_policy(RetryPolicy::new(3, 500)),
        )
        .await?;
    tracing::info!(endpoint_id = %id, "Registered demo endpoint");

    let mut reports = dispatcher.subscribe_reports();
    tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            tracing::info!(
                event_id = %report.event_id,
                endpoint_id = %report.endpoint_id,
                attempts = report.attempts,
                success = report.is_success(),
                "Delivery settled"
            );
        }
    });

    let mut data = EventData::new();
    data.insert("groupId".into(), json!("grp_42"));
    data.insert("amount".into(), json!(250));
    dispatcher
        .trigger(
            WebhookEventType::ContributionMade,
            data,
            Some(EventMetadata::default().with_group_id("grp_42").with_network("testnet")),
        )
        .await?;

    dispatcher.send_test_event(&id).await?;

    dispatcher.wait_idle().await;
    println!("{}", serde_json::to_string_pretty(&dispatcher.stats().await)?);
    dispatcher.shutdown().await;
    Ok(())
}
