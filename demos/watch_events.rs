use std::error::Error;

use srat_events::stream::client::{EventStreamClient, EventStreamOptions, TransportKind};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("srat_events=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let base_url = args
        .next()
        .unwrap_or_else(|| "http://homeassistant.local:8099".to_string());
    let transport = match args.next().as_deref() {
        Some("sse") => TransportKind::Sse,
        _ => TransportKind::WebSocket,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = EventStreamClient::new(base_url)
            .with_transport(transport)
            .with_options(EventStreamOptions::from_env());
        println!("endpoint: {}", client.endpoint()?);

        let cache = client.cache();
        let mut subscription = cache.subscribe().await?;

        loop {
            tokio::select! {
                changed = subscription.changed() => {
                    if !changed {
                        break;
                    }
                    let query = subscription.query();
                    let health = subscription.health();
                    println!(
                        "state={:?} faults={} loading={} document={}",
                        health.state,
                        health.faults,
                        query.is_loading,
                        serde_json::to_string(&query.data)?
                    );
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        subscription.unsubscribe().await;
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
