use std::env;
use std::sync::Arc;

use anyhow::Result;
use changeprop::bus::{BusConsumer, GuaranteedProducer, MemoryBus};
use changeprop::config::{self, Config};
use changeprop::executor::{Executor, ExecutorConfig};
use changeprop::metrics::create_metrics_publisher;
use changeprop::registry::RuleRegistry;
use changeprop::service;
use tokio::signal;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    let version = config::version()?;

    env::args().for_each(|arg| {
        if arg == "--version" {
            println!("{version}");
            std::process::exit(0);
        }
    });

    // In local dev, pick up a .env file before reading the environment.
    dotenvy::dotenv().ok();
    let config = Config::new()?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!(version = %config.version, "Starting changeprop");

    if let Some(delay) = config.startup_delay.get() {
        info!(delay_ms = delay.as_millis() as u64, "Startup delay");
        tokio::time::sleep(delay).await;
    }

    let rule_specs = config::load_rules(&config.rules_path)?;
    let rules = service::compile_rules(&rule_specs, *config.http_timeout.as_ref())?;
    info!(rules = rules.len(), path = %config.rules_path, "Rules compiled");
    let registry = Arc::new(RuleRegistry::new(rules)?);

    let metrics =
        create_metrics_publisher(config.metrics_host.as_deref(), &config.metrics_prefix)?;

    debug!(
        consumer = ?config.kafka.consumer_settings(&config.consumer_group),
        topic = ?config.kafka.consumer_topic_settings(),
        producer = ?config.kafka.producer_settings(),
        "Bus client settings"
    );

    // Single-node mode runs over the in-process bus; a Kafka deployment
    // binds the same traits with the settings above.
    let bus = MemoryBus::new();
    let producer = GuaranteedProducer::new(Arc::new(bus.producer()));
    let http = Executor::default_http_client(&config.user_agent)?;

    let executor_config = ExecutorConfig {
        emitter_id: config.emitter_id(),
        user_agent: config.user_agent.clone(),
        produce_dc: config.dc.produce_dc.clone(),
        max_chain_length: *config.max_chain_length.as_ref(),
    };
    let handles = service::start(
        registry,
        |group| Arc::new(bus.consumer(group)) as Arc<dyn BusConsumer>,
        producer,
        http,
        metrics,
        &config.consumer_group,
        &config.dc.consume_dc,
        executor_config,
    );

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    bus.close().await;
    handles.shutdown().await;

    Ok(())
}
