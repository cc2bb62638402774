use anyhow::Result;
use mesh_channel::RpcChannelFactory;
use mesh_core::{PoolMetrics, ServiceRegistry};
use mesh_discovery::{
    CoordinationStore, DiscoveryClient, EtcdStore, MemoryStore, RegistrationClient,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, info_span, warn};

mod admin;
mod config;
mod logging;

use config::AgentConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::load()?;
    logging::init(&config.log)?;

    info!("Starting mesh-agent...");

    let store: Arc<dyn CoordinationStore> = if config.etcd_endpoints.is_empty() {
        warn!("No etcd endpoints configured, using an in-process store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(EtcdStore::connect(&config.etcd_endpoints).await?)
    };

    let metrics = PoolMetrics::new()?;
    let registry = Arc::new(
        ServiceRegistry::new(RpcChannelFactory, config.channel.to_options())
            .with_span(info_span!("registry", base = %config.base_service))
            .with_metrics(metrics),
    );
    for service in &config.interests {
        registry.declare_interest(service);
        info!("Declared interest in {}", service);
    }

    let discovery =
        DiscoveryClient::start(store.clone(), &config.base_service, registry.clone()).await?;

    let registration = match &config.registration {
        Some(own) => {
            let client = RegistrationClient::new(store.clone(), config.lease_ttl()).await?;
            let key = client.register_instance(&own.service, &own.address).await?;
            info!("Registered {} as {} (lease {})", own.address, key, client.lease_id());
            Some(client)
        }
        None => None,
    };

    let admin_listener = TcpListener::bind(config.admin_addr).await?;
    info!("Admin listener on {}", config.admin_addr);
    let admin = tokio::spawn(admin::serve(admin_listener, registry.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down mesh-agent...");

    discovery.cancel();
    if let Some(registration) = &registration {
        registration.cancel();
    }
    admin.abort();

    Ok(())
}
