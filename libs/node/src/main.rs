use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use courier_core::{
    Address, Broker, BrokerHooks, SocketServer, SocketServerOptions, TlsServerConfig,
};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

/// Presents the configured identity and enforces the allow-list.
struct NodeHooks {
    identity: Value,
    allow: Vec<String>,
}

#[async_trait]
impl BrokerHooks for NodeHooks {
    async fn identity(&self) -> Value {
        self.identity.clone()
    }

    async fn verify_client(&self, identity: &Value) -> bool {
        if self.allow.is_empty() {
            return true;
        }
        identity
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|service_type| self.allow.iter().any(|allowed| allowed == service_type))
    }
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let directives = match (&config.rust_log, config.debug) {
        (Some(directives), _) => directives.as_str(),
        (None, true) => "debug",
        (None, false) => "info",
    };
    let filter = EnvFilter::try_new(directives).context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config)?;

    let broker = Broker::new();
    let hooks = || NodeHooks {
        identity: config.identity.clone().unwrap_or_else(|| json!({})),
        allow: config.allow.clone(),
    };

    let mut options = SocketServerOptions::new(config.listen.clone()).hooks(hooks());
    if let (Some(key), Some(cert)) = (&config.tls_key, &config.tls_cert) {
        let tls = TlsServerConfig::from_files(key, cert).with_context(|| {
            format!("could not load TLS pair {} / {}", key.display(), cert.display())
        })?;
        options = options.tls(tls);
    }
    let tcp = SocketServer::bind(&broker, options)
        .await
        .with_context(|| format!("could not listen on {}", config.listen))?;
    info!(address = %tcp.address(), tls = config.tls_key.is_some(), "broker listening");

    let unix = match &config.unix {
        Some(path) => {
            let address = Address::Unix(path.clone());
            let server = SocketServer::bind(&broker, SocketServerOptions::new(address.clone()).hooks(hooks()))
                .await
                .with_context(|| format!("could not listen on {}", address))?;
            info!(address = %server.address(), "broker listening");
            Some(server)
        }
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("could not wait for ctrl-c")?;
    info!("shutting down");

    tcp.close();
    if let Some(unix) = unix {
        unix.close();
    }
    broker.close();
    Ok(())
}
