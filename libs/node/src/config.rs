use clap::Parser;
use courier_core::Address;
use serde_json::Value;

/// Standalone courier broker
#[derive(Parser, Debug, Clone)]
#[command(name = "courier-node", version, about)]
pub struct Config {
    /// Address to accept service connections on (`host:port` or `unix:/path`)
    #[arg(long, env = "COURIER_LISTEN", default_value = "0.0.0.0:61610")]
    pub listen: Address,

    /// Additional Unix socket to listen on
    #[arg(long, env = "COURIER_UNIX")]
    pub unix: Option<std::path::PathBuf>,

    /// PEM private key; serves TLS on `--listen` together with `--tls-cert`
    #[arg(long, env = "COURIER_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<std::path::PathBuf>,

    /// PEM certificate chain matching `--tls-key`
    #[arg(long, env = "COURIER_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<std::path::PathBuf>,

    /// JSON identity presented to connecting services
    #[arg(long, env = "COURIER_IDENTITY", value_parser = parse_identity)]
    pub identity: Option<Value>,

    /// Only admit services of these types; repeatable. Admits all when empty
    #[arg(long = "allow", value_name = "TYPE")]
    pub allow: Vec<String>,

    /// Tracing filter directives; takes precedence over `--debug`
    #[arg(long, env = "RUST_LOG")]
    pub rust_log: Option<String>,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,
}

fn parse_identity(raw: &str) -> Result<Value, String> {
    match serde_json::from_str(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("identity must be a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}
