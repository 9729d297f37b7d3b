//! Jsonipc RPC caller - invoke one method on an engine's root object.
//!
//! Connects to the engine, waits for the bootstrap handshake, calls the
//! requested method with JSON arguments and prints the JSON result.

use anyhow::{bail, Context, Result};
use clap::Parser;
use jsonipc_core::config::{EndpointConfig, ProtocolConfig};
use jsonipc_core::{ClientConfig, Endpoint, Session};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "jsonipc-rpc")]
#[command(about = "Call a method on a Jsonipc engine")]
struct Args {
    /// Method to call on the root object
    method: String,

    /// Arguments as a JSON array
    #[arg(default_value = "[]")]
    args: String,

    /// Engine host
    #[arg(long, default_value = EndpointConfig::DEFAULT_HOST)]
    host: String,

    /// Engine port
    #[arg(short, long, default_value_t = EndpointConfig::DEFAULT_PORT)]
    port: u16,

    /// WebSocket path
    #[arg(long, default_value = EndpointConfig::DEFAULT_PATH)]
    path: String,

    /// Credential presented as the WebSocket subprotocol
    #[arg(long, default_value = EndpointConfig::DEFAULT_CREDENTIAL)]
    credential: String,

    /// Bootstrap method returning the root object id
    #[arg(long, default_value = ProtocolConfig::BOOTSTRAP_METHOD)]
    bootstrap_method: String,

    /// Seconds to wait for the reply (0 = wait forever)
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_args(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str(raw).context("Arguments must be valid JSON")? {
        Value::Array(args) => Ok(args),
        other => bail!("Arguments must be a JSON array, got {}", other),
    }
}

/// Level used when `RUST_LOG` is unset.
fn default_log_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only the result
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_directive(args.debug)));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let call_args = parse_args(&args.args)?;

    let config = ClientConfig::default()
        .with_endpoint(Endpoint::new(args.host, args.port, args.path))
        .with_credential(args.credential)
        .with_bootstrap_method(args.bootstrap_method);

    info!("Connecting to {}", config.endpoint);
    let session = Session::connect(&config)?;
    let server = session
        .server()
        .await
        .context("Failed to bootstrap engine session")?;
    debug!("Root object {}", server.id());

    let outcome = if args.timeout == 0 {
        server.call(&args.method, call_args).await
    } else {
        server
            .call_with_timeout(&args.method, call_args, Duration::from_secs(args.timeout))
            .await
    };
    let result = outcome.with_context(|| format!("Call to {} failed", args.method))?;

    // Intentional stdout: the call result is the program output
    println!("{}", serde_json::to_string_pretty(&result)?);

    session.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_args_accepts_array() {
        assert_eq!(parse_args("[1, \"a\"]").unwrap(), vec![json!(1), json!("a")]);
        assert!(parse_args("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_args_rejects_non_arrays() {
        assert!(parse_args("{}").is_err());
        assert!(parse_args("not json").is_err());
    }

    #[test]
    fn test_default_log_directive_parses() {
        assert_eq!(default_log_directive(true), "debug");
        assert_eq!(default_log_directive(false), "info");
        for debug in [true, false] {
            assert!(default_log_directive(debug).parse::<EnvFilter>().is_ok());
        }
    }

    #[test]
    fn test_cli_defaults() {
        let args = Args::parse_from(["jsonipc-rpc", "getName"]);
        assert_eq!(args.port, 27239);
        assert_eq!(args.credential, "auth123");
        assert_eq!(args.args, "[]");
    }
}
