//! Resolved daemon configuration: `cli::Args` as parsed by `clap`, fixed up
//! into concrete types (`SocketAddr`, `Duration`, `PathBuf`) the rest of the
//! server programs against, turning `Option<T>` CLI input into defaulted,
//! validated runtime state.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cli::Args;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub tls: Option<TlsConfig>,
    pub tcp_keepalive_period: Duration,
    pub brokers: Vec<String>,
    pub default_topic: String,
    pub store: Option<PathBuf>,
    pub token: Option<String>,
    pub http_bind: Option<SocketAddr>,
    pub http_token: Option<String>,
    pub allow_all_topics: bool,
    pub allowed_topics_file: Option<PathBuf>,
    pub parallel_indexers: usize,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

impl ServerConfig {
    /// Validates and fixes up the raw CLI args into a runtime config.
    /// Fails fast with a non-zero exit rather than deferring a malformed
    /// bind address or a half-specified TLS pair to first use.
    pub fn from_args(args: &Args) -> Result<Self> {
        let bind = args.bind.parse().with_context(|| format!("invalid --bind address {:?}", args.bind))?;

        let tls = match (&args.tls_key, &args.tls_cert) {
            (Some(key), Some(cert)) => Some(TlsConfig { key_path: PathBuf::from(key), cert_path: PathBuf::from(cert) }),
            (None, None) => None,
            _ => bail!("--tls-key and --tls-cert must be given together"),
        };

        let http_bind = args
            .http_bind
            .as_ref()
            .map(|a| a.parse().with_context(|| format!("invalid --http-bind address {a:?}")))
            .transpose()?;

        if args.parallel_indexers == 0 {
            bail!("--parallel-indexers must be at least 1");
        }

        Ok(Self {
            bind,
            tls,
            tcp_keepalive_period: Duration::from_secs(args.tcp_keepalive_period),
            brokers: args.brokers.clone(),
            default_topic: args.topic.clone(),
            store: args.store.as_ref().map(PathBuf::from),
            token: args.token.clone(),
            http_bind,
            http_token: args.http_token.clone(),
            allow_all_topics: args.allow_all_topics,
            allowed_topics_file: args.allowed_topics_file.as_ref().map(PathBuf::from),
            parallel_indexers: args.parallel_indexers,
        })
    }
}
