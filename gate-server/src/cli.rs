//! Daemon command-line flags, parsed with `clap` derive into a plain
//! `Args` struct.

use clap::Parser;

#[derive(Debug, Parser, PartialEq)]
#[command(name = "gate-server", version, author, about = "KV sync gateway daemon")]
pub struct Args {
    /// Address the session server listens on, e.g. 0.0.0.0:9092.
    #[clap(long, default_value = "0.0.0.0:9092")]
    pub bind: String,

    /// PEM-encoded TLS private key. Enables TLS when paired with --tls-cert.
    #[clap(long)]
    pub tls_key: Option<String>,

    /// PEM-encoded TLS certificate. Enables TLS when paired with --tls-key.
    #[clap(long)]
    pub tls_cert: Option<String>,

    /// TCP keep-alive period, in seconds.
    #[clap(long, default_value_t = 30)]
    pub tcp_keepalive_period: u64,

    /// Comma-separated list of broker addresses.
    #[clap(long, value_delimiter = ',')]
    pub brokers: Vec<String>,

    /// Default topic used when a client's session header leaves `topic` empty.
    #[clap(long)]
    pub topic: String,

    /// Path to the on-disk index store. Omit to run with an in-memory index only.
    #[clap(long)]
    pub store: Option<String>,

    /// Required session auth token. Omit to accept any token.
    #[clap(long)]
    pub token: Option<String>,

    /// Address for the admin/observability HTTP surface (out of scope; accepted and logged).
    #[clap(long)]
    pub http_bind: Option<String>,

    /// Auth token for the admin HTTP surface (out of scope; accepted and logged).
    #[clap(long)]
    pub http_token: Option<String>,

    /// Allow any client-requested topic, bypassing the allow-list file.
    #[clap(long, default_value_t = false)]
    pub allow_all_topics: bool,

    /// Path to a newline-delimited topic allow-list (`#` comments, blank lines ignored).
    #[clap(long)]
    pub allowed_topics_file: Option<String>,

    /// Maximum number of indexers (initial catch-up + background re-index) running at once.
    #[clap(long, default_value_t = 4)]
    pub parallel_indexers: usize,

    #[clap(short, long, help = "debug mode")]
    pub debug: bool,

    #[clap(short = 'l', long, default_value = "info")]
    pub log_level: String,
}
