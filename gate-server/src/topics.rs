//! Topic allow-list policy: when the server isn't configured
//! to allow all topics, a client naming a non-default topic must appear in
//! a file, one topic per line, `#` introducing a comment and blank lines
//! ignored. A missing or unreadable file denies everything; with no file
//! configured at all, only the default topic is allowed.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::config::ServerConfig;

/// Loads and parses an allow-list file. Returns `None` (deny everything
/// non-default) if the file can't be read.
pub fn load_allowed_topics(path: &Path) -> Option<HashSet<String>> {
    let contents = fs::read_to_string(path).ok()?;
    Some(
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
    )
}

/// Decides whether `topic` may be used for this session. An empty `topic`
/// always resolves to the server's default and is always allowed.
pub fn is_topic_allowed(config: &ServerConfig, topic: &str) -> bool {
    if topic.is_empty() || topic == config.default_topic {
        return true;
    }
    if config.allow_all_topics {
        return true;
    }
    match &config.allowed_topics_file {
        None => false,
        Some(path) => match load_allowed_topics(path) {
            Some(allowed) => allowed.contains(topic),
            None => false,
        },
    }
}

/// Resolves the session header's requested topic to the topic actually
/// used: the server default when the client left it empty.
pub fn resolve_topic<'a>(config: &'a ServerConfig, requested: &'a str) -> &'a str {
    if requested.is_empty() {
        &config.default_topic
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_with(allow_all: bool, file: Option<&Path>) -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:9092".parse().unwrap(),
            tls: None,
            tcp_keepalive_period: std::time::Duration::from_secs(30),
            brokers: vec![],
            default_topic: "orders".into(),
            store: None,
            token: None,
            http_bind: None,
            http_token: None,
            allow_all_topics: allow_all,
            allowed_topics_file: file.map(Path::to_path_buf),
            parallel_indexers: 4,
        }
    }

    #[test]
    fn empty_topic_resolves_to_default_and_is_allowed() {
        let config = config_with(false, None);
        assert_eq!(resolve_topic(&config, ""), "orders");
        assert!(is_topic_allowed(&config, ""));
    }

    #[test]
    fn default_topic_is_always_allowed() {
        let config = config_with(false, None);
        assert!(is_topic_allowed(&config, "orders"));
    }

    #[test]
    fn non_default_topic_denied_with_no_file_and_no_allow_all() {
        let config = config_with(false, None);
        assert!(!is_topic_allowed(&config, "users"));
    }

    #[test]
    fn allow_all_topics_permits_anything() {
        let config = config_with(true, None);
        assert!(is_topic_allowed(&config, "whatever"));
    }

    #[test]
    fn allow_list_file_parses_comments_and_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "users").unwrap();
        writeln!(file, "  payments  ").unwrap();

        let config = config_with(false, Some(file.path()));
        assert!(is_topic_allowed(&config, "users"));
        assert!(is_topic_allowed(&config, "payments"));
        assert!(!is_topic_allowed(&config, "secrets"));
    }

    #[test]
    fn missing_allow_list_file_denies_everything_non_default() {
        let config = config_with(false, Some(Path::new("/nonexistent/allow.txt")));
        assert!(!is_topic_allowed(&config, "users"));
    }
}
