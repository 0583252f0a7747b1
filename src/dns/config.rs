//! name-server and hosts-file configuration
//!
//! Both files are plain text with `#` (and `;` for resolv.conf)
//! comments. Parsing is tolerant: unusable lines are logged and
//! skipped, and only a file that yields no name server at all is an
//! error.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::dns::resolver::ResolveError;

/// Port DNS queries are sent to unless the config names another.
pub const DNS_PORT: u16 = 53;

/// Where the resolver finds its configuration files.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub resolv_path: PathBuf,
    pub hosts_path: PathBuf,
}

impl Default for ResolverOptions {
    #[cfg(unix)]
    fn default() -> ResolverOptions {
        ResolverOptions {
            resolv_path: PathBuf::from("/etc/resolv.conf"),
            hosts_path: PathBuf::from("/etc/hosts"),
        }
    }

    #[cfg(windows)]
    fn default() -> ResolverOptions {
        let etc = PathBuf::from(r"C:\Windows\System32\drivers\etc");
        ResolverOptions {
            resolv_path: etc.join("resolv.conf"),
            hosts_path: etc.join("hosts"),
        }
    }
}

fn strip_comment<'a>(line: &'a str, markers: &[char]) -> &'a str {
    match line.find(|c| markers.contains(&c)) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Parses `nameserver <IP>` lines into endpoints on [`DNS_PORT`].
pub(crate) fn parse_resolv(text: &str) -> Result<Vec<SocketAddr>, ResolveError> {
    let mut servers = Vec::new();
    for line in text.lines() {
        let line = strip_comment(line, &['#', ';']).trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("nameserver") => match parts.next().map(str::parse::<IpAddr>) {
                Some(Ok(addr)) => servers.push(SocketAddr::new(addr, DNS_PORT)),
                _ => log::warn!("skipping unparsable nameserver line: {:?}", line),
            },
            // search, options, sortlist and friends
            Some(_) => {}
            None => {}
        }
    }
    if servers.is_empty() {
        return Err(ResolveError::InvalidResolvConfig);
    }
    Ok(servers)
}

/// Parses hosts-file lines (`<IP> <name>...`) into a lookup map. The
/// first mapping for a name wins, matching system resolver behavior.
pub(crate) fn parse_hosts(text: &str) -> HashMap<String, IpAddr> {
    let mut hosts = HashMap::new();
    for line in text.lines() {
        let line = strip_comment(line, &['#']).trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let addr = match parts.next().map(str::parse::<IpAddr>) {
            Some(Ok(addr)) => addr,
            _ => {
                log::warn!("skipping unparsable hosts line: {:?}", line);
                continue;
            }
        };
        for name in parts {
            hosts
                .entry(name.to_ascii_lowercase())
                .or_insert(addr);
        }
    }
    hosts
}
