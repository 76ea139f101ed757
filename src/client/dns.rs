//! XMPP server resolution: login `host` parsing and SRV lookup.
//!
//! A login may name the server explicitly (`tls://host:port`, `tcp://host`,
//! `host:port`) or not at all, in which case the identity's domain is
//! resolved through `_xmpps-client` / `_xmpp-client` SRV records (RFC 6120)
//! with a `domain:5222` fallback. Candidates come back in attempt order.

use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Default port for STARTTLS connections.
pub const STARTTLS_PORT: u16 = 5222;

/// Default port for direct TLS connections (XEP-0368).
pub const DIRECT_TLS_PORT: u16 = 5223;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP upgraded with STARTTLS.
    Tcp,
    DirectTls,
}

/// A server address to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmppEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// XMPP domain for TLS SNI and the stream `to=`. With SRV the TCP target
    /// differs from the domain the certificate is issued for (RFC 6120 §13.7.2).
    pub domain: Option<String>,
}

impl XmppEndpoint {
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedServer {
    /// host, port, mode, optional `?domain=` override
    Direct(String, u16, ConnectionMode, Option<String>),
    /// Resolve through SRV.
    Domain(String),
}

/// Split an optional `?domain=` parameter off a `host[:port]` part.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (host_port, query.strip_prefix("domain=").map(str::to_string)),
        None => (input, None),
    }
}

fn split_port(host_port: &str) -> (&str, Option<u16>) {
    // rsplit keeps IPv6 literals intact
    match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (host_port, None),
        },
        None => (host_port, None),
    }
}

/// Parse a server string.
///
/// - `tls://host[:port][?domain=d]`: direct TLS, port 5223 by default
/// - `tcp://host[:port][?domain=d]`: STARTTLS, port 5222 by default
/// - `host:port`: port 5223 means direct TLS, anything else STARTTLS
/// - anything else is a domain for SRV resolution
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    let schemes = [
        ("tls://", ConnectionMode::DirectTls, DIRECT_TLS_PORT),
        ("tcp://", ConnectionMode::Tcp, STARTTLS_PORT),
    ];
    for (scheme, mode, default_port) in schemes {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            let (host_port, domain) = split_domain_param(rest);
            let (host, port) = split_port(host_port);
            return ParsedServer::Direct(host.to_string(), port.unwrap_or(default_port), mode, domain);
        }
    }

    if let (host, Some(port)) = split_port(trimmed) {
        let mode = if port == DIRECT_TLS_PORT {
            ConnectionMode::DirectTls
        } else {
            ConnectionMode::Tcp
        };
        return ParsedServer::Direct(host.to_string(), port, mode, None);
    }

    ParsedServer::Domain(trimmed.to_string())
}

/// Candidate endpoints for a login.
///
/// `server` is the login's explicit host, if any; `domain` is the identity's
/// domain and becomes the TLS name of explicit endpoints without `?domain=`.
pub async fn resolve_endpoints(server: Option<&str>, domain: &str) -> Vec<XmppEndpoint> {
    match server.map(parse_server_input) {
        Some(ParsedServer::Direct(host, port, mode, domain_param)) => {
            let endpoint = XmppEndpoint {
                host,
                port,
                mode,
                domain: domain_param.or_else(|| Some(domain.to_string())),
            };
            info!(host = %endpoint.host, port, mode = ?mode, tls_name = endpoint.tls_name(), "Using explicit endpoint");
            vec![endpoint]
        }
        Some(ParsedServer::Domain(server_domain)) => resolve_xmpp_server(&server_domain).await,
        None => resolve_xmpp_server(domain).await,
    }
}

fn system_resolver() -> TokioAsyncResolver {
    match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            warn!(error = %e, "Failed to load system DNS config, falling back to default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    }
}

/// Records for one SRV service, by priority ascending then weight descending
/// (RFC 2782). Targets of `.` mean the service is unavailable and are skipped.
async fn lookup_srv(
    resolver: &TokioAsyncResolver,
    service: &str,
    domain: &str,
    mode: ConnectionMode,
) -> Vec<XmppEndpoint> {
    let srv_name = format!("{}._tcp.{}", service, domain);
    let lookup = match resolver.srv_lookup(&srv_name).await {
        Ok(lookup) => lookup,
        Err(e) => {
            debug!(srv = %srv_name, error = %e, "SRV lookup failed");
            return Vec::new();
        }
    };

    let mut records: Vec<_> = lookup.iter().collect();
    records.sort_by(|a, b| a.priority().cmp(&b.priority()).then(b.weight().cmp(&a.weight())));
    records
        .into_iter()
        .filter_map(|r| {
            let target = r.target().to_string().trim_end_matches('.').to_string();
            if target.is_empty() {
                return None;
            }
            debug!(srv = %srv_name, host = %target, port = r.port(), priority = r.priority(), weight = r.weight(), "SRV record");
            Some(XmppEndpoint {
                host: target,
                port: r.port(),
                mode,
                domain: Some(domain.to_string()),
            })
        })
        .collect()
}

/// Resolve `domain` through SRV: direct TLS records first, then STARTTLS
/// records, then `domain:5222` if there are none at all.
pub async fn resolve_xmpp_server(domain: &str) -> Vec<XmppEndpoint> {
    let resolver = system_resolver();
    let mut endpoints =
        lookup_srv(&resolver, "_xmpps-client", domain, ConnectionMode::DirectTls).await;
    endpoints.extend(lookup_srv(&resolver, "_xmpp-client", domain, ConnectionMode::Tcp).await);

    if endpoints.is_empty() {
        info!(domain, "No SRV records found, falling back to {}:{}", domain, STARTTLS_PORT);
        endpoints.push(XmppEndpoint {
            host: domain.to_string(),
            port: STARTTLS_PORT,
            mode: ConnectionMode::Tcp,
            domain: None,
        });
    } else {
        info!(domain, total = endpoints.len(), "SRV resolution complete");
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(host: &str, port: u16, mode: ConnectionMode, domain: Option<&str>) -> ParsedServer {
        ParsedServer::Direct(host.to_string(), port, mode, domain.map(str::to_string))
    }

    #[test]
    fn test_parse_tls_uri() {
        assert_eq!(
            parse_server_input("tls://chat.example.com:5270"),
            direct("chat.example.com", 5270, ConnectionMode::DirectTls, None)
        );
        assert_eq!(
            parse_server_input("tls://chat.example.com"),
            direct("chat.example.com", 5223, ConnectionMode::DirectTls, None)
        );
    }

    #[test]
    fn test_parse_tcp_uri() {
        assert_eq!(
            parse_server_input("tcp://chat.example.com:5222"),
            direct("chat.example.com", 5222, ConnectionMode::Tcp, None)
        );
        assert_eq!(
            parse_server_input("tcp://chat.example.com"),
            direct("chat.example.com", 5222, ConnectionMode::Tcp, None)
        );
    }

    #[test]
    fn test_parse_host_port_mode_from_port() {
        assert_eq!(
            parse_server_input("chat.example.com:5223"),
            direct("chat.example.com", 5223, ConnectionMode::DirectTls, None)
        );
        assert_eq!(
            parse_server_input("chat.example.com:5280"),
            direct("chat.example.com", 5280, ConnectionMode::Tcp, None)
        );
    }

    #[test]
    fn test_parse_bare_domain() {
        assert_eq!(
            parse_server_input("  process-one.net  "),
            ParsedServer::Domain("process-one.net".to_string())
        );
    }

    #[test]
    fn test_parse_domain_param() {
        assert_eq!(
            parse_server_input("tls://v6.mdosch.de?domain=diebesban.de"),
            direct("v6.mdosch.de", 5223, ConnectionMode::DirectTls, Some("diebesban.de"))
        );
        assert_eq!(
            parse_server_input("tcp://v4.mdosch.de:5222?domain=diebesban.de"),
            direct("v4.mdosch.de", 5222, ConnectionMode::Tcp, Some("diebesban.de"))
        );
    }

    #[test]
    fn test_parse_ipv6_literal_with_port() {
        assert_eq!(
            parse_server_input("tcp://[::1]:5222"),
            direct("[::1]", 5222, ConnectionMode::Tcp, None)
        );
    }

    #[test]
    fn test_tls_name_prefers_domain() {
        let mut endpoint = XmppEndpoint {
            host: "v6.mdosch.de".to_string(),
            port: 5223,
            mode: ConnectionMode::DirectTls,
            domain: Some("diebesban.de".to_string()),
        };
        assert_eq!(endpoint.tls_name(), "diebesban.de");
        endpoint.domain = None;
        assert_eq!(endpoint.tls_name(), "v6.mdosch.de");
    }

    #[tokio::test]
    async fn test_explicit_endpoint_uses_login_domain_for_tls() {
        let endpoints = resolve_endpoints(Some("tls://127.0.0.1:5223"), "example.com").await;
        assert_eq!(
            endpoints,
            vec![XmppEndpoint {
                host: "127.0.0.1".to_string(),
                port: 5223,
                mode: ConnectionMode::DirectTls,
                domain: Some("example.com".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_resolve_nonexistent_domain_returns_fallback() {
        let endpoints =
            resolve_xmpp_server("this-domain-definitely-does-not-exist-xmpp-test.example").await;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].port, 5222);
        assert_eq!(endpoints[0].mode, ConnectionMode::Tcp);
        assert_eq!(endpoints[0].domain, None);
    }
}
