//! Connection URI grammar and environment overrides (spec.md §6).
//!
//! `<driver>[+<transport>]://[<user>@][<host>[:<port>]][/<path>][?<query>]`
//!
//! Grounded on `rpc_protocol::rpcbind::client::RpcbindServerAddress`, a
//! small enum dispatching to the right `std::net`/`std::os::unix::net`
//! constructor; generalized here to the full URI grammar and query
//! parameters this protocol needs.

use std::env;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tls,
    Tcp,
    Unix,
    Ssh,
    Ext,
}

impl TransportKind {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "tls" => Ok(TransportKind::Tls),
            "tcp" => Ok(TransportKind::Tcp),
            "unix" => Ok(TransportKind::Unix),
            "ssh" => Ok(TransportKind::Ssh),
            "ext" => Ok(TransportKind::Ext),
            other => Err(Error::configuration(format!("unknown transport {other:?}"))),
        }
    }
}

/// The parsed, validated form of a connection URI plus environment
/// overrides. Built once by `ConnectionFactory::open` and consumed by
/// `Transport` construction and the `Authenticator`.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub driver: String,
    pub transport: TransportKind,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,

    pub name_override: Option<String>,
    pub command: Option<String>,
    pub socket: Option<String>,
    pub netcat: Option<String>,
    pub auth: Option<String>,
    pub no_verify: bool,
    pub no_tty: bool,
    pub pkipath: Option<String>,
    pub debug: Option<String>,

    /// Any other query parameters, passed through verbatim to the server.
    pub extra: Vec<(String, String)>,

    pub autostart: bool,
    pub libvirtd_path: Option<String>,
}

impl ConnectConfig {
    /// Parse a URI string, then apply environment-variable overrides named
    /// in spec.md §6.
    pub fn parse(uri: &str) -> Result<Self> {
        let mut config = Self::parse_uri(uri)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn parse_uri(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::configuration(format!("{uri:?} is missing a scheme")))?;

        let (driver, transport_str) = match scheme.split_once('+') {
            Some((driver, transport)) => (driver.to_string(), Some(transport)),
            None => (scheme.to_string(), None),
        };

        let (authority_and_path, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        let (authority, path) = match authority_and_path.split_once('/') {
            Some((a, p)) => (a, Some(format!("/{p}"))),
            None => (authority_and_path, None),
        };

        let (user, host_port) = match authority.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, authority),
        };

        let (host, port) = if host_port.is_empty() {
            (None, None)
        } else {
            match host_port.rsplit_once(':') {
                Some((h, p)) => {
                    let port = p
                        .parse::<u16>()
                        .map_err(|_| Error::configuration(format!("invalid port {p:?}")))?;
                    (Some(h.to_string()), Some(port))
                }
                None => (Some(host_port.to_string()), None),
            }
        };

        let transport = match transport_str {
            Some(t) => TransportKind::parse(t)?,
            None => {
                if host.is_some() {
                    TransportKind::Tls
                } else {
                    TransportKind::Unix
                }
            }
        };

        let mut config = ConnectConfig {
            driver,
            transport,
            user,
            host,
            port,
            path,
            name_override: None,
            command: None,
            socket: None,
            netcat: None,
            auth: None,
            no_verify: false,
            no_tty: false,
            pkipath: None,
            debug: None,
            extra: Vec::new(),
            autostart: true,
            libvirtd_path: None,
        };

        if let Some(query) = query {
            for pair in query.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                config.apply_query_param(key, value);
            }
        }

        Ok(config)
    }

    fn apply_query_param(&mut self, key: &str, value: &str) {
        match key {
            "name" => self.name_override = Some(value.to_string()),
            "command" => self.command = Some(value.to_string()),
            "socket" => self.socket = Some(value.to_string()),
            "netcat" => self.netcat = Some(value.to_string()),
            "auth" => self.auth = Some(value.to_string()),
            "no_verify" => self.no_verify = value != "0" && !value.is_empty(),
            "no_tty" => self.no_tty = value != "0" && !value.is_empty(),
            "pkipath" => self.pkipath = Some(value.to_string()),
            "debug" => self.debug = Some(value.to_string()),
            other => self.extra.push((other.to_string(), value.to_string())),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = env::var("LIBVIRTD_PATH") {
            self.libvirtd_path = Some(path);
        }
        if let Ok(flag) = env::var("LIBVIRT_AUTOSTART") {
            self.autostart = flag != "0";
        }
        if let Ok(level) = env::var("LIBVIRT_GNUTLS_DEBUG") {
            if self.debug.is_none() {
                self.debug = Some(level);
            }
        }
    }

    /// Default CA/client cert/key paths, honoring `pkipath` if set (spec.md
    /// §6, "Default file locations").
    pub fn ca_cert_path(&self) -> Option<String> {
        self.pki_file("cacert.pem")
    }

    pub fn client_cert_path(&self) -> Option<String> {
        self.pki_file("clientcert.pem")
    }

    pub fn client_key_path(&self) -> Option<String> {
        self.pki_file("clientkey.pem")
    }

    fn pki_file(&self, name: &str) -> Option<String> {
        if let Some(dir) = &self.pkipath {
            return Some(format!("{dir}/{name}"));
        }
        let home = env::var("HOME").ok()?;
        Some(format!("{home}/.pki/libvirt/{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_unix_uri() {
        let c = ConnectConfig::parse("test:///default").unwrap();
        assert_eq!(c.driver, "test");
        assert_eq!(c.transport, TransportKind::Unix);
        assert_eq!(c.path.as_deref(), Some("/default"));
    }

    #[test]
    fn parses_tls_host_with_query_params() {
        let c = ConnectConfig::parse("qemu+tls://wrong-host/?no_verify=0").unwrap();
        assert_eq!(c.transport, TransportKind::Tls);
        assert_eq!(c.host.as_deref(), Some("wrong-host"));
        assert!(!c.no_verify);
    }

    #[test]
    fn parses_explicit_transport_user_and_port() {
        let c = ConnectConfig::parse("qemu+ssh://alice@host:2222/system?no_tty=1").unwrap();
        assert_eq!(c.transport, TransportKind::Ssh);
        assert_eq!(c.user.as_deref(), Some("alice"));
        assert_eq!(c.port, Some(2222));
        assert!(c.no_tty);
    }

    #[test]
    fn defaults_to_unix_when_host_is_empty() {
        let c = ConnectConfig::parse("qemu:///session").unwrap();
        assert_eq!(c.transport, TransportKind::Unix);
    }

    #[test]
    fn rejects_missing_scheme_separator() {
        assert!(ConnectConfig::parse("not-a-uri").is_err());
    }

    #[test]
    fn unknown_query_params_are_passed_through() {
        let c = ConnectConfig::parse("test:///default?foo=bar").unwrap();
        assert_eq!(c.extra, vec![("foo".to_string(), "bar".to_string())]);
    }
}
