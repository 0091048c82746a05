//! Endpoint resolution
//!
//! Turns the positional command-line values into a `BindConfig`. Two forms
//! are accepted:
//!
//! - `<frontend-host> <frontend-port> <backend-host> <backend-port>`
//! - `<frontend-host> <backend-host>`, with both hosts required to be IPv4
//!   dotted quads and the ports taken from `BindDefaults`
//!
//! Ports are parsed here once; nothing downstream re-parses them.

use crate::utils::RelayError;

/// Fixed values the resolver falls back to. Created once at startup and
/// passed by reference instead of living in globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindDefaults {
    pub scheme: &'static str,
    pub address: &'static str,
    pub frontend_port: u16,
    pub backend_port: u16,
}

impl Default for BindDefaults {
    fn default() -> Self {
        Self {
            scheme: "tcp",
            address: "127.0.0.1",
            frontend_port: 5570,
            backend_port: 5571,
        }
    }
}

/// A host and numeric port one endpoint listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `scheme://host:port`, assembled by plain concatenation.
    pub fn url(&self, scheme: &str) -> String {
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Host handed to the socket layer; `*` means every IPv4 interface.
    pub fn bind_host(&self) -> &str {
        if self.host == "*" { "0.0.0.0" } else { self.host.as_str() }
    }
}

/// The two endpoints the relay binds, publisher-facing first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindConfig {
    pub scheme: String,
    pub frontend: Endpoint,
    pub backend: Endpoint,
}

impl BindConfig {
    pub fn frontend_url(&self) -> String {
        self.frontend.url(&self.scheme)
    }

    pub fn backend_url(&self) -> String {
        self.backend.url(&self.scheme)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        let defaults = BindDefaults::default();
        Self {
            scheme: defaults.scheme.to_string(),
            frontend: Endpoint::new(defaults.address, defaults.frontend_port),
            backend: Endpoint::new(defaults.address, defaults.backend_port),
        }
    }
}

/// Resolve positional arguments (program name excluded) into a `BindConfig`.
///
/// # Errors
///
/// `MissingArguments` for any count other than 2 or 4, `InvalidArguments`
/// for a non-IPv4 host in the two-value form or a port outside `0..=65535`.
pub fn resolve<S: AsRef<str>>(
    args: &[S],
    defaults: &BindDefaults,
) -> Result<BindConfig, RelayError> {
    match args {
        [frontend_host, frontend_port, backend_host, backend_port] => Ok(BindConfig {
            scheme: defaults.scheme.to_string(),
            frontend: Endpoint::new(
                frontend_host.as_ref(),
                parse_port(frontend_port.as_ref())?,
            ),
            backend: Endpoint::new(backend_host.as_ref(), parse_port(backend_port.as_ref())?),
        }),
        [frontend_host, backend_host] => {
            for host in [frontend_host.as_ref(), backend_host.as_ref()] {
                if !is_ipv4_address(host) {
                    return Err(RelayError::InvalidArguments(format!(
                        "'{host}' is not an IPv4 address"
                    )));
                }
            }
            Ok(BindConfig {
                scheme: defaults.scheme.to_string(),
                frontend: Endpoint::new(frontend_host.as_ref(), defaults.frontend_port),
                backend: Endpoint::new(backend_host.as_ref(), defaults.backend_port),
            })
        }
        _ => Err(RelayError::MissingArguments),
    }
}

fn parse_port(value: &str) -> Result<u16, RelayError> {
    value
        .parse::<u16>()
        .map_err(|_| RelayError::InvalidArguments(format!("'{value}' is not a valid port")))
}

/// Four dot-separated octets of one to three digits, each at most 255.
///
/// Leading zeros are accepted (`010.0.0.1`), unlike `Ipv4Addr::from_str`.
pub fn is_ipv4_address(value: &str) -> bool {
    let octets: Vec<&str> = value.split('.').collect();
    octets.len() == 4
        && octets.iter().all(|octet| {
            (1..=3).contains(&octet.len())
                && octet.bytes().all(|b| b.is_ascii_digit())
                && octet.parse::<u16>().is_ok_and(|n| n <= 255)
        })
}
