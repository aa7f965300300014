//! Instrument address parsing.
//!
//! Accepted forms, matching what existing configuration files contain:
//!
//! - `host` — default port, default device
//! - `host:port` — explicit TCP port
//! - `host/device` — named device endpoint
//! - `host:port/device` — both

use std::fmt;
use std::str::FromStr;

use labmon_core::{TransportError, TransportErrorKind};

/// Default TCP port for raw text-command instruments.
pub const DEFAULT_PORT: u16 = 5025;

/// Default device endpoint name.
pub const DEFAULT_DEVICE: &str = "inst0";

/// Parsed `host[:port][/device]` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentAddress {
    pub host: String,
    pub port: u16,
    pub device: String,
}

impl InstrumentAddress {
    /// Pool key: sessions are shared per `(host, device)` pair.
    pub fn session_key(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.device)
    }

    /// `host:port` pair for the socket connect.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for InstrumentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.device)
    }
}

impl FromStr for InstrumentAddress {
    type Err = TransportError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let address = address.trim();
        if address.is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::Unreachable,
                address,
                "empty instrument address",
            ));
        }

        let (host_port, device) = match address.split_once('/') {
            Some((hp, dev)) if !dev.is_empty() => (hp, dev.to_string()),
            Some((hp, _)) => (hp, DEFAULT_DEVICE.to_string()),
            None => (address, DEFAULT_DEVICE.to_string()),
        };

        let (host, port) = match host_port.split_once(':') {
            Some((h, p)) => {
                let port = p.parse::<u16>().map_err(|_| {
                    TransportError::new(
                        TransportErrorKind::Unreachable,
                        address,
                        format!("invalid port '{}'", p),
                    )
                })?;
                (h.to_string(), port)
            }
            None => (host_port.to_string(), DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::Unreachable,
                address,
                "empty host",
            ));
        }

        Ok(InstrumentAddress { host, port, device })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_host() {
        let addr: InstrumentAddress = "scope.lab".parse().unwrap();
        assert_eq!(addr.host, "scope.lab");
        assert_eq!(addr.port, DEFAULT_PORT);
        assert_eq!(addr.device, "inst0");
    }

    #[test]
    fn parses_host_with_device() {
        let addr: InstrumentAddress = "10.0.0.5/gpib0,9".parse().unwrap();
        assert_eq!(addr.host, "10.0.0.5");
        assert_eq!(addr.device, "gpib0,9");
    }

    #[test]
    fn parses_host_port_device() {
        let addr: InstrumentAddress = "psu.lab:9001/inst1".parse().unwrap();
        assert_eq!(addr.port, 9001);
        assert_eq!(addr.device, "inst1");
        assert_eq!(addr.socket_addr(), "psu.lab:9001");
        assert_eq!(addr.session_key(), "psu.lab:9001/inst1");
    }

    #[test]
    fn rejects_bad_port_and_empty_host() {
        assert!("host:notaport".parse::<InstrumentAddress>().is_err());
        assert!("".parse::<InstrumentAddress>().is_err());
        assert!(":5025".parse::<InstrumentAddress>().is_err());
    }
}
