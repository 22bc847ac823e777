//! Port and socket forwarding through the relay daemon.
//!
//! One relay runs on the host and one inside the guest; they talk over the
//! guest's second console. Each [`Forward`] names the side that listens,
//! what it listens on, and what the other side connects to.

use std::fmt;

use crate::error::{Error, Result};

/// Loopback address used on both sides for TCP forwards.
const LOOPBACK: &str = "127.0.0.1";

/// Directory holding X11 server sockets.
const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// First TCP port of X11 display `:0`.
const X11_TCP_BASE: u16 = 6000;

/// Which side of the console a relay instance runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Side {
    /// The host relay.
    Host,
    /// The guest relay.
    Guest,
}

impl Side {
    /// Relay argument naming this side.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Guest => "guest",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A socket address understood by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Endpoint {
    /// A TCP address.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port.
        port: u16,
    },
    /// A Unix domain socket path.
    Unix(String),
}

impl Endpoint {
    /// TCP on the loopback address.
    pub fn loopback(port: u16) -> Self {
        Self::Tcp {
            host: LOOPBACK.to_owned(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
            Self::Unix(path) => write!(f, "unix:{path}"),
        }
    }
}

/// One forwarded connection path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    /// Side accepting connections.
    pub listener: Side,
    /// Address accepted on.
    pub listen: Endpoint,
    /// Address the opposite side connects to.
    pub connect: Endpoint,
}

impl Forward {
    /// `H:G`: the host listens on port `H`, connections reach guest port `G`.
    pub fn parse_local(spec: &str) -> Result<Self> {
        let ports = split_ports(spec, 2)?;
        Ok(Self {
            listener: Side::Host,
            listen: Endpoint::loopback(port(spec, ports[0])?),
            connect: Endpoint::loopback(port(spec, ports[1])?),
        })
    }

    /// `G:A:P`: the guest listens on port `G`, connections reach `A:P` as
    /// seen from the host.
    pub fn parse_remote(spec: &str) -> Result<Self> {
        let parts = split_ports(spec, 3)?;
        if parts[1].is_empty() {
            return Err(invalid(spec, "empty address"));
        }
        Ok(Self {
            listener: Side::Guest,
            listen: Endpoint::loopback(port(spec, parts[0])?),
            connect: Endpoint::Tcp {
                host: parts[1].to_owned(),
                port: port(spec, parts[2])?,
            },
        })
    }

    /// X11: the guest serves display `:0`, connections reach the host
    /// display named by `display` (a `$DISPLAY` value).
    pub fn x11(display: &str) -> Result<Self> {
        let (host, rest) = display
            .rsplit_once(':')
            .ok_or_else(|| invalid(display, "DISPLAY has no display number"))?;
        let number = rest.split('.').next().unwrap_or(rest);
        let n: u16 = number
            .parse()
            .map_err(|_| invalid(display, "bad display number"))?;

        let connect = match host {
            "" | "unix" => Endpoint::Unix(format!("{X11_SOCKET_DIR}/X{n}")),
            host => Endpoint::Tcp {
                host: host.to_owned(),
                port: X11_TCP_BASE
                    .checked_add(n)
                    .ok_or_else(|| invalid(display, "display number out of range"))?,
            },
        };
        Ok(Self {
            listener: Side::Guest,
            listen: Endpoint::Unix(format!("{X11_SOCKET_DIR}/X0")),
            connect,
        })
    }

    /// Relay argument form: `<listener>:<listen>=<connect>`.
    pub fn to_arg(&self) -> String {
        format!("{}:{}={}", self.listener, self.listen, self.connect)
    }
}

/// Full argument list for a relay instance on `side`.
pub fn relay_args(side: Side, forwards: &[Forward]) -> Vec<String> {
    std::iter::once(side.as_str().to_owned())
        .chain(forwards.iter().map(Forward::to_arg))
        .collect()
}

/// Splits `spec` into exactly `n` colon-separated fields.
fn split_ports(spec: &str, n: usize) -> Result<Vec<&str>> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() == n {
        Ok(parts)
    } else {
        Err(invalid(spec, &format!("expected {n} colon-separated fields")))
    }
}

/// Parses a non-zero port number.
fn port(spec: &str, field: &str) -> Result<u16> {
    match field.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid(spec, &format!("bad port {field:?}"))),
        Ok(p) => Ok(p),
    }
}

/// Shorthand for [`Error::InvalidForward`].
fn invalid(spec: &str, reason: &str) -> Error {
    Error::InvalidForward {
        spec: spec.to_owned(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn local_forward() {
        let f = Forward::parse_local("8080:80").unwrap();
        assert_eq!(f.listener, Side::Host);
        assert_eq!(f.to_arg(), "host:tcp:127.0.0.1:8080=tcp:127.0.0.1:80");
    }

    #[test]
    fn remote_forward() {
        let f = Forward::parse_remote("5432:db.internal:5433").unwrap();
        assert_eq!(f.listener, Side::Guest);
        assert_eq!(f.to_arg(), "guest:tcp:127.0.0.1:5432=tcp:db.internal:5433");
    }

    #[rstest]
    #[case("8080")]
    #[case("8080:80:1")]
    #[case("x:80")]
    #[case("0:80")]
    #[case("8080:70000")]
    #[case("")]
    fn malformed_local(#[case] spec: &str) {
        assert!(matches!(
            Forward::parse_local(spec),
            Err(Error::InvalidForward { .. })
        ));
    }

    #[rstest]
    #[case("5432:db")]
    #[case("5432::5433")]
    #[case("a:db:5433")]
    #[case("5432:db:0")]
    fn malformed_remote(#[case] spec: &str) {
        assert!(Forward::parse_remote(spec).is_err());
    }

    #[rstest]
    #[case(":0", "unix:/tmp/.X11-unix/X0")]
    #[case(":1.0", "unix:/tmp/.X11-unix/X1")]
    #[case("unix:2", "unix:/tmp/.X11-unix/X2")]
    #[case("localhost:10.0", "tcp:localhost:6010")]
    fn x11_display(#[case] display: &str, #[case] connect: &str) {
        let f = Forward::x11(display).unwrap();
        assert_eq!(f.listener, Side::Guest);
        assert_eq!(f.listen, Endpoint::Unix("/tmp/.X11-unix/X0".into()));
        assert_eq!(f.connect.to_string(), connect);
    }

    #[rstest]
    #[case("")]
    #[case("nodisplay")]
    #[case(":x")]
    fn x11_rejects_bad_display(#[case] display: &str) {
        assert!(Forward::x11(display).is_err());
    }

    #[test]
    fn relay_argument_list() {
        let forwards = [
            Forward::parse_local("8080:80").unwrap(),
            Forward::x11(":0").unwrap(),
        ];
        assert_eq!(
            relay_args(Side::Guest, &forwards),
            [
                "guest",
                "host:tcp:127.0.0.1:8080=tcp:127.0.0.1:80",
                "guest:unix:/tmp/.X11-unix/X0=unix:/tmp/.X11-unix/X0",
            ]
        );
    }
}
