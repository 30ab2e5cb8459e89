//! Transport URI parsing.
//!
//! A context URI selects the transport by prefix:
//!
//! ```text
//! local:                          sysfs backend (external collaborator)
//! ip:[host][:port]                TCP, default port 30431, [..] for IPv6
//! usb:bus.dev.interface           USB bulk pair
//! serial:path[,baud[,bitsPSF]]    e.g. serial:/dev/ttyUSB0,115200,8n1n
//! ```
//!
//! Serial framing letters: parity `n o e m s`, stop bits `1 2`, flow
//! control `n x r d`.

use core::fmt;

use crate::error::{Error, Result};

/// IIOD's registered TCP port.
pub const DEFAULT_PORT: u16 = 30431;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    XonXoff,
    RtsCts,
    DtrDsr,
}

/// Serial line parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParams {
    pub baud: u32,
    pub bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub flow: FlowControl,
}

impl Default for SerialParams {
    fn default() -> Self {
        // 115200,8n1n
        Self {
            baud: 115_200,
            bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow: FlowControl::None,
        }
    }
}

/// Parsed transport URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Uri {
    Local,
    /// An empty host requests mDNS discovery.
    Ip {
        host: String,
        port: u16,
    },
    Usb {
        bus: u16,
        device: u16,
        interface: u16,
    },
    Serial {
        path: String,
        params: SerialParams,
    },
}

impl Uri {
    /// Parse a URI string. `default_baud` applies when a serial URI
    /// omits the baud rate.
    pub fn parse(s: &str, default_baud: u32) -> Result<Self> {
        if s == "local:" {
            return Ok(Self::Local);
        }
        if let Some(rest) = s.strip_prefix("ip:") {
            return parse_ip(rest);
        }
        if let Some(rest) = s.strip_prefix("usb:") {
            return parse_usb(rest);
        }
        if let Some(rest) = s.strip_prefix("serial:") {
            return parse_serial(rest, default_baud);
        }
        Err(Error::InvalidArg)
    }

    /// Context attributes describing this URI, in presentation order.
    pub fn context_attrs(&self) -> Vec<(String, String)> {
        let mut attrs = vec![("uri".to_owned(), self.to_string())];
        match self {
            Self::Ip { host, .. } if !host.is_empty() => {
                attrs.push(("ip,ip-addr".to_owned(), host.clone()));
            }
            Self::Serial { path, .. } => {
                attrs.push(("serial,port".to_owned(), path.clone()));
            }
            _ => {}
        }
        attrs
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local:"),
            Self::Ip { host, port } => {
                if host.contains(':') {
                    write!(f, "ip:[{host}]:{port}")
                } else {
                    write!(f, "ip:{host}:{port}")
                }
            }
            Self::Usb {
                bus,
                device,
                interface,
            } => write!(f, "usb:{bus}.{device}.{interface}"),
            Self::Serial { path, params } => {
                let parity = match params.parity {
                    Parity::None => 'n',
                    Parity::Odd => 'o',
                    Parity::Even => 'e',
                    Parity::Mark => 'm',
                    Parity::Space => 's',
                };
                let flow = match params.flow {
                    FlowControl::None => 'n',
                    FlowControl::XonXoff => 'x',
                    FlowControl::RtsCts => 'r',
                    FlowControl::DtrDsr => 'd',
                };
                write!(
                    f,
                    "serial:{path},{},{}{parity}{}{flow}",
                    params.baud, params.bits, params.stop_bits
                )
            }
        }
    }
}

fn parse_ip(rest: &str) -> Result<Uri> {
    if rest.is_empty() {
        return Ok(Uri::Ip {
            host: String::new(),
            port: DEFAULT_PORT,
        });
    }

    // Bracketed IPv6: ip:[::1] or ip:[::1]:1234
    if let Some(inner) = rest.strip_prefix('[') {
        let (host, tail) = inner.split_once(']').ok_or(Error::InvalidArg)?;
        let port = match tail {
            "" => DEFAULT_PORT,
            t => t
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .ok_or(Error::InvalidArg)?,
        };
        return Ok(Uri::Ip {
            host: host.to_owned(),
            port,
        });
    }

    // Unbracketed: a single ':' splits host from port; more than one
    // means a bare IPv6 address with the default port.
    match rest.split_once(':') {
        Some((host, port)) if !port.contains(':') => {
            let port = port.parse().map_err(|_| Error::InvalidArg)?;
            Ok(Uri::Ip {
                host: host.to_owned(),
                port,
            })
        }
        _ => Ok(Uri::Ip {
            host: rest.to_owned(),
            port: DEFAULT_PORT,
        }),
    }
}

fn parse_usb(rest: &str) -> Result<Uri> {
    let mut it = rest.split('.');
    let mut next = || -> Result<u16> {
        it.next()
            .and_then(|t| t.parse().ok())
            .ok_or(Error::InvalidArg)
    };
    let bus = next()?;
    let device = next()?;
    let interface = next()?;
    if it.next().is_some() {
        return Err(Error::InvalidArg);
    }
    Ok(Uri::Usb {
        bus,
        device,
        interface,
    })
}

fn parse_serial(rest: &str, default_baud: u32) -> Result<Uri> {
    let mut it = rest.split(',');
    let path = it.next().filter(|p| !p.is_empty()).ok_or(Error::InvalidArg)?;

    let mut params = SerialParams {
        baud: default_baud,
        ..SerialParams::default()
    };

    if let Some(baud) = it.next() {
        params.baud = baud.parse().map_err(|_| Error::InvalidArg)?;
    }
    if let Some(framing) = it.next() {
        parse_framing(framing, &mut params)?;
    }
    if it.next().is_some() {
        return Err(Error::InvalidArg);
    }

    Ok(Uri::Serial {
        path: path.to_owned(),
        params,
    })
}

/// Parse `bitsPSF`, e.g. `8n1n`. The flow letter may be omitted.
fn parse_framing(s: &str, params: &mut SerialParams) -> Result<()> {
    let mut chars = s.chars();

    params.bits = chars
        .next()
        .and_then(|c| c.to_digit(10))
        .map(|d| d as u8)
        .ok_or(Error::InvalidArg)?;

    params.parity = match chars.next() {
        Some('n') => Parity::None,
        Some('o') => Parity::Odd,
        Some('e') => Parity::Even,
        Some('m') => Parity::Mark,
        Some('s') => Parity::Space,
        _ => return Err(Error::InvalidArg),
    };

    params.stop_bits = match chars.next() {
        Some('1') => 1,
        Some('2') => 2,
        _ => return Err(Error::InvalidArg),
    };

    params.flow = match chars.next() {
        None => FlowControl::None,
        Some('n') => FlowControl::None,
        Some('x') => FlowControl::XonXoff,
        Some('r') => FlowControl::RtsCts,
        Some('d') => FlowControl::DtrDsr,
        Some(_) => return Err(Error::InvalidArg),
    };

    if chars.next().is_some() {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_forms() {
        assert_eq!(
            Uri::parse("ip:192.168.2.1", 0).unwrap(),
            Uri::Ip { host: "192.168.2.1".into(), port: DEFAULT_PORT }
        );
        assert_eq!(
            Uri::parse("ip:plutosdr.local:1234", 0).unwrap(),
            Uri::Ip { host: "plutosdr.local".into(), port: 1234 }
        );
        assert_eq!(
            Uri::parse("ip:", 0).unwrap(),
            Uri::Ip { host: String::new(), port: DEFAULT_PORT }
        );
    }

    #[test]
    fn ipv6_forms() {
        assert_eq!(
            Uri::parse("ip:[fe80::1]:1000", 0).unwrap(),
            Uri::Ip { host: "fe80::1".into(), port: 1000 }
        );
        assert_eq!(
            Uri::parse("ip:[fe80::1]", 0).unwrap(),
            Uri::Ip { host: "fe80::1".into(), port: DEFAULT_PORT }
        );
        // Bare IPv6 without brackets keeps the default port.
        assert_eq!(
            Uri::parse("ip:fe80::1", 0).unwrap(),
            Uri::Ip { host: "fe80::1".into(), port: DEFAULT_PORT }
        );
    }

    #[test]
    fn usb_form() {
        assert_eq!(
            Uri::parse("usb:3.10.4", 0).unwrap(),
            Uri::Usb { bus: 3, device: 10, interface: 4 }
        );
        assert!(Uri::parse("usb:3.10", 0).is_err());
        assert!(Uri::parse("usb:3.10.4.5", 0).is_err());
    }

    #[test]
    fn serial_forms() {
        let uri = Uri::parse("serial:/dev/ttyUSB0,57600,7e2x", 115_200).unwrap();
        assert_eq!(
            uri,
            Uri::Serial {
                path: "/dev/ttyUSB0".into(),
                params: SerialParams {
                    baud: 57_600,
                    bits: 7,
                    parity: Parity::Even,
                    stop_bits: 2,
                    flow: FlowControl::XonXoff,
                },
            }
        );

        // Defaults fill in missing segments.
        let uri = Uri::parse("serial:/dev/ttyACM0", 115_200).unwrap();
        assert_eq!(
            uri,
            Uri::Serial { path: "/dev/ttyACM0".into(), params: SerialParams::default() }
        );

        // Flow letter is optional.
        assert!(Uri::parse("serial:/dev/ttyUSB0,9600,8n1", 0).is_ok());
        assert!(Uri::parse("serial:/dev/ttyUSB0,9600,8q1n", 0).is_err());
        assert!(Uri::parse("serial:", 0).is_err());
    }

    #[test]
    fn unknown_prefix_rejected() {
        assert!(Uri::parse("xml:file.xml", 0).is_err());
        assert!(Uri::parse("192.168.2.1", 0).is_err());
    }

    #[test]
    fn display_round_trip() {
        for s in [
            "ip:host:30431",
            "ip:[fe80::1]:1000",
            "usb:1.2.3",
            "serial:/dev/ttyUSB0,115200,8n1n",
        ] {
            let uri = Uri::parse(s, 115_200).unwrap();
            assert_eq!(Uri::parse(&uri.to_string(), 115_200).unwrap(), uri);
        }
    }

    #[test]
    fn context_attrs_reflect_uri() {
        let uri = Uri::parse("ip:myhost", 0).unwrap();
        let attrs = uri.context_attrs();
        assert_eq!(attrs[0].0, "uri");
        assert_eq!(attrs[1], ("ip,ip-addr".into(), "myhost".into()));
    }
}
