// ABOUTME: Endpoint descriptors: the parameters needed to open a transport, without interpretation
// ABOUTME: A descriptor is initialized once all mandatory parameters are set; workers refuse to open otherwise

use std::fmt;

/// Serial-line flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    #[default]
    None,
    RtsCts,
}

/// Identification of a transport endpoint and its parameters.
///
/// Descriptors are plain data: nothing is resolved or opened until the worker
/// receives an open command. The TCP and UDP ports are optional so that a
/// protocol layer can inject its well-known default (SCPI 5025, Modbus 502)
/// when the caller left it unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Tcp {
        host: String,
        port: Option<u16>,
    },
    Udp {
        host: String,
        port: Option<u16>,
    },
    Serial {
        path: String,
        baud_rate: Option<u32>,
        flow_control: FlowControl,
    },
}

impl Descriptor {
    /// A TCP endpoint with an explicit port.
    pub fn tcp(host: impl Into<String>, port: u16) -> Descriptor {
        Descriptor::Tcp {
            host: host.into(),
            port: Some(port),
        }
    }

    /// A TCP endpoint without a port; a protocol layer (or
    /// [`set_default_port`](crate::Adapter::set_default_port)) must supply
    /// one before the adapter can open.
    pub fn tcp_host(host: impl Into<String>) -> Descriptor {
        Descriptor::Tcp {
            host: host.into(),
            port: None,
        }
    }

    /// A UDP endpoint with an explicit port.
    pub fn udp(host: impl Into<String>, port: u16) -> Descriptor {
        Descriptor::Udp {
            host: host.into(),
            port: Some(port),
        }
    }

    /// A UDP endpoint without a port.
    pub fn udp_host(host: impl Into<String>) -> Descriptor {
        Descriptor::Udp {
            host: host.into(),
            port: None,
        }
    }

    /// A serial endpoint. Changing flow control on an open port requires a
    /// close and re-open cycle.
    pub fn serial(path: impl Into<String>, baud_rate: u32) -> Descriptor {
        Descriptor::Serial {
            path: path.into(),
            baud_rate: Some(baud_rate),
            flow_control: FlowControl::None,
        }
    }

    pub fn with_flow_control(mut self, flow: FlowControl) -> Descriptor {
        if let Descriptor::Serial { flow_control, .. } = &mut self {
            *flow_control = flow;
        }
        self
    }

    /// True when every mandatory parameter is set and the descriptor can be
    /// opened.
    pub fn is_initialized(&self) -> bool {
        match self {
            Descriptor::Tcp { host, port } | Descriptor::Udp { host, port } => {
                !host.is_empty() && port.is_some()
            }
            Descriptor::Serial {
                path, baud_rate, ..
            } => !path.is_empty() && baud_rate.is_some(),
        }
    }

    /// Fills in the port if the caller left it unset. No-op for serial
    /// descriptors and for descriptors that already carry a port.
    pub(crate) fn apply_default_port(&mut self, default: u16) {
        if let Descriptor::Tcp { port, .. } | Descriptor::Udp { port, .. } = self {
            if port.is_none() {
                *port = Some(default);
            }
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Tcp { host, port: Some(p) } => write!(f, "tcp://{host}:{p}"),
            Descriptor::Tcp { host, port: None } => write!(f, "tcp://{host}:?"),
            Descriptor::Udp { host, port: Some(p) } => write!(f, "udp://{host}:{p}"),
            Descriptor::Udp { host, port: None } => write!(f, "udp://{host}:?"),
            Descriptor::Serial {
                path,
                baud_rate: Some(b),
                ..
            } => write!(f, "serial://{path}@{b}"),
            Descriptor::Serial { path, .. } => write!(f, "serial://{path}@?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_gates_initialization() {
        let mut descriptor = Descriptor::tcp_host("192.168.1.26");
        assert!(!descriptor.is_initialized());

        descriptor.apply_default_port(5025);
        assert!(descriptor.is_initialized());
        assert_eq!(descriptor, Descriptor::tcp("192.168.1.26", 5025));
    }

    #[test]
    fn default_port_never_overrides() {
        let mut descriptor = Descriptor::tcp("10.0.0.5", 502);
        descriptor.apply_default_port(5025);
        assert_eq!(descriptor, Descriptor::tcp("10.0.0.5", 502));
    }

    #[test]
    fn serial_requires_baud_rate() {
        let descriptor = Descriptor::serial("/dev/ttyUSB0", 115_200);
        assert!(descriptor.is_initialized());
        assert_eq!(descriptor.to_string(), "serial:///dev/ttyUSB0@115200");
    }
}
