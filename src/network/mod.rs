//! Reachability checks run before connecting to the broker.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

/// Answers "is the remote side reachable right now?".
pub trait Reachability: Send {
    /// Tries up to `max_attempts` times, sleeping `delay` between attempts.
    fn is_reachable(&self, max_attempts: u32, delay: Duration) -> bool;
}

/// Probe that opens (and immediately drops) a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// A probe of `host:port` giving up after `timeout`.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    fn probe_once(&self) -> bool {
        let addrs: Vec<SocketAddr> = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                debug!(host = %self.host, error = %e, "Could not resolve probe host");
                return false;
            }
        };
        addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.timeout).is_ok())
    }
}

impl Reachability for TcpProbe {
    fn is_reachable(&self, max_attempts: u32, delay: Duration) -> bool {
        info!(host = %self.host, port = self.port, "Check connection status");
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            if self.probe_once() {
                info!(host = %self.host, attempt, "Connection status: reachable");
                return true;
            }
            if attempt < attempts {
                std::thread::sleep(delay);
            }
        }
        info!(host = %self.host, "Connection status: unreachable");
        false
    }
}

/// Reachability that never blocks a connection attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

impl Reachability for AlwaysReachable {
    fn is_reachable(&self, _max_attempts: u32, _delay: Duration) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_millis(200));
        assert!(probe.is_reachable(1, Duration::ZERO));
    }

    #[test]
    fn closed_port_is_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_millis(200));
        assert!(!probe.is_reachable(2, Duration::from_millis(1)));
    }
}
