//! Internet reachability through plain TCP connects to well-known hosts.

use log::debug;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{net::TcpStream, time::timeout};

pub const DEFAULT_HOSTS: [IpAddr; 4] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
    IpAddr::V4(Ipv4Addr::new(208, 67, 222, 222)),
];
pub const DEFAULT_PORT: u16 = 53;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct ReachabilityProbe {
    hosts: Vec<IpAddr>,
    port: u16,
    per_host_timeout: Duration,
}

impl Default for ReachabilityProbe {
    fn default() -> Self {
        Self::new(DEFAULT_HOSTS.to_vec(), DEFAULT_PORT, DEFAULT_TIMEOUT)
    }
}

impl ReachabilityProbe {
    pub fn new(hosts: Vec<IpAddr>, port: u16, per_host_timeout: Duration) -> Self {
        Self {
            hosts,
            port,
            per_host_timeout,
        }
    }

    /// Try the hosts in order; the first successful connect wins.
    pub async fn check(&self) -> bool {
        for host in &self.hosts {
            let addr = SocketAddr::new(*host, self.port);

            match timeout(self.per_host_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => {
                    debug!("reachability: {addr} reachable");
                    return true;
                }
                Ok(Err(e)) => debug!("reachability: {addr} failed: {e}"),
                Err(_) => debug!("reachability: {addr} timed out"),
            }
        }

        false
    }
}
