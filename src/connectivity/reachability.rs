use std::net::{SocketAddr, UdpSocket};

/// Platform-level reachability primitive.
pub trait Reachability: Send + Sync {
  /// `Some(true)` when a network path exists, `Some(false)` when it does not,
  /// `None` when the platform cannot tell.
  fn sample(&self) -> Option<bool>;
}

/// Asks the OS routing table whether `probe` is routable.
///
/// Connecting a UDP socket only selects a route; nothing is transmitted.
pub struct RouteReachability {
  probe: SocketAddr,
}

impl RouteReachability {
  pub fn new(probe: SocketAddr) -> Self {
    Self { probe }
  }
}

impl Reachability for RouteReachability {
  fn sample(&self) -> Option<bool> {
    let bind: SocketAddr = if self.probe.is_ipv4() {
      SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
      SocketAddr::from(([0u16; 8], 0))
    };

    let socket = UdpSocket::bind(bind).ok()?;
    Some(socket.connect(self.probe).is_ok())
  }
}
