// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

const KEEPALIVE_TIME: Duration = Duration::from_secs(180);

/// Unmaps IPv4-mapped IPv6 addresses, so a dual-stack listener reports IPv4 peers as IPv4.
pub fn to_canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from((addr.ip().to_canonical(), addr.port()))
}

/// Prepares an accepted connection: disables Nagle and enables TCP keepalive so dead
/// peers are eventually noticed on idle keep-alive connections.
pub fn configure_accepted(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))
}
