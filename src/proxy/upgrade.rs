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

use std::net::SocketAddr;

use http::{HeaderValue, Response, StatusCode, header};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use super::{Error, ResponseBody, empty_body};

/// Finishes a protocol switch the origin agreed to. The returned `101` is sent to the caller;
/// once both sides have upgraded, bytes are copied between them until either closes.
pub(super) fn switch_protocols(
    inbound: OnUpgrade,
    mut resp: Response<Incoming>,
    requested: &HeaderValue,
    peer: SocketAddr,
) -> Result<Response<ResponseBody>, Error> {
    let accepted = resp.headers().get(header::UPGRADE).cloned();
    let matches = accepted.as_ref().is_some_and(|accepted| {
        accepted
            .as_bytes()
            .eq_ignore_ascii_case(requested.as_bytes())
    });
    if !matches {
        return Err(Error::UpgradeMismatch(
            String::from_utf8_lossy(requested.as_bytes()).into_owned(),
            accepted
                .map(|a| String::from_utf8_lossy(a.as_bytes()).into_owned())
                .unwrap_or_default(),
        ));
    }

    let outbound = hyper::upgrade::on(&mut resp);
    tokio::spawn(async move {
        let (inbound, outbound) = match tokio::try_join!(inbound, outbound) {
            Ok(io) => io,
            Err(e) => {
                warn!(%peer, "protocol upgrade failed: {e}");
                return;
            }
        };
        let mut inbound = TokioIo::new(inbound);
        let mut outbound = TokioIo::new(outbound);
        match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
            Ok((sent, received)) => {
                debug!(%peer, sent, received, "upgraded connection closed")
            }
            Err(e) => debug!(%peer, "upgraded connection closed with error: {e}"),
        }
    });

    let (mut parts, _) = resp.into_parts();
    parts.status = StatusCode::SWITCHING_PROTOCOLS;
    Ok(Response::from_parts(parts, empty_body()))
}
