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

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::identity::Identity;

pub const IDENTITY_ID: HeaderName = HeaderName::from_static("x-tailscale-id");
pub const IDENTITY_USERNAME: HeaderName = HeaderName::from_static("x-tailscale-username");
pub const IDENTITY_DISPLAY_NAME: HeaderName = HeaderName::from_static("x-tailscale-displayname");
pub const IDENTITY_NODE: HeaderName = HeaderName::from_static("x-tailscale-computed-node");

/// The identity headers, in the order they are injected.
pub const IDENTITY_HEADERS: [HeaderName; 4] = [
    IDENTITY_ID,
    IDENTITY_USERNAME,
    IDENTITY_DISPLAY_NAME,
    IDENTITY_NODE,
];

/// Appends the caller identity to `headers`.
///
/// Existing values, including caller supplied ones with the same names, are kept. When there
/// is no identity the headers are left untouched.
pub fn inject(headers: &mut HeaderMap, identity: Option<&Identity>) {
    let Some(id) = identity else {
        return;
    };
    let values = [
        &id.user_id,
        &id.login_name,
        &id.display_name,
        &id.node_name,
    ];
    for (name, value) in IDENTITY_HEADERS.into_iter().zip(values) {
        headers.append(name, header_value(value));
    }
}

// Identity fields are free-form UTF-8. Header values carry the raw bytes; control characters
// cannot be represented and are dropped.
fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_bytes(s.as_bytes()).unwrap_or_else(|_| {
        let cleaned: String = s
            .chars()
            .filter(|c| *c == '\t' || !c.is_control())
            .collect();
        HeaderValue::from_bytes(cleaned.as_bytes()).unwrap_or(HeaderValue::from_static(""))
    })
}
