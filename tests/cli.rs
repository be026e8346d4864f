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

use std::net::TcpListener;
use std::process::{Command, Output};

use test_case::test_case;

fn tsproxy(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tsproxy"))
        .args(args)
        // Point at a socket that cannot exist, so nothing here reaches a real tailscaled.
        .env("TAILSCALE_SOCKET", "/nonexistent/tsproxy-test.sock")
        .env("ADMIN_ADDR", "")
        .output()
        .expect("tsproxy runs")
}

#[test_case(&[]; "no arguments")]
#[test_case(&["hello"]; "one argument")]
#[test_case(&["hello:80", "localhost:8080", "extra"]; "three arguments")]
#[test_case(&["hello:80", "ftp://localhost"]; "bad origin")]
#[test_case(&["--bogus"]; "unknown flag")]
fn test_bad_arguments_print_usage(args: &[&str]) {
    let out = tsproxy(args);
    assert_eq!(out.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        stdout.contains("Usage: tsproxy <from-endpoint> <to-endpoint>"),
        "{stdout}"
    );
    // Arguments are rejected before logging starts or anything is opened.
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.starts_with("error: "), "{stderr}");
    assert!(!stdout.contains("running with config"));
}

#[test]
fn test_bad_arguments_bind_nothing() {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let advertise = format!("hello:{port}");
    let out = tsproxy(&[&advertise, "localhost:8080", "extra"]);
    assert_eq!(out.status.code(), Some(1));
    TcpListener::bind(("127.0.0.1", port)).expect("advertise port is still free");
}

#[test]
fn test_help() {
    let out = tsproxy(&["--help"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Usage: tsproxy"));
}

#[test]
fn test_version() {
    let out = tsproxy(&["--version"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("version.BuildInfo"));
}

#[test]
fn test_startup_failure_exits_nonzero() {
    let out = tsproxy(&["hello:80", "localhost:8080"]);
    assert_eq!(out.status.code(), Some(1));
}
