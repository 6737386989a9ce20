//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Log hygiene helpers.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref IPV4_RE: Regex =
        Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("ipv4 regex");
    static ref IPV6_RE: Regex =
        Regex::new(r"\b([0-9a-fA-F]{1,4}:){2,7}[0-9a-fA-F]{0,4}\b").expect("ipv6 regex");
}

/// Scrubs addresses out of SDP and ICE candidate payloads before they
/// reach the logs.
pub fn redact_string(text: &str) -> String {
    let text = IPV4_RE.replace_all(text, "x.x.x.x");
    IPV6_RE.replace_all(&text, "x:x:x:x").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_ipv4() {
        let candidate = "candidate:1 1 udp 2122260223 192.168.1.17 49203 typ host";
        let redacted = redact_string(candidate);
        assert!(!redacted.contains("192.168.1.17"));
        assert!(redacted.contains("x.x.x.x"));
    }

    #[test]
    fn redacts_ipv6() {
        let redacted = redact_string("c=IN IP6 2001:db8:85a3::8a2e:370:7334");
        assert!(!redacted.contains("2001:db8"));
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(redact_string("no addresses here"), "no addresses here");
    }
}
