//! Fuzz test for endpoint file parsing
//!
//! Arbitrary file contents must never panic, and anything accepted must be
//! a usable endpoint that survives a write/parse cycle.

#![no_main]

use libfuzzer_sys::fuzz_target;
use savsend_core::Endpoint;

fuzz_target!(|data: &[u8]| {
    let Ok(contents) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(endpoint) = Endpoint::parse(contents) {
        assert!(!endpoint.host().is_empty());
        assert_ne!(endpoint.port(), 0);

        let rewritten = format!("{}\n{}\n", endpoint.host(), endpoint.port());
        let reparsed = Endpoint::parse(&rewritten).expect("rewritten endpoint parses");
        assert_eq!(reparsed, endpoint);
    }
});
