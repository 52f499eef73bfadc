//! Fuzz target for the request wire form.
//!
//! This tests that `Request::from_json` never panics, and that anything
//! it accepts re-serializes cleanly.

#![no_main]

use gridmesh::request::Request;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(request) = Request::from_json(data) {
        // Accepted requests must round-trip through the wire form
        let json = request.to_json().expect("accepted request must serialize");
        let _ = Request::from_json(&json).expect("serialized request must parse");
    }
});
