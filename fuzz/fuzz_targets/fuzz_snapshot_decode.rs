//! Fuzz target for the snapshot wire codec.
//!
//! This tests that `ConfigSnapshot::from_compressed_bytes` never panics
//! on arbitrary input, compressed or not.

#![no_main]

use gridmesh::snapshot::ConfigSnapshot;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Malformed buffers must come back as errors, never panics
    let _ = ConfigSnapshot::from_compressed_bytes(data);
});
