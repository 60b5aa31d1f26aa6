//! Fuzz target for message classification
//!
//! Arbitrary bytes must classify or be rejected with an error, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nrflow_traffic::{FiveTuple, classify};

fuzz_target!(|data: &[u8]| {
    let _ = classify(data);

    if let Some(tuple) = FiveTuple::parse(data) {
        // Keys are stable for the same packet
        assert_eq!(tuple.flow_key(), tuple.flow_key());
    }
});
