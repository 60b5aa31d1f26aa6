//! Fuzz test for configuration parsing
//!
//! Arbitrary TOML must deserialize or fail cleanly, and a config that
//! validates must produce a layout that computes without overflow.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nrflow_core::PipelineConfig;
use nrflow_core::layout::ArenaLayout;
use nrflow_traffic::{TrafficGenerator, TrafficMix};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(config) = toml::from_str::<PipelineConfig>(s) {
        if config.validate().is_ok() {
            let _ = ArenaLayout::compute(config.geometry());
        }
    }

    if let Ok(mix) = toml::from_str::<TrafficMix>(s) {
        let _ = TrafficGenerator::new(mix);
    }
});
