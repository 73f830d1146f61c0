#![no_main]

use bintensors::BinTensors;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = BinTensors::deserialize(data);
});
