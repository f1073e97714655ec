#![no_main]

use libfuzzer_sys::fuzz_target;
use lunac_compiler::compile;

fuzz_target!(|data: &[u8]| {
    // The whole pipeline must never panic on any input.
    let _ = compile(data, "@fuzz");
});
