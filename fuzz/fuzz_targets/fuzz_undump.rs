#![no_main]

use libfuzzer_sys::fuzz_target;
use lunac_compiler::chunk::undump;
use lunac_core::string::StringInterner;

fuzz_target!(|data: &[u8]| {
    // Hostile binary chunks must be rejected, never crash the loader.
    let mut strings = StringInterner::new();
    let _ = undump(data, &mut strings);
});
