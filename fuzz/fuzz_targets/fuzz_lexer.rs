#![no_main]

use libfuzzer_sys::fuzz_target;
use lunac_compiler::lexer::tokenize;

fuzz_target!(|data: &[u8]| {
    // The lexer must never panic on any byte sequence — errors are fine,
    // panics are bugs.
    let _ = tokenize(data);
});
