#![no_main]

use libfuzzer_sys::fuzz_target;

// The outer header parser consumes fully untrusted file bytes; any
// panic here is a bug.
fuzz_target!(|data: &[u8]| {
    let _ = coffre_kdbx::OuterHeader::read(data);
});
