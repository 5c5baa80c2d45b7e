#![no_main]

use libfuzzer_sys::fuzz_target;

// Key files are user-supplied; every byte sequence must produce *some*
// key material without panicking.
fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let key = coffre_kdbx::KeyHelper::Kdbx2.process_key_file(data);
    assert!(!key.is_empty());
});
