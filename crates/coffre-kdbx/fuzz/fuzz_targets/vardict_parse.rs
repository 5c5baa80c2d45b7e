#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Some(dict) = coffre_crypto_core::VariantDict::parse(data) {
        // a parsed dictionary must re-serialize into a parseable form
        let bytes = dict.serialize();
        let reparsed = coffre_crypto_core::VariantDict::parse(&bytes);
        assert!(reparsed.is_some());
    }
});
