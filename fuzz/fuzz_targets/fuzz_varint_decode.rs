#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Varint decoding must reject malformed/truncated input cleanly
    // rather than panic; a valid decode must report a consumed length
    // that never exceeds the input.
    if let Ok((value, consumed)) = duramap_storage::varint::read_varint32(data) {
        assert!(consumed <= data.len());
        assert!(consumed <= 5);
        assert_eq!(duramap_storage::varint::varint32_size(value) <= 5, true);
    }
    if let Ok((_value, consumed)) = duramap_storage::varint::read_varint64(data) {
        assert!(consumed <= data.len());
        assert!(consumed <= 10);
    }
    let _ = duramap_storage::varint::read_fixed32(data);
    let _ = duramap_storage::varint::read_fixed64(data);
});
