#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // `decode_record`/`decode_map_greedy`/`decode_map_strict` must never
    // panic or read out of bounds on arbitrary bytes — this is exactly
    // the data an attacker-controlled or crash-corrupted data file would
    // feed the load path.
    let _ = duramap_storage::record::decode_record(data);
    let _ = duramap_storage::record::decode_map_greedy(data);
    let _ = duramap_storage::record::decode_map_strict(data);

    // Round-trip: encoding whatever greedy decode recovered must be
    // re-decodable to the same pairs.
    let decoded = duramap_storage::record::decode_map_greedy(data);
    let mut reencoded = Vec::new();
    duramap_storage::record::encode_map(
        decoded.iter().map(|(k, v)| (k.as_ref(), v.as_ref())),
        &mut reencoded,
    );
    let redecoded = duramap_storage::record::decode_map_greedy(&reencoded);
    assert_eq!(decoded.len(), redecoded.len());
});
