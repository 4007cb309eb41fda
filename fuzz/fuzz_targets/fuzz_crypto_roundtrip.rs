#![no_main]

use duramap_crypto::aes_cfb::{Crypter, BLOCK_LEN};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Need a 16-byte key, a 16-byte IV, and at least one byte of
    // plaintext to exercise anything interesting.
    const MIN_LEN: usize = BLOCK_LEN + BLOCK_LEN + 1;
    if data.len() < MIN_LEN {
        return;
    }

    let key = &data[0..BLOCK_LEN];
    let mut iv = [0u8; BLOCK_LEN];
    iv.copy_from_slice(&data[BLOCK_LEN..BLOCK_LEN * 2]);
    let plaintext = &data[BLOCK_LEN * 2..];

    let mut enc = Crypter::new(key, iv);
    let mut ciphertext = vec![0u8; plaintext.len()];
    enc.encrypt(plaintext, &mut ciphertext);

    let mut dec = Crypter::new(key, iv);
    let mut recovered = vec![0u8; plaintext.len()];
    dec.decrypt(&ciphertext, &mut recovered);
    assert_eq!(recovered, plaintext, "encrypt/decrypt round-trip must always hold");

    // Splitting the same stream at an arbitrary point and resuming via
    // `snapshot`/`clone_with` must agree with decrypting it whole.
    if plaintext.len() > 1 {
        let split = (key[0] as usize) % plaintext.len();
        let mut dec_prefix = Crypter::new(key, iv);
        let mut prefix_out = vec![0u8; split];
        dec_prefix.decrypt(&ciphertext[..split], &mut prefix_out);
        let snap = dec_prefix.snapshot();

        let mut resumed = dec_prefix.clone_with(snap);
        let mut tail_out = vec![0u8; ciphertext.len() - split];
        resumed.decrypt(&ciphertext[split..], &mut tail_out);

        assert_eq!(prefix_out, plaintext[..split]);
        assert_eq!(tail_out, plaintext[split..]);
    }
});
