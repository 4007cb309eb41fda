//! Streaming, resumable AES-128 CFB-128 encryption.
//!
//! The encrypted record stream is treated as one continuous CFB
//! keystream for the lifetime of a data file generation (it resets only
//! on a full rewrite, which installs a fresh IV). Values stored by
//! offset need to be decrypted starting mid-stream without replaying
//! every byte that precedes them, so the cipher state — the pending
//! keystream block and how many of its bytes are already consumed — is
//! exposed as a plain, copyable [`Snapshot`] that can seed a fresh
//! [`Crypter`] positioned at that exact point.
//!
//! This mirrors OpenSSL's `AES_cfb128_encrypt(in, out, len, key, ivec,
//! &num, enc)`, whose `ivec`/`num` pair is exactly our `register`/`pos`.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use zeroize::Zeroize;

/// AES-128 keys are 16 bytes; longer caller-supplied keys are truncated.
pub const KEY_LEN: usize = 16;
/// CFB-128 operates in 16-byte (one AES block) segments.
pub const BLOCK_LEN: usize = 16;

/// The cipher state at a specific position in the keystream: the
/// register (the ciphertext block the current keystream was derived
/// from) and how many of its 16 keystream bytes have already been
/// consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub pos: u8,
    pub register: [u8; BLOCK_LEN],
}

/// A streaming AES-128 CFB-128 encryptor/decryptor.
///
/// `encrypt` and `decrypt` each advance the same internal state; using
/// one `Crypter` for both directions on the same logical stream is not
/// supported — callers needing independent read/write streams should
/// construct two `Crypter`s (as the engine does for normal operation
/// versus offset-value decryption).
#[derive(Clone)]
pub struct Crypter {
    cipher: Aes128,
    register: [u8; BLOCK_LEN],
    keystream: [u8; BLOCK_LEN],
    /// Number of bytes of `keystream` already consumed, 0..=16.
    pos: u8,
}

impl Crypter {
    /// Builds a crypter from a key (truncated/zero-padded to 16 bytes)
    /// and a 16-byte IV.
    pub fn new(key: &[u8], iv: [u8; BLOCK_LEN]) -> Self {
        let mut key_block = [0u8; KEY_LEN];
        let n = key.len().min(KEY_LEN);
        key_block[..n].copy_from_slice(&key[..n]);
        let cipher = Aes128::new(GenericArray::from_slice(&key_block));
        key_block.zeroize();
        let keystream = Self::block_keystream(&cipher, &iv);
        Crypter {
            cipher,
            register: iv,
            keystream,
            pos: 0,
        }
    }

    /// Resets this crypter to the start of a fresh stream under `iv`,
    /// keeping the same key. Used at the start of every full rewrite.
    pub fn reset_iv(&mut self, iv: [u8; BLOCK_LEN]) {
        self.register = iv;
        self.keystream = Self::block_keystream(&self.cipher, &iv);
        self.pos = 0;
    }

    fn block_keystream(cipher: &Aes128, register: &[u8; BLOCK_LEN]) -> [u8; BLOCK_LEN] {
        let mut block = GenericArray::clone_from_slice(register);
        cipher.encrypt_block(&mut block);
        block.into()
    }

    /// Captures `(pos, register)` at the current stream position.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            pos: self.pos,
            register: self.register,
        }
    }

    /// Builds a new crypter sharing this one's key but positioned at
    /// `snapshot`'s mid-stream state — used to decrypt an offset-stored
    /// value without replaying the whole stream from byte zero.
    pub fn clone_with(&self, snapshot: Snapshot) -> Self {
        let keystream = Self::block_keystream(&self.cipher, &snapshot.register);
        Crypter {
            cipher: self.cipher.clone(),
            register: snapshot.register,
            keystream,
            pos: snapshot.pos,
        }
    }

    /// Given the ciphertext of a span of the stream starting at the
    /// stream's first keystream block (i.e. immediately after the IV
    /// was installed) and the already-known plaintext for that same
    /// span, computes the snapshot that was in effect `rollback` bytes
    /// before the end of the span — without needing a live `Crypter`
    /// positioned there, and without replaying the span from byte zero.
    ///
    /// Used to record a checkpoint for a value stored by offset when
    /// the ciphertext/plaintext pair for everything preceding it is
    /// already known (e.g. right after a full rewrite re-encrypted the
    /// whole record stream) — `rollback` is normally 0, positioning the
    /// snapshot exactly at the end of `ciphertext_ahead`.
    ///
    /// The target position (`ciphertext_ahead.len() - rollback`) must
    /// fall at or after the stream's second keystream block (i.e. be at
    /// least [`BLOCK_LEN`] bytes in); the first block's register is the
    /// IV, which this function is not given. Callers needing a snapshot
    /// inside the first block must derive it some other way (e.g. a
    /// fresh `Crypter` seeded with that IV).
    pub fn status_before_decrypt(
        ciphertext_ahead: &[u8],
        plaintext_ahead: &[u8],
        rollback: usize,
    ) -> Snapshot {
        debug_assert_eq!(ciphertext_ahead.len(), plaintext_ahead.len());
        let _ = plaintext_ahead;
        let target = ciphertext_ahead.len().saturating_sub(rollback);
        debug_assert!(target >= BLOCK_LEN, "target position falls in the first keystream block");
        let pos = (target % BLOCK_LEN) as u8;
        let block_start = target - pos as usize;
        let mut register = [0u8; BLOCK_LEN];
        register.copy_from_slice(&ciphertext_ahead[block_start - BLOCK_LEN..block_start]);
        Snapshot { pos, register }
    }

    /// Encrypts `input` into `output` (same length), advancing state by
    /// `input.len()` bytes.
    pub fn encrypt(&mut self, input: &[u8], output: &mut [u8]) {
        self.apply(input, output, true);
    }

    /// Decrypts `input` into `output` (same length), advancing state by
    /// `input.len()` bytes.
    pub fn decrypt(&mut self, input: &[u8], output: &mut [u8]) {
        self.apply(input, output, false);
    }

    fn apply(&mut self, input: &[u8], output: &mut [u8], encrypting: bool) {
        assert_eq!(input.len(), output.len());
        let mut idx = 0;
        while idx < input.len() {
            if self.pos as usize == BLOCK_LEN {
                self.keystream = Self::block_keystream(&self.cipher, &self.register);
                self.pos = 0;
            }
            let avail = BLOCK_LEN - self.pos as usize;
            let take = avail.min(input.len() - idx);
            for k in 0..take {
                let p = self.pos as usize + k;
                let cipher_byte;
                if encrypting {
                    let c = input[idx + k] ^ self.keystream[p];
                    output[idx + k] = c;
                    cipher_byte = c;
                } else {
                    let p_byte = input[idx + k] ^ self.keystream[p];
                    output[idx + k] = p_byte;
                    cipher_byte = input[idx + k];
                }
                self.register[p] = cipher_byte;
            }
            self.pos += take as u8;
            idx += take;
        }
    }
}

/// Fills `iv` from a non-cryptographic, clock-seeded PRNG.
///
/// Matches the source's IV generation, which is not claimed to be
/// cryptographically strong: see the design note on IV generation for
/// the tradeoff this inherits.
pub fn fill_random_iv(iv: &mut [u8; BLOCK_LEN]) {
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E37_79B9_7F4A_7C15);
    let mut state = seed ^ 0xA5A5_A5A5_A5A5_A5A5;
    if state == 0 {
        state = 0xD1B5_4A32_D192_ED03;
    }
    for byte in iv.iter_mut() {
        // xorshift64*
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        let out = state.wrapping_mul(0x2545_F491_4F6C_DD1D);
        *byte = (out >> 56) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let key = b"TheAESKey";
        let iv = [7u8; BLOCK_LEN];
        let plaintext = b"Hello, duramap::aes_cfb roundtrip test with AES CFB 128.";

        let mut enc = Crypter::new(key, iv);
        let mut ciphertext = vec![0u8; plaintext.len()];
        enc.encrypt(plaintext, &mut ciphertext);
        assert_ne!(ciphertext.as_slice(), plaintext.as_slice());

        let mut dec = Crypter::new(key, iv);
        let mut recovered = vec![0u8; plaintext.len()];
        dec.decrypt(&ciphertext, &mut recovered);
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn encrypt_in_small_chunks_matches_one_shot() {
        let key = b"anotherkey123456";
        let iv = [3u8; BLOCK_LEN];
        let plaintext: Vec<u8> = (0..200u32).map(|i| i as u8).collect();

        let mut whole = Crypter::new(key, iv);
        let mut whole_out = vec![0u8; plaintext.len()];
        whole.encrypt(&plaintext, &mut whole_out);

        let mut chunked = Crypter::new(key, iv);
        let mut chunked_out = vec![0u8; plaintext.len()];
        let mut offset = 0;
        for chunk in plaintext.chunks(7) {
            chunked.encrypt(chunk, &mut chunked_out[offset..offset + chunk.len()]);
            offset += chunk.len();
        }

        assert_eq!(whole_out, chunked_out);
    }

    #[test]
    fn snapshot_and_clone_with_resumes_mid_stream() {
        let key = b"TheAESKey";
        let iv = [9u8; BLOCK_LEN];
        let plaintext = b"0123456789abcdefghijklmnopqrstuvwxyz_tail_payload_after_offset";

        let mut enc = Crypter::new(key, iv);
        let mut ciphertext = vec![0u8; plaintext.len()];
        enc.encrypt(plaintext, &mut ciphertext);

        let split = 20;
        let mut dec_prefix = Crypter::new(key, iv);
        let mut discard = vec![0u8; split];
        dec_prefix.decrypt(&ciphertext[..split], &mut discard);
        let snap = dec_prefix.snapshot();

        let resumed = dec_prefix.clone_with(snap);
        let mut tail_out = vec![0u8; plaintext.len() - split];
        let mut resumed = resumed;
        resumed.decrypt(&ciphertext[split..], &mut tail_out);
        assert_eq!(tail_out, &plaintext[split..]);
    }

    #[test]
    fn status_before_decrypt_matches_a_live_snapshot_at_the_same_position() {
        let key = b"TheAESKey";
        let iv = [5u8; BLOCK_LEN];
        let plaintext: Vec<u8> = (0..150u32).map(|i| (i * 7) as u8).collect();

        let mut enc = Crypter::new(key, iv);
        let mut ciphertext = vec![0u8; plaintext.len()];
        enc.encrypt(&plaintext, &mut ciphertext);

        // Checkpoint at byte 64 (aligned) using a live crypter.
        let mut dec = Crypter::new(key, iv);
        let mut discard = vec![0u8; 64];
        dec.decrypt(&ciphertext[..64], &mut discard);
        let live_snapshot = dec.snapshot();

        // The same checkpoint, reconstructed after the fact from the
        // ciphertext/plaintext pair alone, with no live crypter.
        let reconstructed =
            Crypter::status_before_decrypt(&ciphertext[..64], &plaintext[..64], 0);
        assert_eq!(reconstructed, live_snapshot);

        // A non-zero rollback should land on the checkpoint that was in
        // effect that many bytes earlier.
        let rolled_back = Crypter::status_before_decrypt(&ciphertext[..80], &plaintext[..80], 16);
        assert_eq!(rolled_back, live_snapshot);
    }

    #[test]
    fn fill_random_iv_is_not_all_zero() {
        let mut iv = [0u8; BLOCK_LEN];
        fill_random_iv(&mut iv);
        assert_ne!(iv, [0u8; BLOCK_LEN]);
    }

    #[test]
    fn key_longer_than_block_is_truncated_not_rejected() {
        let short_key = b"0123456789abcdef";
        let long_key = b"0123456789abcdefEXTRA_IGNORED_BYTES";
        let iv = [1u8; BLOCK_LEN];
        let plaintext = b"same output regardless of trailing key bytes";

        let mut a = Crypter::new(short_key, iv);
        let mut b = Crypter::new(long_key, iv);
        let mut out_a = vec![0u8; plaintext.len()];
        let mut out_b = vec![0u8; plaintext.len()];
        a.encrypt(plaintext, &mut out_a);
        b.encrypt(plaintext, &mut out_b);
        assert_eq!(out_a, out_b);
    }
}
