//! AES primitives backing the security engine's cipher runs.
//!
//! The engine hands this module a whole DMA buffer at a time: CBC chains the
//! run through a single IV, ECB transforms each 16-byte block independently.
//! The same direction flag that picks encrypt vs. decrypt also picks which
//! key schedule is derived, matching the register contract.

use aes::{Aes128, Aes192, Aes256};
use cipher::{
    block_padding::NoPadding, consts::U16, generic_array::GenericArray, BlockCipher, BlockDecrypt,
    BlockDecryptMut, BlockEncrypt, BlockEncryptMut, BlockSizeUser, KeyInit, KeyIvInit,
};

pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Ecb,
    Cbc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLength {
    Aes128,
    Aes192,
    Aes256,
}

impl KeyLength {
    pub fn key_bytes(self) -> usize {
        match self {
            KeyLength::Aes128 => 16,
            KeyLength::Aes192 => 24,
            KeyLength::Aes256 => 32,
        }
    }

    /// Value of the key-length selector field in `SECURE_INPUT_SELECT`.
    pub fn selector(self) -> u32 {
        match self {
            KeyLength::Aes128 => 0,
            KeyLength::Aes192 => 1,
            KeyLength::Aes256 => 2,
        }
    }
}

/// Transforms `data` in place. `data` must hold complete 16-byte blocks.
pub fn run(
    key: &[u8; 32],
    iv: &[u8; 16],
    key_len: KeyLength,
    chain: ChainMode,
    dir: Direction,
    data: &mut [u8],
) {
    assert_eq!(data.len() % AES_BLOCK_SIZE, 0);
    let key = &key[..key_len.key_bytes()];
    match key_len {
        KeyLength::Aes128 => run_with::<Aes128>(key, iv, chain, dir, data),
        KeyLength::Aes192 => run_with::<Aes192>(key, iv, chain, dir, data),
        KeyLength::Aes256 => run_with::<Aes256>(key, iv, chain, dir, data),
    }
}

fn run_with<C>(key: &[u8], iv: &[u8; 16], chain: ChainMode, dir: Direction, data: &mut [u8])
where
    C: BlockCipher + KeyInit + BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U16>,
{
    let key = GenericArray::from_slice(key);
    let iv = GenericArray::from_slice(iv);
    let len = data.len();
    match (chain, dir) {
        (ChainMode::Cbc, Direction::Encrypt) => {
            cbc::Encryptor::<C>::new(key, iv)
                .encrypt_padded_mut::<NoPadding>(data, len)
                .expect("buffer holds complete blocks");
        }
        (ChainMode::Cbc, Direction::Decrypt) => {
            cbc::Decryptor::<C>::new(key, iv)
                .decrypt_padded_mut::<NoPadding>(data)
                .expect("buffer holds complete blocks");
        }
        (ChainMode::Ecb, Direction::Encrypt) => {
            let cipher = C::new(key);
            for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                cipher.encrypt_block(GenericArray::from_mut_slice(block));
            }
        }
        (ChainMode::Ecb, Direction::Decrypt) => {
            let cipher = C::new(key);
            for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // FIPS-197 appendix C.1.
    const FIPS_KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];
    const FIPS_PLAINTEXT: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];
    const FIPS_CIPHERTEXT: [u8; 16] = [
        0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4, 0xc5,
        0x5a,
    ];

    fn widen_key(key: &[u8]) -> [u8; 32] {
        let mut full = [0u8; 32];
        full[..key.len()].copy_from_slice(key);
        full
    }

    #[test]
    fn aes128_ecb_matches_fips_vector() {
        let key = widen_key(&FIPS_KEY);
        let mut buf = FIPS_PLAINTEXT;
        run(
            &key,
            &[0u8; 16],
            KeyLength::Aes128,
            ChainMode::Ecb,
            Direction::Encrypt,
            &mut buf,
        );
        assert_eq!(buf, FIPS_CIPHERTEXT);

        run(
            &key,
            &[0u8; 16],
            KeyLength::Aes128,
            ChainMode::Ecb,
            Direction::Decrypt,
            &mut buf,
        );
        assert_eq!(buf, FIPS_PLAINTEXT);
    }

    #[test]
    fn aes128_cbc_matches_sp800_38a_vector() {
        // NIST SP 800-38A F.2.1, first block.
        let key = widen_key(&[
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ]);
        let iv = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ];
        let mut buf = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        run(
            &key,
            &iv,
            KeyLength::Aes128,
            ChainMode::Cbc,
            Direction::Encrypt,
            &mut buf,
        );
        assert_eq!(
            buf,
            [
                0x76, 0x49, 0xab, 0xac, 0x81, 0x19, 0xb2, 0x46, 0xce, 0xe9, 0x8e, 0x9b, 0x12,
                0xe9, 0x19, 0x7d,
            ]
        );
    }

    #[test]
    fn multi_block_cbc_round_trips_for_all_key_lengths() {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(37).wrapping_add(5);
        }
        let iv = [0xA5u8; 16];
        let plaintext: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(11)).collect();

        for key_len in [KeyLength::Aes128, KeyLength::Aes192, KeyLength::Aes256] {
            let mut buf = plaintext.clone();
            run(&key, &iv, key_len, ChainMode::Cbc, Direction::Encrypt, &mut buf);
            assert_ne!(buf, plaintext);
            run(&key, &iv, key_len, ChainMode::Cbc, Direction::Decrypt, &mut buf);
            assert_eq!(buf, plaintext);
        }
    }

    #[test]
    fn ecb_blocks_are_independent() {
        let key = widen_key(&FIPS_KEY);
        let mut buf = [0u8; 32];
        buf[..16].copy_from_slice(&FIPS_PLAINTEXT);
        buf[16..].copy_from_slice(&FIPS_PLAINTEXT);
        run(
            &key,
            &[0u8; 16],
            KeyLength::Aes128,
            ChainMode::Ecb,
            Direction::Encrypt,
            &mut buf,
        );
        assert_eq!(&buf[..16], &FIPS_CIPHERTEXT);
        assert_eq!(&buf[16..], &FIPS_CIPHERTEXT);
    }
}
