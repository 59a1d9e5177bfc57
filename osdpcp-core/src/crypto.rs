//! Block cipher and randomness used by the secure channel

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use rand::RngCore;
use rand::rngs::OsRng;

/// AES-128 block operations and a random source
///
/// The secure channel only ever needs single-block ECB operations; CBC and
/// MAC chaining are built on top of these.
pub trait Crypto: Send {
    /// Encrypt one 16-byte block in place
    fn aes_encrypt(&self, key: &[u8; 16], block: &mut [u8; 16]);

    /// Decrypt one 16-byte block in place
    fn aes_decrypt(&self, key: &[u8; 16], block: &mut [u8; 16]);

    /// Fill `buf` with random bytes
    fn random_bytes(&mut self, buf: &mut [u8]);
}

/// Default [`Crypto`] backed by the `aes` crate and the OS RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct AesCrypto;

impl Crypto for AesCrypto {
    fn aes_encrypt(&self, key: &[u8; 16], block: &mut [u8; 16]) {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    fn aes_decrypt(&self, key: &[u8; 16], block: &mut [u8; 16]) {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    fn random_bytes(&mut self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fips197_vector() {
        let key = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
            0x0E, 0x0F,
        ];
        let mut block = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ];
        let plain = block;

        AesCrypto.aes_encrypt(&key, &mut block);
        assert_eq!(hex::encode(block), "69c4e0d86a7b0430d8cdb78070b4c55a");

        AesCrypto.aes_decrypt(&key, &mut block);
        assert_eq!(block, plain);
    }

    #[test]
    fn test_random_bytes_fill() {
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        AesCrypto.random_bytes(&mut a);
        AesCrypto.random_bytes(&mut b);
        assert_ne!(a, b);
    }
}
