// Copyright 2025 the ltsm-remote authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! VNC authentication: DES-encrypted challenge/response.
//!
//! The VNC flavour of DES reverses the bit order within each key byte
//! before scheduling, takes only the first eight password characters (NUL
//! padded) and ECB-encrypts the 16-byte challenge as two blocks. The
//! server accepts when any line of the password file produces a matching
//! response.

use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;
use rand::RngCore;

use crate::error::{LtsmError, Result};

/// Generates a fresh 16-byte random challenge.
pub fn generate_challenge() -> [u8; 16] {
    let mut challenge = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Builds the DES key from a password: first 8 ASCII bytes, NUL padded,
/// each byte bit-reversed.
fn vnc_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (i, byte) in password.bytes().take(8).enumerate() {
        key[i] = byte.reverse_bits();
    }
    key
}

/// Encrypts a 16-byte challenge with the VNC DES key schedule. This is
/// exactly what a conforming client computes as its response.
pub fn encrypt_challenge(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let cipher = Des::new_from_slice(&vnc_key(password)).expect("DES key is always 8 bytes");
    let mut out = *challenge;
    let (block0, block1) = out.split_at_mut(8);
    cipher.encrypt_block(block0.into());
    cipher.encrypt_block(block1.into());
    out
}

/// Decrypts a 16-byte response back to the challenge.
pub fn decrypt_response(password: &str, response: &[u8; 16]) -> [u8; 16] {
    let cipher = Des::new_from_slice(&vnc_key(password)).expect("DES key is always 8 bytes");
    let mut out = *response;
    let (block0, block1) = out.split_at_mut(8);
    cipher.decrypt_block(block0.into());
    cipher.decrypt_block(block1.into());
    out
}

/// Checks a client response against every password in a newline-delimited
/// password file, accepting on any match.
pub fn verify_against_file(
    passwd_file: &std::path::Path,
    challenge: &[u8; 16],
    response: &[u8; 16],
) -> Result<bool> {
    let contents = std::fs::read_to_string(passwd_file).map_err(LtsmError::Io)?;
    Ok(contents
        .lines()
        .filter(|line| !line.is_empty())
        .any(|pass| &encrypt_challenge(pass, challenge) == response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_recovers_challenge() {
        let challenge = generate_challenge();
        let response = encrypt_challenge("sesame", &challenge);
        assert_ne!(challenge, response);
        assert_eq!(decrypt_response("sesame", &response), challenge);
    }

    #[test]
    fn key_uses_first_eight_chars_only() {
        let challenge = [0x42u8; 16];
        assert_eq!(
            encrypt_challenge("longpassword", &challenge),
            encrypt_challenge("longpass", &challenge)
        );
        assert_ne!(
            encrypt_challenge("longpass", &challenge),
            encrypt_challenge("short", &challenge)
        );
    }

    #[test]
    fn key_bytes_are_bit_reversed() {
        // 'a' = 0x61 -> reversed 0x86.
        assert_eq!(vnc_key("a")[0], 0x86);
        assert_eq!(vnc_key("a")[1], 0);
    }

    #[test]
    fn password_file_any_match() {
        let dir = std::env::temp_dir().join("ltsm-auth-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("passwd");
        std::fs::write(&path, "first\nsecond\nthird\n").unwrap();

        let challenge = generate_challenge();
        let response = encrypt_challenge("second", &challenge);
        assert!(verify_against_file(&path, &challenge, &response).unwrap());

        let wrong = encrypt_challenge("nowhere", &challenge);
        assert!(!verify_against_file(&path, &challenge, &wrong).unwrap());
        std::fs::remove_file(&path).unwrap();
    }
}
