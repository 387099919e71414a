//! RADIUS authenticator and attribute-encryption primitives (RFC 2865 §3,
//! §5.2, §5.69; RFC 2548 §2.4.1-2.4.3; RFC 2869 §5.14).
//!
//! Every function here is pure: it takes its inputs by reference and returns
//! a fresh value, so no hasher state ever crosses a task or thread boundary.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

use crate::error::Error;

type HmacMd5 = Hmac<Md5>;

/// Response Authenticator (RFC 2865 §3): `MD5(code + id + length +
/// request_authenticator + attributes + secret)`.
///
/// `reply` is a fully encoded reply packet whose authenticator field (bytes
/// 4..20) is ignored; `request_authenticator` is substituted in its place
/// for the hash input.
///
/// ```
/// use radsecproxy_codec::crypto::compute_response_authenticator;
///
/// let reply = [0x02u8, 0x05, 0x00, 0x14, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0];
/// let request_authenticator = [1u8; 16];
/// let digest = compute_response_authenticator(&reply, &request_authenticator, b"secret");
/// assert_eq!(digest.len(), 16);
/// ```
pub fn compute_response_authenticator(
    reply: &[u8],
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(&reply[0..4]);
    hasher.update(request_authenticator);
    hasher.update(&reply[20..]);
    hasher.update(secret);
    hasher.finalize().into()
}

/// Sign `reply` in place, writing a fresh Response Authenticator into bytes
/// 4..20.
pub fn sign_response(reply: &mut [u8], request_authenticator: &[u8; 16], secret: &[u8]) {
    let digest = compute_response_authenticator(reply, request_authenticator, secret);
    reply[4..20].copy_from_slice(&digest);
}

/// Verify that `reply`'s authenticator field matches the expected Response
/// Authenticator for `request_authenticator`/`secret`.
pub fn verify_response_authenticator(
    reply: &[u8],
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> bool {
    if reply.len() < 20 {
        return false;
    }

    let expected = compute_response_authenticator(reply, request_authenticator, secret);
    reply[4..20] == expected
}

/// Compute HMAC-MD5(secret, packet) with the 16-byte field at
/// `ma_value_offset` zeroed for the duration of the hash (RFC 2869 §5.14).
fn hmac_zeroing_field(buf: &[u8], ma_value_offset: usize, secret: &[u8]) -> Result<[u8; 16], Error> {
    if ma_value_offset + 16 > buf.len() {
        return Err(Error::BadAttribute(ma_value_offset));
    }

    let mut scratch = buf.to_vec();
    scratch[ma_value_offset..ma_value_offset + 16].fill(0);

    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC-MD5 accepts any key length");
    mac.update(&scratch);

    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Fill the Message-Authenticator value at `ma_value_offset` in place.
pub fn fill_message_authenticator(
    buf: &mut [u8],
    ma_value_offset: usize,
    secret: &[u8],
) -> Result<(), Error> {
    let digest = hmac_zeroing_field(buf, ma_value_offset, secret)?;
    buf[ma_value_offset..ma_value_offset + 16].copy_from_slice(&digest);
    Ok(())
}

/// Verify the Message-Authenticator value at `ma_value_offset`.
///
/// ```
/// use radsecproxy_codec::crypto::{fill_message_authenticator, verify_message_authenticator};
///
/// let mut buf = vec![0u8; 38];
/// buf[0] = 1;
/// buf[3] = 38;
/// let ma_offset = 20 + 2;
/// fill_message_authenticator(&mut buf, ma_offset, b"secret").unwrap();
/// assert!(verify_message_authenticator(&buf, ma_offset, b"secret").unwrap());
///
/// buf[10] ^= 0x01;
/// assert!(!verify_message_authenticator(&buf, ma_offset, b"secret").unwrap());
/// ```
pub fn verify_message_authenticator(
    buf: &[u8],
    ma_value_offset: usize,
    secret: &[u8],
) -> Result<bool, Error> {
    let expected = hmac_zeroing_field(buf, ma_value_offset, secret)?;
    Ok(buf[ma_value_offset..ma_value_offset + 16] == expected)
}

fn xor_into(dst: &mut [u8], hash: &[u8; 16]) {
    for (d, h) in dst.iter_mut().zip(hash.iter()) {
        *d ^= h;
    }
}

/// Encrypt or decrypt a User-Password/Tunnel-Password value (RFC 2865 §5.2,
/// RFC 2868 §3.5): `plaintext_block[0] = cipher_block[0] XOR MD5(secret ||
/// authenticator)`; each subsequent block XORs against `MD5(secret ||
/// previous_ciphertext_block)`. Encryption and decryption are the same
/// transform run over ciphertext-ordered chaining, so both directions share
/// this implementation; callers choose which buffer (plaintext or
/// ciphertext) supplies the "previous block" depending on direction.
///
/// `value.len()` must be a non-zero multiple of 16, capped at 128 bytes (the
/// RFC 2865 §5.2 limit).
fn crypt_chain(value: &mut [u8], secret: &[u8], authenticator: &[u8; 16], encrypting: bool) -> Result<(), Error> {
    if value.is_empty() || value.len() % 16 != 0 || value.len() > 128 {
        return Err(Error::InvalidLength(value.len()));
    }

    let mut salt = *authenticator;
    let mut offset = 0;

    while offset < value.len() {
        let mut hasher = Md5::new();
        hasher.update(secret);
        hasher.update(salt);
        let hash: [u8; 16] = hasher.finalize().into();

        let block = &mut value[offset..offset + 16];
        // The next block's chaining salt is always the ciphertext block,
        // independent of direction: capture it before XOR-ing in place when
        // decrypting (block currently holds ciphertext), or after when
        // encrypting (block will hold ciphertext once XOR-ed).
        let mut next_salt = [0u8; 16];
        if !encrypting {
            next_salt.copy_from_slice(block);
        }

        xor_into(block, &hash);

        if encrypting {
            next_salt.copy_from_slice(block);
        }

        salt = next_salt;
        offset += 16;
    }

    Ok(())
}

/// Decrypt a User-Password/Tunnel-Password attribute value in place.
///
/// ```
/// use radsecproxy_codec::crypto::{encrypt_password, decrypt_password};
///
/// let authenticator = [7u8; 16];
/// let mut value = *b"hunter22hunter22"; // 16 bytes, padded by caller
/// encrypt_password(&mut value, b"testing123", &authenticator).unwrap();
/// decrypt_password(&mut value, b"testing123", &authenticator).unwrap();
/// assert_eq!(&value, b"hunter22hunter22");
/// ```
pub fn decrypt_password(value: &mut [u8], secret: &[u8], authenticator: &[u8; 16]) -> Result<(), Error> {
    crypt_chain(value, secret, authenticator, false)
}

/// Encrypt a User-Password/Tunnel-Password attribute value in place.
pub fn encrypt_password(value: &mut [u8], secret: &[u8], authenticator: &[u8; 16]) -> Result<(), Error> {
    crypt_chain(value, secret, authenticator, true)
}

/// Decrypt an MS-MPPE-Send-Key/MS-MPPE-Recv-Key value (RFC 2548 §2.4.1-2.4.3):
/// like [`decrypt_password`], but the first block's hash input is `secret ||
/// authenticator || salt` where `salt` is the attribute's leading 2 bytes.
fn mppe_chain(value: &mut [u8], secret: &[u8], authenticator: &[u8; 16], salt: [u8; 2], encrypting: bool) -> Result<(), Error> {
    if value.is_empty() || value.len() % 16 != 0 {
        return Err(Error::InvalidLength(value.len()));
    }

    let mut hasher = Md5::new();
    hasher.update(secret);
    hasher.update(authenticator);
    hasher.update(salt);
    let mut hash: [u8; 16] = hasher.finalize().into();

    let mut offset = 0;
    while offset < value.len() {
        let block = &mut value[offset..offset + 16];

        let mut next_salt = [0u8; 16];
        if !encrypting {
            next_salt.copy_from_slice(block);
        }

        xor_into(block, &hash);

        if encrypting {
            next_salt.copy_from_slice(block);
        }

        offset += 16;
        if offset < value.len() {
            let mut hasher = Md5::new();
            hasher.update(secret);
            hasher.update(next_salt);
            hash = hasher.finalize().into();
        }
    }

    Ok(())
}

/// Decrypt an MS-MPPE-Send-Key/MS-MPPE-Recv-Key value in place.
///
/// ```
/// use radsecproxy_codec::crypto::{encrypt_mppe_key, decrypt_mppe_key};
///
/// let authenticator = [9u8; 16];
/// let salt = [0x80, 0x01];
/// let mut value = [0u8; 32];
/// value[0] = 16; // declared key length prefix byte, left untouched by the cipher
/// encrypt_mppe_key(&mut value, b"testing123", &authenticator, salt).unwrap();
/// decrypt_mppe_key(&mut value, b"testing123", &authenticator, salt).unwrap();
/// assert_eq!(value[0], 16);
/// ```
pub fn decrypt_mppe_key(value: &mut [u8], secret: &[u8], authenticator: &[u8; 16], salt: [u8; 2]) -> Result<(), Error> {
    mppe_chain(value, secret, authenticator, salt, false)
}

/// Encrypt an MS-MPPE-Send-Key/MS-MPPE-Recv-Key value in place.
pub fn encrypt_mppe_key(value: &mut [u8], secret: &[u8], authenticator: &[u8; 16], salt: [u8; 2]) -> Result<(), Error> {
    mppe_chain(value, secret, authenticator, salt, true)
}
