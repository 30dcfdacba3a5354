//! Symmetric and RSA primitives used by the builder and the decryptor.
//!
//! Bulk data is CBC encrypted with the IV prepended and XML-Encryption
//! block padding: the last byte holds the pad length, the rest is random.

use crate::algorithm::{DataEncryption, SignatureAlgorithm};
use crate::error::CipherError;
use aes::{Aes128, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use des::TdesEde3;
use rand::RngCore;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

const TRIPLEDES_KEY_LEN: usize = 24;

/// Generate a fresh session key for `algorithm`.
pub fn generate_session_key(algorithm: DataEncryption) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; algorithm.key_len()]);
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Stretch or cut a session key to the 24 bytes TripleDES needs.
///
/// Short keys are extended by repeating their first 8 bytes, so a 16 byte
/// key becomes K1 K2 K1 and an 8 byte key becomes K1 K1 K1. Longer keys
/// are truncated.
pub fn normalize_tripledes_key(key: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(key.iter().copied().take(TRIPLEDES_KEY_LEN).collect::<Vec<u8>>());
    if key.is_empty() {
        return out;
    }
    let k1 = &key[..key.len().min(8)];
    while out.len() < TRIPLEDES_KEY_LEN {
        let missing = TRIPLEDES_KEY_LEN - out.len();
        out.extend_from_slice(&k1[..missing.min(k1.len())]);
    }
    out
}

/// Encrypt `plaintext`, returning IV followed by ciphertext.
pub fn encrypt(algorithm: DataEncryption, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    if key.len() != algorithm.key_len() {
        return Err(CipherError::InvalidKeyLength {
            expected: algorithm.key_len(),
            actual: key.len(),
        });
    }

    let block = algorithm.block_len();
    let mut rng = rand::thread_rng();

    let mut iv = vec![0u8; block];
    rng.fill_bytes(&mut iv);

    let pad_len = block - plaintext.len() % block;
    let mut buf = Vec::with_capacity(plaintext.len() + pad_len);
    buf.extend_from_slice(plaintext);
    let mut filler = vec![0u8; pad_len - 1];
    rng.fill_bytes(&mut filler);
    buf.extend_from_slice(&filler);
    buf.push(pad_len as u8);

    match algorithm {
        DataEncryption::TripleDesCbc => cbc_encrypt::<TdesEde3>(key, &iv, &mut buf)?,
        DataEncryption::Aes128Cbc => cbc_encrypt::<Aes128>(key, &iv, &mut buf)?,
        DataEncryption::Aes256Cbc => cbc_encrypt::<Aes256>(key, &iv, &mut buf)?,
    }

    let mut out = iv;
    out.extend_from_slice(&buf);
    Ok(out)
}

/// Decrypt IV-prefixed `data` and strip the block padding.
///
/// TripleDES keys are normalized to 24 bytes first; AES keys must match
/// the cipher's key size exactly.
pub fn decrypt(algorithm: DataEncryption, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError> {
    if key.is_empty() {
        return Err(CipherError::InvalidKeyLength {
            expected: algorithm.key_len(),
            actual: 0,
        });
    }
    let key = match algorithm {
        DataEncryption::TripleDesCbc => normalize_tripledes_key(key),
        _ if key.len() != algorithm.key_len() => {
            return Err(CipherError::InvalidKeyLength {
                expected: algorithm.key_len(),
                actual: key.len(),
            })
        }
        _ => Zeroizing::new(key.to_vec()),
    };

    let block = algorithm.block_len();
    if data.len() < 2 * block || data.len() % block != 0 {
        return Err(CipherError::InvalidCiphertext(format!(
            "{} bytes is not an IV plus whole {}-byte blocks",
            data.len(),
            block
        )));
    }

    let (iv, ciphertext) = data.split_at(block);
    let mut buf = ciphertext.to_vec();
    match algorithm {
        DataEncryption::TripleDesCbc => cbc_decrypt::<TdesEde3>(&key, iv, &mut buf)?,
        DataEncryption::Aes128Cbc => cbc_decrypt::<Aes128>(&key, iv, &mut buf)?,
        DataEncryption::Aes256Cbc => cbc_decrypt::<Aes256>(&key, iv, &mut buf)?,
    }

    let pad_len = buf.last().copied().unwrap_or(0) as usize;
    if pad_len == 0 || pad_len > block || pad_len > buf.len() {
        return Err(CipherError::InvalidPadding(format!("pad length {}", pad_len)));
    }
    buf.truncate(buf.len() - pad_len);
    Ok(buf)
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CipherError>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    let len = buf.len();
    cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength {
            expected: C::key_size(),
            actual: key.len(),
        })?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| CipherError::InvalidCiphertext("plaintext is not block aligned".to_string()))?;
    Ok(())
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CipherError>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength {
            expected: C::key_size(),
            actual: key.len(),
        })?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| CipherError::InvalidCiphertext("ciphertext is not block aligned".to_string()))?;
    Ok(())
}

/// Wrap a session key for the holder of `public_key` (rsa-1_5).
pub fn wrap_key(public_key: &RsaPublicKey, key: &[u8]) -> Result<Vec<u8>, CipherError> {
    public_key
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, key)
        .map_err(|e| CipherError::Rsa(e.to_string()))
}

/// Recover a session key wrapped with rsa-1_5.
pub fn unwrap_key(private_key: &RsaPrivateKey, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    private_key
        .decrypt(Pkcs1v15Encrypt, wrapped)
        .map(Zeroizing::new)
        .map_err(|e| CipherError::Rsa(e.to_string()))
}

/// RSA PKCS#1 v1.5 signature over `data`.
pub fn sign(
    private_key: &RsaPrivateKey,
    algorithm: SignatureAlgorithm,
    data: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let hashed = algorithm.digest(data);
    let scheme = match algorithm {
        SignatureAlgorithm::RsaSha1 => Pkcs1v15Sign::new::<Sha1>(),
        SignatureAlgorithm::RsaSha256 => Pkcs1v15Sign::new::<Sha256>(),
    };
    private_key
        .sign(scheme, &hashed)
        .map_err(|e| CipherError::Rsa(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::private_key_from_pem;

    const SERVER_KEY: &str = include_str!("../tests/fixtures/server-key.pem");
    const STRANGER_KEY: &str = include_str!("../tests/fixtures/stranger-key.pem");

    #[test]
    fn test_normalize_sixteen_byte_key_is_k1_k2_k1() {
        let key: Vec<u8> = (1..=16).collect();
        let normalized = normalize_tripledes_key(&key);
        assert_eq!(normalized.len(), 24);
        assert_eq!(&normalized[..16], &key[..]);
        assert_eq!(&normalized[16..], &key[..8]);
    }

    #[test]
    fn test_normalize_eight_byte_key_repeats() {
        let key = [7u8, 6, 5, 4, 3, 2, 1, 0];
        let normalized = normalize_tripledes_key(&key);
        assert_eq!(&normalized[..], &[key, key, key].concat()[..]);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let key = [0xAB; 12];
        assert_eq!(*normalize_tripledes_key(&key), *normalize_tripledes_key(&key));
        assert_eq!(normalize_tripledes_key(&key).len(), 24);
    }

    #[test]
    fn test_normalize_truncates_long_key() {
        let key: Vec<u8> = (0..32).collect();
        assert_eq!(&normalize_tripledes_key(&key)[..], &key[..24]);
    }

    #[test]
    fn test_encrypt_decrypt_each_cipher() {
        for alg in [
            DataEncryption::TripleDesCbc,
            DataEncryption::Aes128Cbc,
            DataEncryption::Aes256Cbc,
        ] {
            let key = generate_session_key(alg);
            let plaintext = b"<m:Declaration>TR-0001</m:Declaration>";
            let data = encrypt(alg, &key, plaintext).unwrap();
            assert_eq!(data.len() % alg.block_len(), 0);
            assert_eq!(decrypt(alg, &key, &data).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_block_aligned_plaintext_gets_full_pad_block() {
        let key = generate_session_key(DataEncryption::TripleDesCbc);
        let data = encrypt(DataEncryption::TripleDesCbc, &key, &[0u8; 16]).unwrap();
        // IV + 16 bytes + one full pad block
        assert_eq!(data.len(), 8 + 16 + 8);
    }

    #[test]
    fn test_decrypt_with_sixteen_byte_tripledes_key() {
        let short: Vec<u8> = (10..26).collect();
        let full = normalize_tripledes_key(&short);
        let data = encrypt(DataEncryption::TripleDesCbc, &full, b"payload").unwrap();
        assert_eq!(decrypt(DataEncryption::TripleDesCbc, &short, &data).unwrap(), b"payload");
    }

    #[test]
    fn test_decrypt_rejects_bad_lengths() {
        let key = generate_session_key(DataEncryption::Aes128Cbc);
        assert!(matches!(
            decrypt(DataEncryption::Aes128Cbc, &key, &[0u8; 20]),
            Err(CipherError::InvalidCiphertext(_))
        ));
        assert!(matches!(
            decrypt(DataEncryption::Aes256Cbc, &key, &[0u8; 32]),
            Err(CipherError::InvalidKeyLength { expected: 32, actual: 16 })
        ));
        assert!(matches!(
            decrypt(DataEncryption::TripleDesCbc, &[], &[0u8; 16]),
            Err(CipherError::InvalidKeyLength { .. })
        ));
    }

    #[test]
    fn test_wrap_unwrap_key() {
        let private_key = private_key_from_pem(SERVER_KEY).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let session = generate_session_key(DataEncryption::TripleDesCbc);
        let wrapped = wrap_key(&public_key, &session).unwrap();
        assert_eq!(*unwrap_key(&private_key, &wrapped).unwrap(), *session);
    }

    #[test]
    fn test_unwrap_with_wrong_key_fails() {
        let server = private_key_from_pem(SERVER_KEY).unwrap();
        let stranger = private_key_from_pem(STRANGER_KEY).unwrap();
        let wrapped = wrap_key(&RsaPublicKey::from(&server), &[1u8; 24]).unwrap();
        assert!(matches!(unwrap_key(&stranger, &wrapped), Err(CipherError::Rsa(_))));
    }

    #[test]
    fn test_sign_verifies_with_public_key() {
        let private_key = private_key_from_pem(SERVER_KEY).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let signature = sign(&private_key, SignatureAlgorithm::RsaSha1, b"signed info").unwrap();
        let hashed = SignatureAlgorithm::RsaSha1.digest(b"signed info");
        assert!(public_key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &hashed, &signature)
            .is_ok());
    }
}
