/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! Crypto primitives over the RustCrypto stack.

use aes::Aes128;
use ccm::{
    aead::generic_array::GenericArray,
    consts::{U13, U16},
    Ccm,
};
use elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use hmac::Mac;
use log::error;
use p256::{
    ecdsa::{Signature, SigningKey, VerifyingKey},
    AffinePoint, EncodedPoint, PublicKey, SecretKey,
};
use sha2::Digest;

use crate::error::{Error, ErrorCode};
use crate::utils::rand::{Rand, RandRngCore};

pub const SYMM_KEY_LEN_BITS: usize = 128;
pub const SYMM_KEY_LEN_BYTES: usize = SYMM_KEY_LEN_BITS / 8;

pub const AEAD_MIC_LEN_BYTES: usize = 16;
pub const AEAD_NONCE_LEN_BYTES: usize = 13;

pub const SHA256_HASH_LEN_BYTES: usize = 256 / 8;

pub const EC_POINT_LEN_BYTES: usize = 65;
pub const EC_SIGNATURE_LEN_BYTES: usize = 64;
pub const ECDH_SHARED_SECRET_LEN_BYTES: usize = 32;
pub const BIGNUM_LEN_BYTES: usize = 32;

type HmacSha256I = hmac::Hmac<sha2::Sha256>;
type AesCcm = Ccm<Aes128, U16, U13>;

#[derive(Debug, Clone, Default)]
pub struct Sha256 {
    hasher: sha2::Sha256,
}

impl Sha256 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self, digest: &mut [u8]) -> Result<(), Error> {
        let output = self.hasher.finalize();
        digest
            .get_mut(..SHA256_HASH_LEN_BYTES)
            .ok_or(ErrorCode::NoSpace)?
            .copy_from_slice(output.as_slice());
        Ok(())
    }
}

pub struct HmacSha256 {
    inner: HmacSha256I,
}

impl HmacSha256 {
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            inner: HmacSha256I::new_from_slice(key).map_err(|e| {
                error!("Error creating HmacSha256 {:?}", e);
                ErrorCode::InvalidKeyLength
            })?,
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self, out: &mut [u8]) -> Result<(), Error> {
        let result = self.inner.finalize().into_bytes();
        out.get_mut(..result.len())
            .ok_or(ErrorCode::NoSpace)?
            .copy_from_slice(&result);
        Ok(())
    }
}

#[derive(Debug)]
enum KeyType {
    Private(SecretKey),
    Public(PublicKey),
}

/// A P-256 key, either a full key pair or a peer's public key.
#[derive(Debug)]
pub struct KeyPair {
    key: KeyType,
}

impl KeyPair {
    pub fn new(rand: Rand) -> Self {
        let mut rng = RandRngCore(rand);

        Self {
            key: KeyType::Private(SecretKey::random(&mut rng)),
        }
    }

    pub fn new_from_private(priv_key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            key: KeyType::Private(SecretKey::from_slice(priv_key)?),
        })
    }

    pub fn new_from_public(pub_key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            key: KeyType::Public(parse_public(pub_key)?),
        })
    }

    fn public_key_point(&self) -> AffinePoint {
        match &self.key {
            KeyType::Private(k) => *(k.public_key().as_affine()),
            KeyType::Public(k) => *(k.as_affine()),
        }
    }

    fn private_key(&self) -> Result<&SecretKey, Error> {
        match &self.key {
            KeyType::Private(key) => Ok(key),
            KeyType::Public(_) => Err(ErrorCode::Crypto.into()),
        }
    }

    pub fn get_private_key(&self, priv_key: &mut [u8]) -> Result<usize, Error> {
        let bytes = self.private_key()?.to_bytes();
        priv_key
            .get_mut(..bytes.len())
            .ok_or(ErrorCode::NoSpace)?
            .copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Writes the uncompressed SEC1 public key.
    pub fn get_public_key(&self, pub_key: &mut [u8]) -> Result<usize, Error> {
        let point = self.public_key_point().to_encoded_point(false);
        let bytes = point.as_bytes();
        pub_key
            .get_mut(..bytes.len())
            .ok_or(ErrorCode::NoSpace)?
            .copy_from_slice(bytes);
        Ok(bytes.len())
    }

    pub fn derive_secret(&self, peer_pub_key: &[u8], secret: &mut [u8]) -> Result<usize, Error> {
        let peer_pubkey = parse_public(peer_pub_key)?;
        let private_key = self.private_key()?;
        let shared_secret = elliptic_curve::ecdh::diffie_hellman(
            private_key.to_nonzero_scalar(),
            peer_pubkey.as_affine(),
        );
        let bytes = shared_secret.raw_secret_bytes();
        secret
            .get_mut(..bytes.len())
            .ok_or(ErrorCode::NoSpace)?
            .copy_from_slice(bytes);

        Ok(bytes.len())
    }

    /// Raw `r || s` ECDSA-SHA256 signature.
    pub fn sign_msg(&self, msg: &[u8], signature: &mut [u8]) -> Result<usize, Error> {
        use p256::ecdsa::signature::Signer;

        if signature.len() < EC_SIGNATURE_LEN_BYTES {
            Err(ErrorCode::NoSpace)?;
        }

        let signing_key = SigningKey::from(self.private_key()?);
        let sig: Signature = signing_key.sign(msg);
        let bytes = sig.to_bytes();
        signature[..bytes.len()].copy_from_slice(&bytes);

        Ok(bytes.len())
    }

    pub fn verify_msg(&self, msg: &[u8], signature: &[u8]) -> Result<(), Error> {
        use p256::ecdsa::signature::Verifier;

        let verifying_key = VerifyingKey::from_affine(self.public_key_point())?;
        let signature = Signature::try_from(signature)?;

        verifying_key
            .verify(msg, &signature)
            .map_err(|_| ErrorCode::InvalidSignature)?;

        Ok(())
    }
}

fn parse_public(pub_key: &[u8]) -> Result<PublicKey, Error> {
    let encoded_point = EncodedPoint::from_bytes(pub_key).map_err(|_| ErrorCode::Crypto)?;
    Option::from(PublicKey::from_encoded_point(&encoded_point))
        .ok_or_else(|| ErrorCode::Crypto.into())
}

pub fn pbkdf2_hmac(pass: &[u8], iter: u32, salt: &[u8], key: &mut [u8]) {
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(pass, salt, iter, key);
}

pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], key: &mut [u8]) -> Result<(), Error> {
    hkdf::Hkdf::<sha2::Sha256>::new(Some(salt), ikm)
        .expand(info, key)
        .map_err(|e| {
            error!("Error with hkdf_sha256 {:?}", e);
            ErrorCode::InvalidKeyLength.into()
        })
}

fn ccm_cipher(key: &[u8], nonce: &[u8]) -> Result<AesCcm, Error> {
    use ccm::KeyInit;

    if key.len() != SYMM_KEY_LEN_BYTES || nonce.len() != AEAD_NONCE_LEN_BYTES {
        Err(ErrorCode::InvalidKeyLength)?;
    }

    Ok(AesCcm::new(GenericArray::from_slice(key)))
}

/// Encrypts the first `data_len` bytes of `data` in place and appends the
/// MIC, returning the resulting length.
pub fn encrypt_in_place(
    key: &[u8],
    nonce: &[u8],
    ad: &[u8],
    data: &mut [u8],
    data_len: usize,
) -> Result<usize, Error> {
    use ccm::AeadInPlace;

    let cipher = ccm_cipher(key, nonce)?;
    let mut buffer = SliceBuffer::new(data, data_len);
    cipher.encrypt_in_place(GenericArray::from_slice(nonce), ad, &mut buffer)?;

    Ok(buffer.len())
}

/// Authenticates and decrypts `data` (ciphertext followed by MIC) in place,
/// returning the plaintext length.
pub fn decrypt_in_place(
    key: &[u8],
    nonce: &[u8],
    ad: &[u8],
    data: &mut [u8],
) -> Result<usize, Error> {
    use ccm::AeadInPlace;

    let cipher = ccm_cipher(key, nonce)?;
    let len = data.len();
    let mut buffer = SliceBuffer::new(data, len);
    cipher.decrypt_in_place(GenericArray::from_slice(nonce), ad, &mut buffer)?;

    Ok(buffer.len())
}

struct SliceBuffer<'a> {
    slice: &'a mut [u8],
    len: usize,
}

impl<'a> SliceBuffer<'a> {
    fn new(slice: &'a mut [u8], len: usize) -> Self {
        Self { slice, len }
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl AsMut<[u8]> for SliceBuffer<'_> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.slice[..self.len]
    }
}

impl AsRef<[u8]> for SliceBuffer<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.slice[..self.len]
    }
}

impl ccm::aead::Buffer for SliceBuffer<'_> {
    fn extend_from_slice(&mut self, slice: &[u8]) -> ccm::aead::Result<()> {
        if self.len + slice.len() > self.slice.len() {
            error!("Buffer overflow");
            Err(ccm::aead::Error)?;
        }

        self.slice[self.len..][..slice.len()].copy_from_slice(slice);
        self.len += slice.len();

        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        self.len = len;
    }
}
