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

//! SPAKE2+ over P-256, as used by PASE.
//!
//! The prover is the commissioner, who knows the passcode. The verifier is
//! the device, which only needs `w0` and `L = w1 * P`. In the verifier role
//! the shared key is not released until the prover's confirmation `cA`
//! checks out.

use num::BigUint;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::{Field, PrimeField};
use p256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use subtle::ConstantTimeEq;

use crate::crypto::{self, pbkdf2_hmac, HmacSha256, Sha256};
use crate::error::*;
use crate::utils::rand::{Rand, RandRngCore};

pub const SPAKE2_ITERATION_COUNT: u32 = 2000;
pub const MIN_SALT_SIZE_BYTES: usize = 16;
pub const MAX_SALT_SIZE_BYTES: usize = 32;

const SPAKE2P_KEY_CONFIRM_INFO: &[u8] = b"ConfirmationKeys";
const SPAKE2P_CONTEXT_PREFIX: &[u8] = b"CHIP PAKE V1 Commissioning";
const CRYPTO_GROUP_SIZE_BYTES: usize = 32;
const CRYPTO_W_SIZE_BYTES: usize = CRYPTO_GROUP_SIZE_BYTES + 8;
pub const CRYPTO_PUBLIC_KEY_SIZE_BYTES: usize = (2 * CRYPTO_GROUP_SIZE_BYTES) + 1;
pub const CONFIRMATION_SIZE_BYTES: usize = 32;
pub const KE_SIZE_BYTES: usize = 16;

pub const VERIFIER_SIZE_BYTES: usize = CRYPTO_GROUP_SIZE_BYTES + CRYPTO_PUBLIC_KEY_SIZE_BYTES;

const MATTER_M_BIN: [u8; 65] = [
    0x04, 0x88, 0x6e, 0x2f, 0x97, 0xac, 0xe4, 0x6e, 0x55, 0xba, 0x9d, 0xd7, 0x24, 0x25, 0x79, 0xf2,
    0x99, 0x3b, 0x64, 0xe1, 0x6e, 0xf3, 0xdc, 0xab, 0x95, 0xaf, 0xd4, 0x97, 0x33, 0x3d, 0x8f, 0xa1,
    0x2f, 0x5f, 0xf3, 0x55, 0x16, 0x3e, 0x43, 0xce, 0x22, 0x4e, 0x0b, 0x0e, 0x65, 0xff, 0x02, 0xac,
    0x8e, 0x5c, 0x7b, 0xe0, 0x94, 0x19, 0xc7, 0x85, 0xe0, 0xca, 0x54, 0x7d, 0x55, 0xa1, 0x2e, 0x2d,
    0x20,
];
const MATTER_N_BIN: [u8; 65] = [
    0x04, 0xd8, 0xbb, 0xd6, 0xc6, 0x39, 0xc6, 0x29, 0x37, 0xb0, 0x4d, 0x99, 0x7f, 0x38, 0xc3, 0x77,
    0x07, 0x19, 0xc6, 0x29, 0xd7, 0x01, 0x4d, 0x49, 0xa2, 0x4b, 0x4f, 0x98, 0xba, 0xa1, 0x29, 0x2b,
    0x49, 0x07, 0xd6, 0x0a, 0xa6, 0xbf, 0xad, 0xe4, 0x50, 0x08, 0xa6, 0x36, 0x33, 0x7f, 0x51, 0x68,
    0xc6, 0x4d, 0x9b, 0xd3, 0x60, 0x34, 0x80, 0x8c, 0xd5, 0x64, 0x49, 0x0b, 0x1e, 0x65, 0x6e, 0xdb,
    0xe7,
];

// Order of the P-256 group
const P256_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xbc, 0xe6, 0xfa, 0xad, 0xa7, 0x17, 0x9e, 0x84, 0xf3, 0xb9, 0xca, 0xc2, 0xfc, 0x63, 0x25, 0x51,
];

/// What the device keeps to answer PASE: either the passcode itself or a
/// precomputed `w0 || L` verifier, plus the PBKDF2 parameters.
#[derive(Debug, Clone)]
pub struct VerifierData {
    pub password: Option<u32>,
    verifier: [u8; VERIFIER_SIZE_BYTES],
    salt: heapless::Vec<u8, MAX_SALT_SIZE_BYTES>,
    count: u32,
}

impl VerifierData {
    pub fn new_with_pw(password: u32, rand: Rand) -> Self {
        let mut salt = [0; MAX_SALT_SIZE_BYTES];
        rand(&mut salt);

        Self {
            password: Some(password),
            verifier: [0; VERIFIER_SIZE_BYTES],
            salt: heapless::Vec::from_slice(&salt).unwrap_or_default(),
            count: SPAKE2_ITERATION_COUNT,
        }
    }

    pub fn new(verifier: &[u8], salt: &[u8], count: u32) -> Result<Self, Error> {
        if verifier.len() != VERIFIER_SIZE_BYTES
            || salt.len() < MIN_SALT_SIZE_BYTES
            || salt.len() > MAX_SALT_SIZE_BYTES
        {
            Err(ErrorCode::InvalidData)?;
        }

        let mut data = Self {
            password: None,
            verifier: [0; VERIFIER_SIZE_BYTES],
            salt: heapless::Vec::from_slice(salt).map_err(|_| ErrorCode::InvalidData)?,
            count,
        };
        data.verifier.copy_from_slice(verifier);

        Ok(data)
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    #[allow(non_snake_case)]
    fn w0_and_L(&self) -> Result<(Scalar, ProjectivePoint), Error> {
        match self.password {
            Some(pw) => {
                let (w0, w1) = compute_w0w1(pw, self.count, &self.salt)?;
                Ok((w0, ProjectivePoint::GENERATOR * w1))
            }
            None => {
                let w0 = scalar_from_bytes(&self.verifier[..CRYPTO_GROUP_SIZE_BYTES])?;
                let L = point_from_bytes(&self.verifier[CRYPTO_GROUP_SIZE_BYTES..])?;
                Ok((w0, L))
            }
        }
    }
}

fn get_w0w1s(pw: u32, iter: u32, salt: &[u8], w0w1s: &mut [u8]) {
    pbkdf2_hmac(&pw.to_le_bytes(), iter, salt, w0w1s);
}

/// `ws mod n`, for the 40 byte halves of the PBKDF2 output.
fn reduce(ws: &[u8]) -> Result<Scalar, Error> {
    let order = BigUint::from_bytes_be(&P256_ORDER);
    let reduced = (BigUint::from_bytes_be(ws) % order).to_bytes_be();

    let mut bytes = [0; CRYPTO_GROUP_SIZE_BYTES];
    bytes[CRYPTO_GROUP_SIZE_BYTES - reduced.len()..].copy_from_slice(&reduced);

    scalar_from_bytes(&bytes)
}

/// Derives the prover secrets `w0` and `w1` from a passcode.
pub fn compute_w0w1(pw: u32, iter: u32, salt: &[u8]) -> Result<(Scalar, Scalar), Error> {
    let mut w0w1s = [0; 2 * CRYPTO_W_SIZE_BYTES];
    get_w0w1s(pw, iter, salt, &mut w0w1s);

    Ok((
        reduce(&w0w1s[..CRYPTO_W_SIZE_BYTES])?,
        reduce(&w0w1s[CRYPTO_W_SIZE_BYTES..])?,
    ))
}

/// The `w0 || L` verifier a device can be provisioned with instead of its
/// passcode.
pub fn compute_verifier(
    pw: u32,
    iter: u32,
    salt: &[u8],
) -> Result<[u8; VERIFIER_SIZE_BYTES], Error> {
    let (w0, w1) = compute_w0w1(pw, iter, salt)?;

    let mut verifier = [0; VERIFIER_SIZE_BYTES];
    verifier[..CRYPTO_GROUP_SIZE_BYTES].copy_from_slice(&w0.to_bytes());
    verifier[CRYPTO_GROUP_SIZE_BYTES..]
        .copy_from_slice((ProjectivePoint::GENERATOR * w1).to_encoded_point(false).as_bytes());

    Ok(verifier)
}

fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar, Error> {
    if bytes.len() != CRYPTO_GROUP_SIZE_BYTES {
        Err(ErrorCode::InvalidData)?;
    }

    let scalar: Option<Scalar> = Scalar::from_repr(*FieldBytes::from_slice(bytes)).into();

    scalar.ok_or_else(|| ErrorCode::Crypto.into())
}

fn point_from_bytes(bytes: &[u8]) -> Result<ProjectivePoint, Error> {
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| ErrorCode::InvalidData)?;
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();

    affine
        .map(ProjectivePoint::from)
        .ok_or_else(|| ErrorCode::InvalidData.into())
}

fn point_to_bytes(point: &ProjectivePoint) -> [u8; CRYPTO_PUBLIC_KEY_SIZE_BYTES] {
    let mut out = [0; CRYPTO_PUBLIC_KEY_SIZE_BYTES];
    let encoded = point.to_affine().to_encoded_point(false);
    let bytes = encoded.as_bytes();
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

fn add_to_tt(tt: &mut Sha256, buf: &[u8]) {
    tt.update(&(buf.len() as u64).to_le_bytes());
    if !buf.is_empty() {
        tt.update(buf);
    }
}

#[allow(non_snake_case)]
fn transcript_hash(
    context: &[u8],
    pA: &[u8],
    pB: &[u8],
    Z: &ProjectivePoint,
    V: &ProjectivePoint,
    w0: &Scalar,
) -> Result<[u8; crypto::SHA256_HASH_LEN_BYTES], Error> {
    let mut tt = Sha256::new();

    add_to_tt(&mut tt, context);
    // Both identities are empty
    add_to_tt(&mut tt, &[]);
    add_to_tt(&mut tt, &[]);
    add_to_tt(&mut tt, &MATTER_M_BIN);
    add_to_tt(&mut tt, &MATTER_N_BIN);
    add_to_tt(&mut tt, pA);
    add_to_tt(&mut tt, pB);
    add_to_tt(&mut tt, &point_to_bytes(Z));
    add_to_tt(&mut tt, &point_to_bytes(V));
    add_to_tt(&mut tt, &w0.to_bytes());

    let mut hash = [0; crypto::SHA256_HASH_LEN_BYTES];
    tt.finish(&mut hash)?;

    Ok(hash)
}

/// Splits the transcript hash into `Ke` and derives both confirmations:
/// `cA = HMAC(KcA, pB)` and `cB = HMAC(KcB, pA)`.
#[allow(non_snake_case)]
fn get_Ke_and_cAcB(
    TT: &[u8],
    pA: &[u8],
    pB: &[u8],
    Ke: &mut [u8],
    cA: &mut [u8],
    cB: &mut [u8],
) -> Result<(), Error> {
    let (Ka, ke) = TT.split_at(TT.len() / 2);
    Ke.copy_from_slice(ke);

    let mut KcAKcB = [0; 32];
    crypto::hkdf_sha256(&[], Ka, SPAKE2P_KEY_CONFIRM_INFO, &mut KcAKcB)?;
    let (KcA, KcB) = KcAKcB.split_at(KcAKcB.len() / 2);

    let mut mac = HmacSha256::new(KcA)?;
    mac.update(pB);
    mac.finish(cA)?;

    let mut mac = HmacSha256::new(KcB)?;
    mac.update(pA);
    mac.finish(cB)?;

    Ok(())
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Spake2VerifierState {
    // w0 and L are set
    Init,
    // Keys are derived, waiting for cA
    PendingConfirmation,
    Confirmed,
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Spake2Mode {
    Unknown,
    Prover,
    Verifier(Spake2VerifierState),
}

#[allow(non_snake_case)]
pub struct Spake2P {
    mode: Spake2Mode,
    context: Option<Sha256>,
    w0: Scalar,
    w1: Scalar,
    L: ProjectivePoint,
    xy: Scalar,
    pA: [u8; CRYPTO_PUBLIC_KEY_SIZE_BYTES],
    Ke: [u8; KE_SIZE_BYTES],
    cA: [u8; CONFIRMATION_SIZE_BYTES],
}

impl Spake2P {
    pub fn new() -> Self {
        Self {
            mode: Spake2Mode::Unknown,
            context: None,
            w0: Scalar::ZERO,
            w1: Scalar::ZERO,
            L: ProjectivePoint::IDENTITY,
            xy: Scalar::ZERO,
            pA: [0; CRYPTO_PUBLIC_KEY_SIZE_BYTES],
            Ke: [0; KE_SIZE_BYTES],
            cA: [0; CONFIRMATION_SIZE_BYTES],
        }
    }

    pub fn mode(&self) -> Spake2Mode {
        self.mode
    }

    /// Starts the transcript context; the PBKDF exchange is fed in next.
    pub fn set_context(&mut self) {
        let mut context = Sha256::new();
        context.update(SPAKE2P_CONTEXT_PREFIX);
        self.context = Some(context);
    }

    pub fn update_context(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.context
            .as_mut()
            .ok_or(ErrorCode::InvalidState)?
            .update(buf);
        Ok(())
    }

    fn finish_context(&mut self) -> Result<[u8; crypto::SHA256_HASH_LEN_BYTES], Error> {
        let mut hash = [0; crypto::SHA256_HASH_LEN_BYTES];
        self.context
            .take()
            .ok_or(ErrorCode::InvalidState)?
            .finish(&mut hash)?;
        Ok(hash)
    }

    pub fn start_verifier(&mut self, verifier: &VerifierData) -> Result<(), Error> {
        let (w0, l) = verifier.w0_and_L()?;
        self.w0 = w0;
        self.L = l;
        self.mode = Spake2Mode::Verifier(Spake2VerifierState::Init);
        Ok(())
    }

    pub fn start_prover(&mut self, pw: u32, iter: u32, salt: &[u8]) -> Result<(), Error> {
        let (w0, w1) = compute_w0w1(pw, iter, salt)?;
        self.w0 = w0;
        self.w1 = w1;
        self.mode = Spake2Mode::Prover;
        Ok(())
    }

    /// Prover: `X = x*P + w0*M`.
    #[allow(non_snake_case)]
    pub fn get_pA(&mut self, rand: Rand) -> Result<[u8; CRYPTO_PUBLIC_KEY_SIZE_BYTES], Error> {
        if self.mode != Spake2Mode::Prover {
            Err(ErrorCode::InvalidState)?;
        }

        let M = point_from_bytes(&MATTER_M_BIN)?;
        let x = Scalar::random(&mut RandRngCore(rand));
        let X = ProjectivePoint::GENERATOR * x + M * self.w0;

        self.xy = x;
        self.pA = point_to_bytes(&X);

        Ok(self.pA)
    }

    /// Prover: checks the verifier's `cB` and returns `(cA, Ke)`.
    #[allow(non_snake_case)]
    pub fn handle_pB_cB(
        &mut self,
        pB: &[u8],
        cB: &[u8],
    ) -> Result<([u8; CONFIRMATION_SIZE_BYTES], [u8; KE_SIZE_BYTES]), Error> {
        if self.mode != Spake2Mode::Prover {
            Err(ErrorCode::InvalidState)?;
        }

        let context = self.finish_context()?;
        let N = point_from_bytes(&MATTER_N_BIN)?;
        let Y = point_from_bytes(pB)?;

        // Z = x*(Y - w0*N), V = w1*(Y - w0*N); the cofactor of P-256 is 1
        let unblinded = Y - N * self.w0;
        let Z = unblinded * self.xy;
        let V = unblinded * self.w1;

        let TT = transcript_hash(&context, &self.pA, pB, &Z, &V, &self.w0)?;

        let mut Ke = [0; KE_SIZE_BYTES];
        let mut cA = [0; CONFIRMATION_SIZE_BYTES];
        let mut expected_cB = [0; CONFIRMATION_SIZE_BYTES];
        let pA = self.pA;
        get_Ke_and_cAcB(&TT, &pA, pB, &mut Ke, &mut cA, &mut expected_cB)?;

        if cB.ct_eq(&expected_cB).unwrap_u8() != 1 {
            Err(ErrorCode::InvalidSignature)?;
        }

        Ok((cA, Ke))
    }

    /// Verifier: `Y = y*P + w0*N`; derives the keys and returns `(pB, cB)`.
    #[allow(non_snake_case)]
    pub fn handle_pA(
        &mut self,
        pA: &[u8],
        rand: Rand,
    ) -> Result<([u8; CRYPTO_PUBLIC_KEY_SIZE_BYTES], [u8; CONFIRMATION_SIZE_BYTES]), Error> {
        if self.mode != Spake2Mode::Verifier(Spake2VerifierState::Init) {
            Err(ErrorCode::InvalidState)?;
        }

        let context = self.finish_context()?;
        let M = point_from_bytes(&MATTER_M_BIN)?;
        let N = point_from_bytes(&MATTER_N_BIN)?;
        let X = point_from_bytes(pA)?;

        let y = Scalar::random(&mut RandRngCore(rand));
        let Y = ProjectivePoint::GENERATOR * y + N * self.w0;
        let pB = point_to_bytes(&Y);

        // Z = y*(X - w0*M), V = y*L
        let Z = (X - M * self.w0) * y;
        let V = self.L * y;

        let TT = transcript_hash(&context, pA, &pB, &Z, &V, &self.w0)?;

        let mut cB = [0; CONFIRMATION_SIZE_BYTES];
        get_Ke_and_cAcB(&TT, pA, &pB, &mut self.Ke, &mut self.cA, &mut cB)?;

        self.mode = Spake2Mode::Verifier(Spake2VerifierState::PendingConfirmation);

        Ok((pB, cB))
    }

    /// Verifier: releases `Ke` once the prover's `cA` matches.
    #[allow(non_snake_case)]
    pub fn handle_cA(&mut self, cA: &[u8]) -> Result<[u8; KE_SIZE_BYTES], Error> {
        if self.mode != Spake2Mode::Verifier(Spake2VerifierState::PendingConfirmation) {
            Err(ErrorCode::InvalidState)?;
        }

        self.mode = Spake2Mode::Verifier(Spake2VerifierState::Confirmed);

        if cA.ct_eq(&self.cA).unwrap_u8() == 1 {
            Ok(self.Ke)
        } else {
            Err(ErrorCode::InvalidSignature.into())
        }
    }
}

impl Default for Spake2P {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::rand::sys_rand;

    #[test]
    fn test_pbkdf2() {
        // From a chip-tool run
        let salt = [
            0x4, 0xa1, 0xd2, 0xc6, 0x11, 0xf0, 0xbd, 0x36, 0x78, 0x67, 0x79, 0x7b, 0xfe, 0x82,
            0x36, 0x0,
        ];
        let mut w0w1s = [0; 2 * CRYPTO_W_SIZE_BYTES];
        get_w0w1s(123456, 2000, &salt, &mut w0w1s);
        assert_eq!(
            w0w1s,
            [
                0xc7, 0x89, 0x33, 0x9c, 0xc5, 0xeb, 0xbc, 0xf6, 0xdf, 0x04, 0xa9, 0x11, 0x11, 0x06,
                0x4c, 0x15, 0xac, 0x5a, 0xea, 0x67, 0x69, 0x9f, 0x32, 0x62, 0xcf, 0xc6, 0xe9, 0x19,
                0xe8, 0xa4, 0x0b, 0xb3, 0x42, 0xe8, 0xc6, 0x8e, 0xa9, 0x9a, 0x73, 0xe2, 0x59, 0xd1,
                0x17, 0xd8, 0xed, 0xcb, 0x72, 0x8c, 0xbf, 0x3b, 0xa9, 0x88, 0x02, 0xd8, 0x45, 0x4b,
                0xd0, 0x2d, 0xe5, 0xe4, 0x1c, 0xc3, 0xd7, 0x00, 0x03, 0x3c, 0x86, 0x20, 0x9a, 0x42,
                0x5f, 0x55, 0x96, 0x3b, 0x9f, 0x6f, 0x79, 0xef, 0xcb, 0x37
            ]
        )
    }

    #[test]
    fn reduce_wraps_around_the_order() {
        let mut ws = [0; CRYPTO_W_SIZE_BYTES];
        ws[8..].copy_from_slice(&P256_ORDER);
        ws[CRYPTO_W_SIZE_BYTES - 1] += 5;

        assert_eq!(reduce(&ws).unwrap(), Scalar::from(5u64));
    }

    #[allow(non_snake_case)]
    fn run(verifier: &VerifierData, passcode: u32, tamper_cA: bool) -> Result<[u8; 16], Error> {
        let mut prover = Spake2P::new();
        let mut device = Spake2P::new();

        prover.start_prover(passcode, verifier.count(), verifier.salt())?;
        device.start_verifier(verifier)?;

        for party in [&mut prover, &mut device] {
            party.set_context();
            party.update_context(b"request")?;
            party.update_context(b"response")?;
        }

        let pA = prover.get_pA(sys_rand)?;
        let (pB, cB) = device.handle_pA(&pA, sys_rand)?;
        let (mut cA, prover_ke) = prover.handle_pB_cB(&pB, &cB)?;
        if tamper_cA {
            cA[0] ^= 1;
        }
        let device_ke = device.handle_cA(&cA)?;

        assert_eq!(prover_ke, device_ke);
        Ok(device_ke)
    }

    #[test]
    fn prover_and_verifier_agree() {
        let data = VerifierData::new_with_pw(20202021, sys_rand);
        run(&data, 20202021, false).unwrap();

        let verifier = compute_verifier(20202021, data.count(), data.salt()).unwrap();
        let data = VerifierData::new(&verifier, data.salt(), data.count()).unwrap();
        run(&data, 20202021, false).unwrap();
    }

    #[test]
    fn wrong_passcode_fails_confirmation() {
        let data = VerifierData::new_with_pw(20202021, sys_rand);
        assert_eq!(
            run(&data, 20202022, false).unwrap_err().code(),
            ErrorCode::InvalidSignature
        );
    }

    #[test]
    fn tampered_confirmation_is_rejected() {
        let data = VerifierData::new_with_pw(20202021, sys_rand);
        assert_eq!(
            run(&data, 20202021, true).unwrap_err().code(),
            ErrorCode::InvalidSignature
        );
    }

    #[test]
    fn pa_out_of_order() {
        let mut device = Spake2P::new();
        assert!(device.handle_cA(&[0; 32]).is_err());
        assert!(device.handle_pA(&[0; 65], sys_rand).is_err());
    }
}
