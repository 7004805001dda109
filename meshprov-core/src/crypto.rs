//! Cryptographic primitives for mesh provisioning.
//!
//! Implements:
//! - AES-CMAC and the salt generation function s1
//! - Key derivation functions k1 and k3
//! - AES-CCM with a 13-byte nonce and 8-byte MIC
//! - P-256 key pairs and ECDH
//!
//! Every function is stateless; keys and nonces are explicit arguments.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit};
use ccm::consts::{U13, U8};
use ccm::Ccm;
use cmac::{Cmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{ProvisioningError, ProvisioningResult};
use crate::pdu::PUBLIC_KEY_LEN;

/// 128-bit AES key, CMAC output or derived key.
pub type Key = [u8; 16];

/// Session nonce used for the provisioning data.
pub type Nonce = [u8; 13];

/// Raw ECDH shared secret (the X coordinate of the shared point).
pub type SharedSecret = [u8; 32];

const ZERO_KEY: Key = [0u8; 16];

type MeshCcm = Ccm<Aes128, U8, U13>;

/// AES-CMAC of `data` under `key`.
pub fn aes_cmac(key: &Key, data: &[u8]) -> Key {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    mac.update(data);
    let tag = mac.finalize().into_bytes();

    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    out
}

/// Salt generation function: `s1(M) = AES-CMAC_ZERO(M)`.
pub fn s1(data: &[u8]) -> Key {
    aes_cmac(&ZERO_KEY, data)
}

/// Key derivation function k1: `T = AES-CMAC_SALT(N)`, `k1 = AES-CMAC_T(P)`.
pub fn k1(n: &[u8], salt: &Key, p: &[u8]) -> Key {
    let mut t = aes_cmac(salt, n);
    let out = aes_cmac(&t, p);
    t.zeroize();
    out
}

/// Derivation function k3, producing the 64-bit network ID.
pub fn k3(n: &Key) -> [u8; 8] {
    let salt = s1(b"smk3");
    let mut t = aes_cmac(&salt, n);
    let result = aes_cmac(&t, b"id64\x01");
    t.zeroize();

    let mut id = [0u8; 8];
    id.copy_from_slice(&result[8..]);
    id
}

/// Network ID of a network key.
pub fn network_id(network_key: &Key) -> [u8; 8] {
    k3(network_key)
}

/// Identity key used for node identity advertising:
/// `k1(NetKey, s1("nkik"), "id128" || 0x01)`.
pub fn identity_key(network_key: &Key) -> Key {
    k1(network_key, &s1(b"nkik"), b"id128\x01")
}

/// Encrypt with AES-CCM, returning `ciphertext || MIC`.
pub fn encrypt_ccm(key: &Key, nonce: &Nonce, plaintext: &[u8]) -> ProvisioningResult<Vec<u8>> {
    let cipher = MeshCcm::new(GenericArray::from_slice(key));
    cipher
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| ProvisioningError::Crypto("AES-CCM encryption failed".to_string()))
}

/// Decrypt `ciphertext || MIC` with AES-CCM. Fails if the MIC does not verify.
pub fn decrypt_ccm(key: &Key, nonce: &Nonce, ciphertext: &[u8]) -> ProvisioningResult<Vec<u8>> {
    let cipher = MeshCcm::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| ProvisioningError::DecryptionFailed)
}

/// Fill an array from the OS random number generator.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Constant-time comparison of two MACs.
pub fn macs_equal(a: &Key, b: &Key) -> bool {
    a.ct_eq(b).into()
}

/// Validate an X‖Y encoded public key against the P-256 curve.
pub fn parse_public_key(xy: &[u8; PUBLIC_KEY_LEN]) -> ProvisioningResult<PublicKey> {
    let mut sec1 = [0u8; PUBLIC_KEY_LEN + 1];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(xy);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| ProvisioningError::InvalidPublicKey)
}

/// An ephemeral P-256 key pair for one provisioning attempt.
pub struct KeyPair {
    secret: EphemeralSecret,
    public: [u8; PUBLIC_KEY_LEN],
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);

        // Uncompressed SEC1: 0x04 || X || Y
        let mut public = [0u8; PUBLIC_KEY_LEN];
        public.copy_from_slice(&point.as_bytes()[1..]);

        Self { secret, public }
    }

    /// Public key as X‖Y, each coordinate 32 bytes big-endian.
    pub fn public_xy(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public
    }

    /// ECDH with the peer's X‖Y public key. The peer point is validated first.
    pub fn agree(&self, peer_xy: &[u8; PUBLIC_KEY_LEN]) -> ProvisioningResult<SharedSecret> {
        let peer = parse_public_key(peer_xy)?;
        let shared = self.secret.diffie_hellman(&peer);

        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // RFC 4493 section 4.
    #[test]
    fn aes_cmac_rfc4493() {
        let key = hex!("2b7e151628aed2a6abf7158809cf4f3c");
        assert_eq!(aes_cmac(&key, &[]), hex!("bb1d6929e95937287fa37d129b756746"));
        assert_eq!(
            aes_cmac(&key, &hex!("6bc1bee22e409f96e93d7e117393172a")),
            hex!("070a16b46b4d4144f79bdd9dd04a287c")
        );
    }

    // Mesh Profile 1.0.1 section 8.1.
    #[test]
    fn s1_sample_data() {
        assert_eq!(s1(b"test"), hex!("b73cefbd641ef2ea598c2b6efb62f79c"));
    }

    #[test]
    fn k1_sample_data() {
        let n = hex!("3216d1509884b533248541792b877f98");
        let salt = hex!("2ba14ffa0df84a2831938d57d276cab4");
        let p = hex!("5a09d60797eeb4478aada59db3352a0d");
        assert_eq!(k1(&n, &salt, &p), hex!("f6ed15a8934afbe7d83e8dcb57fcf5d7"));
    }

    #[test]
    fn k3_sample_data() {
        let n = hex!("f7a2a44f8e8a8029064f173ddc1e2b00");
        assert_eq!(k3(&n), hex!("ff046958233db014"));
    }

    // Mesh Profile 1.0.1 section 8.2.
    #[test]
    fn network_key_derivatives() {
        let net_key = hex!("7dd7364cd842ad18c17c2b820c84c3d6");
        assert_eq!(identity_key(&net_key), hex!("84396c435ac48560b5965385253e210c"));
        assert_eq!(network_id(&net_key), hex!("3ecaff672f673370"));
    }

    #[test]
    fn ccm_round_trip_and_tamper() {
        let key = random_bytes::<16>();
        let nonce = random_bytes::<13>();
        let plaintext = [0x5Au8; 25];

        let sealed = encrypt_ccm(&key, &nonce, &plaintext).unwrap();
        assert_eq!(sealed.len(), 33);
        assert_eq!(decrypt_ccm(&key, &nonce, &sealed).unwrap(), plaintext);

        let mut tampered = sealed.clone();
        tampered[3] ^= 0x01;
        assert!(matches!(
            decrypt_ccm(&key, &nonce, &tampered),
            Err(ProvisioningError::DecryptionFailed)
        ));
    }

    #[test]
    fn ecdh_agreement_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(a.agree(b.public_xy()).unwrap(), b.agree(a.public_xy()).unwrap());
    }

    #[test]
    fn point_off_curve_rejected() {
        let a = KeyPair::generate();
        let mut bogus = *a.public_xy();
        bogus[63] ^= 0x01;
        assert!(matches!(a.agree(&bogus), Err(ProvisioningError::InvalidPublicKey)));
        assert!(matches!(
            parse_public_key(&[0u8; PUBLIC_KEY_LEN]),
            Err(ProvisioningError::InvalidPublicKey)
        ));
    }

    #[test]
    fn mac_comparison() {
        let a = [7u8; 16];
        let mut b = a;
        assert!(macs_equal(&a, &b));
        b[15] = 8;
        assert!(!macs_equal(&a, &b));
    }
}
