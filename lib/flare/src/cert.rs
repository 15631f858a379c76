use crate::crypto;
use crate::identity::Identity;
use crate::keys::{Ed25519KeyPair, Ed25519PublicKey, KeyType, X25519PublicKey};
use prost::Message;

/// Cipher identifiers carried in the crypt info envelope.
pub const CIPHER_AES_256_GCM: u32 = 1;

pub const NONCE_SEED_SIZE: usize = 16;

/// Subcodes for certificate rejection. Every path that refuses a cert names
/// the exact check that failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CertError {
    Malformed,
    Expired,
    NotYetValid,
    AuthorityUnknown,
    BadSignature,
    KeyMismatch,
}

pub type CertResult<T> = Result<T, CertError>;

/// Serialized certificate body. The signature covers these bytes exactly as
/// transmitted, so the decoded form always retains the original encoding.
#[derive(Clone, PartialEq, Message)]
pub struct CertBody {
    #[prost(uint32, tag = "1")]
    pub key_type: u32,
    #[prost(bytes, tag = "2")]
    pub key_data: Vec<u8>,
    #[prost(string, tag = "3")]
    pub identity: String,
    #[prost(fixed32, tag = "4")]
    pub time_created: u32,
    #[prost(fixed32, tag = "5")]
    pub time_expiry: u32,
    #[prost(uint32, repeated, tag = "6")]
    pub app_ids: Vec<u32>,
    #[prost(string, tag = "7")]
    pub issuer: String,
}

/// Signed certificate envelope: body bytes plus an Ed25519 signature by the
/// issuing authority (or by the subject itself when self-signed).
#[derive(Clone, Eq, PartialEq, Message)]
pub struct CertSigned {
    #[prost(bytes, tag = "1")]
    pub cert: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub sig: Vec<u8>,
}

/// Serialized crypt info body carrying the connection-ephemeral key material.
#[derive(Clone, PartialEq, Message)]
pub struct CryptInfoBody {
    #[prost(uint32, tag = "1")]
    pub key_type: u32,
    #[prost(bytes, tag = "2")]
    pub key_data: Vec<u8>,
    #[prost(bytes, tag = "3")]
    pub nonce: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub cipher: u32,
}

/// Crypt info signed by the long-lived identity key presented in the cert.
#[derive(Clone, Eq, PartialEq, Message)]
pub struct CryptInfoSigned {
    #[prost(bytes, tag = "1")]
    pub info: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub sig: Vec<u8>,
}

/// Decoded, validated certificate contents.
#[derive(Debug, Clone)]
pub struct CertInfo {
    pub identity: Identity,
    pub issuer: String,
    pub public_key: Ed25519PublicKey,
    pub time_created: u32,
    pub time_expiry: u32,
    pub app_ids: Vec<u32>,
    pub self_signed: bool,
}

/// How to treat certs whose issuer is not in the trusted authority list.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UnsignedPolicy {
    /// Reject anything not signed by a known authority.
    Reject,
    /// Allow self-signed certificates.
    AllowSelfSigned,
}

/// Produces a self-signed certificate for the given identity keypair.
pub fn create_self_signed(
    identity: &Identity,
    pair: &Ed25519KeyPair,
    now_secs: u64,
    lifetime_secs: u64,
) -> CertSigned {
    let body = CertBody {
        key_type: KeyType::Ed25519Public.wire_id(),
        key_data: pair.public().as_bytes().to_vec(),
        identity: identity.to_string(),
        time_created: now_secs as u32,
        time_expiry: (now_secs + lifetime_secs) as u32,
        app_ids: Vec::new(),
        issuer: identity.to_string(),
    };

    sign_cert(&body, pair)
}

/// Signs a certificate body with the authority keypair.
pub fn sign_cert(body: &CertBody, authority: &Ed25519KeyPair) -> CertSigned {
    let mut cert = Vec::with_capacity(body.encoded_len());
    body.encode(&mut cert).expect("Vec write cannot fail");

    let sig = authority.sign(&cert);

    CertSigned {
        cert,
        sig: sig.to_vec(),
    }
}

/// Verifies a signed certificate envelope.
///
/// Order: parse; issuer key against the trusted authority list or the
/// permit-unsigned policy; Ed25519 signature over the exact body bytes;
/// validity window against wall time. The caller is responsible for the final
/// check that the subject key matches the key presented in the handshake.
pub fn verify_cert(
    signed: &CertSigned,
    authorities: &[Ed25519PublicKey],
    policy: UnsignedPolicy,
    now_secs: u64,
) -> CertResult<CertInfo> {
    let body = CertBody::decode(&signed.cert[..]).map_err(|_| CertError::Malformed)?;

    if body.key_type != KeyType::Ed25519Public.wire_id() {
        return Err(CertError::Malformed);
    }

    let subject_key =
        Ed25519PublicKey::from_slice(&body.key_data).map_err(|_| CertError::Malformed)?;

    let identity: Identity = body.identity.parse().map_err(|_| CertError::Malformed)?;

    let sig: [u8; crypto::SIGNATURE_SIZE] = match signed.sig.len() {
        crypto::SIGNATURE_SIZE => {
            let mut sig = [0u8; crypto::SIGNATURE_SIZE];
            sig.copy_from_slice(&signed.sig);
            sig
        }
        _ => return Err(CertError::Malformed),
    };

    // Locate the signing key: a trusted authority, or the subject itself when
    // self-signed certs are permitted.
    let mut self_signed = false;
    match authorities.iter().find(|key| key.verify(&signed.cert, &sig)) {
        Some(_) => (),
        None => {
            if policy != UnsignedPolicy::AllowSelfSigned {
                return Err(match authorities.is_empty() {
                    true => CertError::AuthorityUnknown,
                    false => CertError::BadSignature,
                });
            }

            if !subject_key.verify(&signed.cert, &sig) {
                return Err(CertError::BadSignature);
            }

            self_signed = true;
        }
    }

    if (body.time_created as u64) > now_secs + 60 {
        return Err(CertError::NotYetValid);
    }

    if (body.time_expiry as u64) < now_secs {
        return Err(CertError::Expired);
    }

    Ok(CertInfo {
        identity,
        issuer: body.issuer,
        public_key: subject_key,
        time_created: body.time_created,
        time_expiry: body.time_expiry,
        app_ids: body.app_ids,
        self_signed,
    })
}

/// Builds a signed crypt info envelope for a connection-ephemeral X25519 key.
pub fn sign_crypt_info(
    ephemeral_public: &X25519PublicKey,
    nonce_seed: &[u8; NONCE_SEED_SIZE],
    identity_pair: &Ed25519KeyPair,
) -> CryptInfoSigned {
    let body = CryptInfoBody {
        key_type: KeyType::X25519Public.wire_id(),
        key_data: ephemeral_public.as_bytes().to_vec(),
        nonce: nonce_seed.to_vec(),
        cipher: CIPHER_AES_256_GCM,
    };

    let mut info = Vec::with_capacity(body.encoded_len());
    body.encode(&mut info).expect("Vec write cannot fail");

    let sig = identity_pair.sign(&info);

    CryptInfoSigned {
        info,
        sig: sig.to_vec(),
    }
}

/// Decoded crypt info after signature verification.
#[derive(Debug, Clone)]
pub struct CryptInfo {
    pub ephemeral_public: X25519PublicKey,
    pub nonce_seed: [u8; NONCE_SEED_SIZE],
    pub cipher: u32,
}

/// Verifies crypt info against the identity key taken from a validated cert.
pub fn verify_crypt_info(
    signed: &CryptInfoSigned,
    identity_key: &Ed25519PublicKey,
) -> CertResult<CryptInfo> {
    let sig: [u8; crypto::SIGNATURE_SIZE] = match signed.sig.len() {
        crypto::SIGNATURE_SIZE => {
            let mut sig = [0u8; crypto::SIGNATURE_SIZE];
            sig.copy_from_slice(&signed.sig);
            sig
        }
        _ => return Err(CertError::Malformed),
    };

    if !identity_key.verify(&signed.info, &sig) {
        return Err(CertError::BadSignature);
    }

    let body = CryptInfoBody::decode(&signed.info[..]).map_err(|_| CertError::Malformed)?;

    if body.key_type != KeyType::X25519Public.wire_id() || body.cipher != CIPHER_AES_256_GCM {
        return Err(CertError::Malformed);
    }

    let ephemeral_public =
        X25519PublicKey::from_slice(&body.key_data).map_err(|_| CertError::Malformed)?;

    if body.nonce.len() != NONCE_SEED_SIZE {
        return Err(CertError::Malformed);
    }

    let mut nonce_seed = [0u8; NONCE_SEED_SIZE];
    nonce_seed.copy_from_slice(&body.nonce);

    Ok(CryptInfo {
        ephemeral_public,
        nonce_seed,
        cipher: body.cipher,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::X25519KeyPair;
    use crate::time::timestamp_secs;

    fn subject() -> (Identity, Ed25519KeyPair) {
        (Identity::Str("subject".to_owned()), Ed25519KeyPair::generate())
    }

    #[test]
    fn test_authority_signed_cert_verifies() {
        let (identity, pair) = subject();
        let authority = Ed25519KeyPair::generate();
        let now = timestamp_secs();

        let body = CertBody {
            key_type: KeyType::Ed25519Public.wire_id(),
            key_data: pair.public().as_bytes().to_vec(),
            identity: identity.to_string(),
            time_created: now as u32,
            time_expiry: (now + 3600) as u32,
            app_ids: vec![42],
            issuer: "str:authority".to_owned(),
        };
        let signed = sign_cert(&body, &authority);

        let info = verify_cert(
            &signed,
            &[authority.public()],
            UnsignedPolicy::Reject,
            now,
        )
        .unwrap();

        assert_eq!(info.identity, identity);
        assert_eq!(info.public_key, pair.public());
        assert_eq!(info.app_ids, vec![42]);
        assert!(!info.self_signed);
    }

    #[test]
    fn test_self_signed_policy() {
        let (identity, pair) = subject();
        let now = timestamp_secs();
        let signed = create_self_signed(&identity, &pair, now, 3600);

        // Rejected when policy demands an authority
        assert_eq!(
            verify_cert(&signed, &[], UnsignedPolicy::Reject, now).unwrap_err(),
            CertError::AuthorityUnknown
        );

        // Accepted under the permissive policy
        let info =
            verify_cert(&signed, &[], UnsignedPolicy::AllowSelfSigned, now).unwrap();
        assert!(info.self_signed);
    }

    #[test]
    fn test_expired_cert() {
        let (identity, pair) = subject();
        let now = timestamp_secs();
        let signed = create_self_signed(&identity, &pair, now - 7200, 3600);

        assert_eq!(
            verify_cert(&signed, &[], UnsignedPolicy::AllowSelfSigned, now).unwrap_err(),
            CertError::Expired
        );
    }

    #[test]
    fn test_not_yet_valid_cert() {
        let (identity, pair) = subject();
        let now = timestamp_secs();
        let signed = create_self_signed(&identity, &pair, now + 7200, 3600);

        assert_eq!(
            verify_cert(&signed, &[], UnsignedPolicy::AllowSelfSigned, now).unwrap_err(),
            CertError::NotYetValid
        );
    }

    #[test]
    fn test_tampered_cert_body() {
        let (identity, pair) = subject();
        let now = timestamp_secs();
        let mut signed = create_self_signed(&identity, &pair, now, 3600);

        // Flip one byte of the body; the signature is now over different bytes
        let last = signed.cert.len() - 1;
        signed.cert[last] ^= 1;

        let result = verify_cert(&signed, &[], UnsignedPolicy::AllowSelfSigned, now);
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_authority_rejected() {
        let (identity, pair) = subject();
        let authority = Ed25519KeyPair::generate();
        let other = Ed25519KeyPair::generate();
        let now = timestamp_secs();

        let signed = create_self_signed(&identity, &pair, now, 3600);
        let _ = authority;

        assert_eq!(
            verify_cert(&signed, &[other.public()], UnsignedPolicy::Reject, now).unwrap_err(),
            CertError::BadSignature
        );
    }

    #[test]
    fn test_crypt_info_roundtrip() {
        let (_, identity_pair) = subject();
        let ephemeral = X25519KeyPair::generate();
        let nonce_seed = [5u8; NONCE_SEED_SIZE];

        let signed = sign_crypt_info(&ephemeral.public(), &nonce_seed, &identity_pair);

        let info = verify_crypt_info(&signed, &identity_pair.public()).unwrap();
        assert_eq!(info.ephemeral_public, ephemeral.public());
        assert_eq!(info.nonce_seed, nonce_seed);
        assert_eq!(info.cipher, CIPHER_AES_256_GCM);
    }

    #[test]
    fn test_crypt_info_wrong_identity_key() {
        let (_, identity_pair) = subject();
        let other = Ed25519KeyPair::generate();
        let ephemeral = X25519KeyPair::generate();

        let signed = sign_crypt_info(&ephemeral.public(), &[0u8; NONCE_SEED_SIZE], &identity_pair);

        assert_eq!(
            verify_crypt_info(&signed, &other.public()).unwrap_err(),
            CertError::BadSignature
        );
    }
}
