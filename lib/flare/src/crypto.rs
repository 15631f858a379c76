use ctor::ctor;
use libsodium_sys;

pub const TAG_SIZE: usize = libsodium_sys::crypto_aead_aes256gcm_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_aes256gcm_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_aes256gcm_NPUBBYTES as usize;
pub const SHA256_SIZE: usize = libsodium_sys::crypto_hash_sha256_BYTES as usize;
pub const CURVE25519_SIZE: usize = libsodium_sys::crypto_scalarmult_curve25519_BYTES as usize;
pub const ED25519_PUBLIC_SIZE: usize = libsodium_sys::crypto_sign_PUBLICKEYBYTES as usize;
pub const ED25519_SECRET_SIZE: usize = libsodium_sys::crypto_sign_SECRETKEYBYTES as usize;
pub const ED25519_SEED_SIZE: usize = libsodium_sys::crypto_sign_SEEDBYTES as usize;
pub const SIGNATURE_SIZE: usize = libsodium_sys::crypto_sign_BYTES as usize;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CryptoError {
    AuthenticationFailed,
    InvalidKey,
    SelfCheckFailed,
    Malformed,
    Signature,
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Initialize the sodium infrastructure and run the primitive self checks.
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }

        if libsodium_sys::crypto_aead_aes256gcm_is_available() == 0 {
            panic!("AES-256-GCM unavailable on this CPU")
        }
    }

    self_check();
}

/// One known-answer vector per primitive. A mismatch here means a broken
/// build of the crypto backend, which must never go unnoticed.
fn self_check() {
    // SHA-256("abc")
    let digest = sha256(b"abc");
    let expected =
        hex::decode("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad").unwrap();
    if digest[..] != expected[..] {
        panic!("Crypto self check failed: sha256");
    }

    // X25519 commutativity + AEAD round trip exercised together.
    let a = [1u8; CURVE25519_SIZE];
    let b = [2u8; CURVE25519_SIZE];
    let ab = x25519(&a, &x25519_public(&b)).expect("Crypto self check failed: x25519");
    let ba = x25519(&b, &x25519_public(&a)).expect("Crypto self check failed: x25519");
    if ab != ba {
        panic!("Crypto self check failed: x25519 agreement");
    }

    let key = sha256(&ab);
    let nonce = [7u8; NONCE_SIZE];
    let mut cipher = [0u8; 16 + TAG_SIZE];
    if !aes_gcm_encrypt(&mut cipher, b"self check plain", b"aad", &nonce, &key) {
        panic!("Crypto self check failed: aes-gcm encrypt");
    }
    let mut plain = [0u8; 16];
    if !aes_gcm_decrypt(&mut plain, &cipher, b"aad", &nonce, &key) || &plain != b"self check plain" {
        panic!("Crypto self check failed: aes-gcm decrypt");
    }

    // Ed25519 sign/verify over a fixed seed.
    let (public, secret) = ed25519_keypair_from_seed(&[3u8; ED25519_SEED_SIZE]);
    let sig = ed25519_sign(&secret, b"self check");
    if !ed25519_verify(&public, b"self check", &sig) {
        panic!("Crypto self check failed: ed25519");
    }
}

/// SHA-256 digest of the input.
#[inline]
pub fn sha256(data: &[u8]) -> [u8; SHA256_SIZE] {
    let mut out = [0u8; SHA256_SIZE];

    unsafe {
        libsodium_sys::crypto_hash_sha256(out.as_mut_ptr(), data.as_ptr(), data.len() as u64);
    }

    out
}

/// HMAC-SHA-256 over the data with an arbitrary-length key.
#[inline]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; SHA256_SIZE] {
    let mut out = [0u8; SHA256_SIZE];

    unsafe {
        let mut state = ::std::mem::MaybeUninit::<libsodium_sys::crypto_auth_hmacsha256_state>::uninit();

        libsodium_sys::crypto_auth_hmacsha256_init(state.as_mut_ptr(), key.as_ptr(), key.len());
        let mut state = state.assume_init();
        libsodium_sys::crypto_auth_hmacsha256_update(&mut state, data.as_ptr(), data.len() as u64);
        libsodium_sys::crypto_auth_hmacsha256_final(&mut state, out.as_mut_ptr());
    }

    out
}

/// Encrypts the plain text into the cipher buffer. The encrypted message size
/// is the plain text size plus the tag size (16 bytes). The function will fail
/// if the cipher slice does not match exactly.
///
/// The additional data, nonce and key must match those used during encryption,
/// the decryption will fail otherwise.
#[inline]
pub fn aes_gcm_encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: &[u8; NONCE_SIZE],
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + TAG_SIZE {
        panic!(
            "Encryption: cipher data length ({}) must be plain data length ({}) + tag size ({})",
            cipher.len(),
            plain.len(),
            TAG_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_aes256gcm_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the ciphertext into the plain buffer. The decoded message size is
/// the cipher text length minus the tag (16 bytes). Returns false on tag
/// mismatch, leaving the plain buffer unspecified.
#[inline]
pub fn aes_gcm_decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: &[u8; NONCE_SIZE],
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + TAG_SIZE {
        panic!(
            "Decryption: cipher data length ({}) must be plain data length ({}) + tag size ({})",
            cipher.len(),
            plain.len(),
            TAG_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_aes256gcm_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// X25519 scalar multiplication. The raw output is immediately hashed; the
/// unhashed curve point never leaves this function.
#[inline]
pub fn x25519(
    secret: &[u8; CURVE25519_SIZE],
    public: &[u8; CURVE25519_SIZE],
) -> CryptoResult<[u8; SHA256_SIZE]> {
    let mut raw = [0u8; CURVE25519_SIZE];

    let result = unsafe {
        libsodium_sys::crypto_scalarmult_curve25519(
            raw.as_mut_ptr(),
            secret.as_ptr(),
            public.as_ptr(),
        )
    };

    if result != 0 {
        return Err(CryptoError::InvalidKey);
    }

    let shared = sha256(&raw);
    memzero(&mut raw);

    Ok(shared)
}

/// Derives the public half of an X25519 secret key.
#[inline]
pub fn x25519_public(secret: &[u8; CURVE25519_SIZE]) -> [u8; CURVE25519_SIZE] {
    let mut public = [0u8; CURVE25519_SIZE];

    unsafe {
        libsodium_sys::crypto_scalarmult_curve25519_base(public.as_mut_ptr(), secret.as_ptr());
    }

    public
}

/// Expands a 32-byte seed into an Ed25519 keypair.
#[inline]
pub fn ed25519_keypair_from_seed(
    seed: &[u8; ED25519_SEED_SIZE],
) -> ([u8; ED25519_PUBLIC_SIZE], [u8; ED25519_SECRET_SIZE]) {
    let mut public = [0u8; ED25519_PUBLIC_SIZE];
    let mut secret = [0u8; ED25519_SECRET_SIZE];

    unsafe {
        libsodium_sys::crypto_sign_seed_keypair(
            public.as_mut_ptr(),
            secret.as_mut_ptr(),
            seed.as_ptr(),
        );
    }

    (public, secret)
}

/// Detached Ed25519 signature.
#[inline]
pub fn ed25519_sign(secret: &[u8; ED25519_SECRET_SIZE], message: &[u8]) -> [u8; SIGNATURE_SIZE] {
    let mut sig = [0u8; SIGNATURE_SIZE];

    unsafe {
        libsodium_sys::crypto_sign_detached(
            sig.as_mut_ptr(),
            ::std::ptr::null_mut(),
            message.as_ptr(),
            message.len() as u64,
            secret.as_ptr(),
        );
    }

    sig
}

/// Verifies a detached Ed25519 signature.
#[inline]
pub fn ed25519_verify(
    public: &[u8; ED25519_PUBLIC_SIZE],
    message: &[u8],
    sig: &[u8; SIGNATURE_SIZE],
) -> bool {
    unsafe {
        libsodium_sys::crypto_sign_verify_detached(
            sig.as_ptr(),
            message.as_ptr(),
            message.len() as u64,
            public.as_ptr(),
        ) == 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// A random u64 from the CSPRNG.
#[inline]
pub fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    random_bytes(&mut bytes);
    u64::from_le_bytes(bytes)
}

/// A random non-zero u32 from the CSPRNG. Connection ids must never be zero.
#[inline]
pub fn random_u32_nonzero() -> u32 {
    loop {
        let mut bytes = [0u8; 4];
        random_bytes(&mut bytes);
        let value = u32::from_le_bytes(bytes);

        if value != 0 {
            return value;
        }
    }
}

/// Best-effort wipe of sensitive material.
#[inline]
pub fn memzero(data: &mut [u8]) {
    unsafe {
        libsodium_sys::sodium_memzero(data.as_mut_ptr() as *mut ::std::ffi::c_void, data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_vector() {
        let digest = sha256(b"");
        assert_eq!(
            hex::encode(&digest),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hmac_sha256_vector() {
        // RFC 4231 test case 2
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(&mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_aes_gcm_roundtrip() {
        let key = [9u8; KEY_SIZE];
        let nonce = [3u8; NONCE_SIZE];
        let plain = b"the quick brown fox";

        let mut cipher = vec![0u8; plain.len() + TAG_SIZE];
        assert!(aes_gcm_encrypt(&mut cipher, plain, b"header", &nonce, &key));

        let mut decrypted = vec![0u8; plain.len()];
        assert!(aes_gcm_decrypt(&mut decrypted, &cipher, b"header", &nonce, &key));
        assert_eq!(&decrypted[..], &plain[..]);
    }

    #[test]
    fn test_aes_gcm_rejects_bad_aad() {
        let key = [9u8; KEY_SIZE];
        let nonce = [3u8; NONCE_SIZE];
        let plain = b"payload";

        let mut cipher = vec![0u8; plain.len() + TAG_SIZE];
        assert!(aes_gcm_encrypt(&mut cipher, plain, b"aad-one", &nonce, &key));

        let mut decrypted = vec![0u8; plain.len()];
        assert!(!aes_gcm_decrypt(&mut decrypted, &cipher, b"aad-two", &nonce, &key));
    }

    #[test]
    fn test_aes_gcm_rejects_tampered_cipher() {
        let key = [9u8; KEY_SIZE];
        let nonce = [3u8; NONCE_SIZE];
        let plain = b"payload";

        let mut cipher = vec![0u8; plain.len() + TAG_SIZE];
        assert!(aes_gcm_encrypt(&mut cipher, plain, b"aad", &nonce, &key));
        cipher[0] ^= 1;

        let mut decrypted = vec![0u8; plain.len()];
        assert!(!aes_gcm_decrypt(&mut decrypted, &cipher, b"aad", &nonce, &key));
    }

    #[test]
    fn test_x25519_agreement() {
        let mut a = [0u8; CURVE25519_SIZE];
        let mut b = [0u8; CURVE25519_SIZE];
        random_bytes(&mut a);
        random_bytes(&mut b);

        let shared_a = x25519(&a, &x25519_public(&b)).unwrap();
        let shared_b = x25519(&b, &x25519_public(&a)).unwrap();

        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn test_ed25519_roundtrip() {
        let (public, secret) = ed25519_keypair_from_seed(&[42u8; ED25519_SEED_SIZE]);

        let sig = ed25519_sign(&secret, b"message");
        assert!(ed25519_verify(&public, b"message", &sig));
        assert!(!ed25519_verify(&public, b"messagf", &sig));
    }

    #[test]
    fn test_random_nonzero() {
        for _ in 0..64 {
            assert_ne!(random_u32_nonzero(), 0);
        }
    }
}
