use crate::errors::{Error, Result};
use aes_gcm::{
	aead::{
		generic_array::{typenum::U16, GenericArray},
		Aead, KeyInit, Payload,
	},
	aes::Aes256,
	AesGcm,
};
use rand::RngCore;
use zeroize::Zeroizing;

/// AES-256-GCM with the 16-byte IV the stored envelopes use.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Additional authenticated data binding ciphertexts to their purpose; a
/// ciphertext lifted into another column will not decrypt.
const KEY_AAD: &[u8] = b"private_key";

/// Encrypts vault private keys at rest. Envelope layout is
/// `IV(16) || tag(16) || ciphertext`, hex-encoded for storage.
#[derive(Clone)]
pub struct KeyCipher {
	key: Zeroizing<[u8; 32]>,
}

impl KeyCipher {
	/// `key_hex` must be 64 hex chars (an AES-256 key).
	pub fn from_hex(key_hex: &str) -> Result<Self> {
		let bytes = hex::decode(key_hex)
			.map_err(|_| Error::validation("encryption key must be hex"))?;
		let key: [u8; 32] = bytes
			.try_into()
			.map_err(|_| Error::validation("encryption key must be 32 bytes"))?;
		Ok(KeyCipher { key: Zeroizing::new(key) })
	}

	pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
		let cipher = Aes256Gcm16::new(GenericArray::from_slice(self.key.as_ref()));
		let mut iv = [0u8; IV_LEN];
		rand::thread_rng().fill_bytes(&mut iv);

		let ct_and_tag = cipher
			.encrypt(GenericArray::from_slice(&iv), Payload { msg: plaintext, aad: KEY_AAD })
			.map_err(|_| Error::Integrity("encryption failed".to_string()))?;

		// aes-gcm appends the tag; the stored layout wants it up front.
		let (ciphertext, tag) = ct_and_tag.split_at(ct_and_tag.len() - TAG_LEN);
		let mut envelope = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
		envelope.extend_from_slice(&iv);
		envelope.extend_from_slice(tag);
		envelope.extend_from_slice(ciphertext);
		Ok(hex::encode(envelope))
	}

	/// Fails closed: any malformed or tampered envelope is an `Integrity`
	/// error, never partial plaintext.
	pub fn decrypt(&self, envelope_hex: &str) -> Result<Zeroizing<Vec<u8>>> {
		let envelope = hex::decode(envelope_hex)
			.map_err(|_| Error::Integrity("malformed key envelope".to_string()))?;
		if envelope.len() < IV_LEN + TAG_LEN {
			return Err(Error::Integrity("truncated key envelope".to_string()));
		}
		let (iv, rest) = envelope.split_at(IV_LEN);
		let (tag, ciphertext) = rest.split_at(TAG_LEN);

		let mut ct_and_tag = Vec::with_capacity(ciphertext.len() + TAG_LEN);
		ct_and_tag.extend_from_slice(ciphertext);
		ct_and_tag.extend_from_slice(tag);

		let cipher = Aes256Gcm16::new(GenericArray::from_slice(self.key.as_ref()));
		cipher
			.decrypt(
				GenericArray::from_slice(iv),
				Payload { msg: &ct_and_tag, aad: KEY_AAD },
			)
			.map(Zeroizing::new)
			.map_err(|_| Error::Integrity("private key decryption failed".to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cipher() -> KeyCipher {
		KeyCipher::from_hex(&"ab".repeat(32)).unwrap()
	}

	#[test]
	fn round_trip() {
		let cipher = cipher();
		let secret = [7u8; 32];
		let envelope = cipher.encrypt(&secret).unwrap();
		assert_eq!(cipher.decrypt(&envelope).unwrap().as_slice(), &secret);
	}

	#[test]
	fn envelope_layout() {
		let cipher = cipher();
		let envelope = hex::decode(cipher.encrypt(&[1u8; 32]).unwrap()).unwrap();
		assert_eq!(envelope.len(), IV_LEN + TAG_LEN + 32);
	}

	#[test]
	fn ivs_are_random() {
		let cipher = cipher();
		let a = cipher.encrypt(&[1u8; 32]).unwrap();
		let b = cipher.encrypt(&[1u8; 32]).unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn tampering_fails_closed() {
		let cipher = cipher();
		let mut envelope = hex::decode(cipher.encrypt(&[9u8; 32]).unwrap()).unwrap();
		let last = envelope.len() - 1;
		envelope[last] ^= 0x01;
		assert!(cipher.decrypt(&hex::encode(envelope)).is_err());
	}

	#[test]
	fn wrong_key_fails_closed() {
		let envelope = cipher().encrypt(&[9u8; 32]).unwrap();
		let other = KeyCipher::from_hex(&"cd".repeat(32)).unwrap();
		assert!(other.decrypt(&envelope).is_err());
	}

	#[test]
	fn truncated_envelope_is_rejected() {
		assert!(cipher().decrypt("abcd").is_err());
		assert!(cipher().decrypt("not hex at all").is_err());
	}
}
