//! Hive key codecs. Public keys travel as `STM` + base58(key || ripemd160
//! checksum); private keys as WIF (base58check with a 0x80 version byte).

use crate::errors::{Error, Result};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Render a compressed secp256k1 key in Hive's text form.
pub fn encode_public_key(prefix: &str, key: &[u8; 33]) -> String {
	let checksum = Ripemd160::digest(key);
	let mut payload = Vec::with_capacity(37);
	payload.extend_from_slice(key);
	payload.extend_from_slice(&checksum[..4]);
	format!("{}{}", prefix, bs58::encode(payload).into_string())
}

/// Parse an `STM.../TST...` key back to its 33 bytes, verifying the
/// checksum.
pub fn decode_public_key(encoded: &str) -> Result<[u8; 33]> {
	if encoded.len() < 4 {
		return Err(Error::validation("public key too short"));
	}
	let (_prefix, body) = encoded.split_at(3);
	let payload = bs58::decode(body)
		.into_vec()
		.map_err(|_| Error::validation("public key is not base58"))?;
	if payload.len() != 37 {
		return Err(Error::validation("public key has wrong length"));
	}
	let (key, checksum) = payload.split_at(33);
	let expected = Ripemd160::digest(key);
	if checksum != &expected[..4] {
		return Err(Error::validation("public key checksum mismatch"));
	}
	Ok(key.try_into().expect("split at 33"))
}

/// Decode a WIF private key. Fails on bad version bytes or checksums.
pub fn decode_wif(wif: &str) -> Result<[u8; 32]> {
	let payload =
		bs58::decode(wif).into_vec().map_err(|_| Error::validation("WIF is not base58"))?;
	if payload.len() != 37 {
		return Err(Error::validation("WIF has wrong length"));
	}
	if payload[0] != 0x80 {
		return Err(Error::validation("WIF version byte must be 0x80"));
	}
	let (body, checksum) = payload.split_at(33);
	let digest = Sha256::digest(Sha256::digest(body));
	if checksum != &digest[..4] {
		return Err(Error::validation("WIF checksum mismatch"));
	}
	Ok(body[1..].try_into().expect("body is 33 bytes"))
}

#[cfg(test)]
pub fn encode_wif(secret: &[u8; 32]) -> String {
	let mut body = Vec::with_capacity(37);
	body.push(0x80);
	body.extend_from_slice(secret);
	let digest = Sha256::digest(Sha256::digest(&body));
	body.extend_from_slice(&digest[..4]);
	bs58::encode(body).into_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_public_key() -> [u8; 33] {
		let secp = secp256k1::Secp256k1::new();
		let secret = secp256k1::SecretKey::from_slice(&[0x11; 32]).unwrap();
		secp256k1::PublicKey::from_secret_key(&secp, &secret).serialize()
	}

	#[test]
	fn public_key_round_trip() {
		let key = sample_public_key();
		let encoded = encode_public_key("STM", &key);
		assert!(encoded.starts_with("STM"));
		assert!(crate::common::is_valid_public_key(&encoded));
		assert_eq!(decode_public_key(&encoded).unwrap(), key);
	}

	#[test]
	fn testnet_prefix_is_preserved() {
		let key = sample_public_key();
		let encoded = encode_public_key("TST", &key);
		assert!(encoded.starts_with("TST"));
		assert_eq!(decode_public_key(&encoded).unwrap(), key);
	}

	#[test]
	fn corrupted_public_key_is_rejected() {
		let key = sample_public_key();
		let mut encoded = encode_public_key("STM", &key);
		// flip a base58 character
		let replacement = if encoded.ends_with('a') { 'b' } else { 'a' };
		encoded.pop();
		encoded.push(replacement);
		assert!(decode_public_key(&encoded).is_err());
	}

	#[test]
	fn wif_round_trip() {
		let secret = [0x42u8; 32];
		let wif = encode_wif(&secret);
		assert!(wif.starts_with('5'));
		assert_eq!(decode_wif(&wif).unwrap(), secret);
	}

	#[test]
	fn wif_rejects_garbage() {
		assert!(decode_wif("not-a-key").is_err());
		assert!(decode_wif("5JdeC9P7Pbd1uGdFVEsJ41EkEnA").is_err());
	}
}
