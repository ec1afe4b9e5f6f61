use crate::{
	common::{ChainFamily, Coin},
	errors::{Error, Result},
};
use hdwallet::{ExtendedPrivKey, KeyIndex};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use sha3::{Digest, Keccak256};
use zeroize::Zeroizing;

type HmacSha512 = Hmac<Sha512>;

/// Key material and rendered address for one `(coin, index)` slot.
pub struct DerivedKeys {
	pub secret: Zeroizing<[u8; 32]>,
	/// Compressed secp256k1 key (hex) or ed25519 key (base58).
	pub public_key: String,
	pub address: String,
	pub derivation_path: String,
	pub address_type: String,
}

/// Deterministically derive the deposit keys for `(coin, index)` from the
/// process-wide master seed. secp256k1 coins follow BIP44; Solana follows
/// SLIP-0010 over ed25519.
pub fn derive(coin: Coin, master_seed: &[u8; 32], index: u32) -> Result<DerivedKeys> {
	let info = coin.get_info();
	match info.family {
		ChainFamily::Solana => derive_ed25519(master_seed, index),
		_ => derive_secp256k1(coin, master_seed, index),
	}
}

fn derive_secp256k1(coin: Coin, master_seed: &[u8; 32], index: u32) -> Result<DerivedKeys> {
	let info = coin.get_info();
	let path = format!("m/44'/{}'/0'/0/{}", info.bip44_coin_type, index);

	let master = ExtendedPrivKey::with_seed(master_seed)
		.map_err(|_| Error::Integrity("master seed rejected by key derivation".to_string()))?;
	let steps = [
		KeyIndex::hardened_from_normalize_index(44),
		KeyIndex::hardened_from_normalize_index(info.bip44_coin_type),
		KeyIndex::hardened_from_normalize_index(0),
		Ok(KeyIndex::Normal(0)),
		Ok(KeyIndex::Normal(index)),
	];
	let mut child = master;
	for step in steps {
		let key_index =
			step.map_err(|_| Error::Internal("invalid hardened key index".to_string()))?;
		child = child
			.derive_private_key(key_index)
			.map_err(|_| Error::Internal(format!("key derivation failed for {}", path)))?;
	}

	let secret = Zeroizing::new(child.private_key.secret_bytes());

	let secp = secp256k1::Secp256k1::new();
	let secret_key = secp256k1::SecretKey::from_slice(secret.as_ref())
		.map_err(|_| Error::Integrity("derived key out of range".to_string()))?;
	let public = secp256k1::PublicKey::from_secret_key(&secp, &secret_key);

	let (address, address_type) = match info.family {
		ChainFamily::Utxo => (btc_p2wpkh_address(&public)?, "p2wpkh".to_string()),
		_ => (evm_address(&public), "eoa".to_string()),
	};

	Ok(DerivedKeys {
		secret,
		public_key: hex::encode(public.serialize()),
		address,
		derivation_path: path,
		address_type,
	})
}

fn btc_p2wpkh_address(public: &secp256k1::PublicKey) -> Result<String> {
	let pubkey = bitcoin::PublicKey {
		compressed: true,
		inner: bitcoin::secp256k1::PublicKey::from_slice(&public.serialize())
			.map_err(|_| Error::Internal("public key round trip failed".to_string()))?,
	};
	bitcoin::Address::p2wpkh(&pubkey, bitcoin::Network::Bitcoin)
		.map(|a| a.to_string())
		.map_err(|e| Error::Internal(format!("p2wpkh address: {}", e)))
}

/// Keccak-256 of the uncompressed key, last 20 bytes, EIP-55 checksummed.
fn evm_address(public: &secp256k1::PublicKey) -> String {
	let uncompressed = public.serialize_uncompressed();
	let digest = Keccak256::digest(&uncompressed[1..]);
	eip55_checksum(&digest[12..])
}

fn eip55_checksum(address_bytes: &[u8]) -> String {
	let lower = hex::encode(address_bytes);
	let digest = Keccak256::digest(lower.as_bytes());
	let mut out = String::with_capacity(42);
	out.push_str("0x");
	for (i, c) in lower.chars().enumerate() {
		let nibble = (digest[i / 2] >> (4 * (1 - i % 2))) & 0x0f;
		if c.is_ascii_alphabetic() && nibble >= 8 {
			out.push(c.to_ascii_uppercase());
		} else {
			out.push(c);
		}
	}
	out
}

/// SLIP-0010 ed25519 derivation along `m/44'/501'/{index}'/0'` (every step
/// hardened; ed25519 has no normal children).
fn derive_ed25519(master_seed: &[u8; 32], index: u32) -> Result<DerivedKeys> {
	let path = format!("m/44'/501'/{}'/0'", index);

	let mut mac = HmacSha512::new_from_slice(b"ed25519 seed")
		.map_err(|_| Error::Internal("hmac init".to_string()))?;
	mac.update(master_seed);
	let i = mac.finalize().into_bytes();
	let mut key: [u8; 32] = i[..32].try_into().unwrap();
	let mut chain_code: [u8; 32] = i[32..].try_into().unwrap();

	for step in [44u32, 501, index, 0] {
		let hardened = 0x8000_0000u32 | step;
		let mut mac = HmacSha512::new_from_slice(&chain_code)
			.map_err(|_| Error::Internal("hmac init".to_string()))?;
		mac.update(&[0u8]);
		mac.update(&key);
		mac.update(&hardened.to_be_bytes());
		let i = mac.finalize().into_bytes();
		key = i[..32].try_into().unwrap();
		chain_code = i[32..].try_into().unwrap();
	}

	let signing_key = ed25519_dalek::SigningKey::from_bytes(&key);
	let public = signing_key.verifying_key();
	let address = bs58::encode(public.as_bytes()).into_string();

	Ok(DerivedKeys {
		secret: Zeroizing::new(key),
		public_key: address.clone(),
		address,
		derivation_path: path,
		address_type: "ed25519".to_string(),
	})
}
