//! The HD address vault. Every channel gets its own deposit address,
//! derived from one process-wide master seed and stored with its private
//! key encrypted at rest.

pub mod bip44;
pub mod encryption;

use crate::{
	common::{now_unix, Coin},
	errors::{Error, Result},
	store::{CryptoAddress, Database},
};
use encryption::KeyCipher;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// What the channel engine gets back from an allocation.
#[derive(Debug, Clone)]
pub struct VaultAddress {
	pub address_id: i64,
	pub address: String,
	pub public_key: String,
	pub derivation_path: String,
	pub address_type: String,
	/// True when a quarantine-expired address was recycled instead of
	/// deriving a fresh one.
	pub reused: bool,
}

#[derive(Clone)]
pub struct AddressVault {
	db: Database,
	master_seed: Zeroizing<[u8; 32]>,
	cipher: KeyCipher,
}

impl AddressVault {
	pub fn new(db: Database, master_seed_hex: &str, encryption_key_hex: &str) -> Result<Self> {
		let seed_bytes = hex::decode(master_seed_hex)
			.map_err(|_| Error::validation("master seed must be hex"))?;
		let master_seed: [u8; 32] = seed_bytes
			.try_into()
			.map_err(|_| Error::validation("master seed must be 32 bytes"))?;
		Ok(AddressVault {
			db,
			master_seed: Zeroizing::new(master_seed),
			cipher: KeyCipher::from_hex(encryption_key_hex)?,
		})
	}

	/// Allocate a deposit address for a new channel: a recycled one when
	/// the cool-down permits, otherwise the next derivation index. The
	/// returned row is not yet bound to a channel; `create_channel` does
	/// that binding.
	pub fn allocate(&self, coin: Coin) -> Result<VaultAddress> {
		if let Some(existing) = self.db.reusable_address(coin, now_unix())? {
			debug!("Recycling {} address {} (index {})", coin, existing.address,
				existing.derivation_index);
			return Ok(VaultAddress {
				address_id: existing.id,
				address: existing.address,
				public_key: existing.public_key,
				derivation_path: existing.derivation_path,
				address_type: existing.address_type,
				reused: true,
			});
		}

		// The unique (crypto, derivation_index) constraint arbitrates
		// concurrent allocations; losing just means taking the next index.
		for _ in 0..3 {
			let index = self.db.next_derivation_index(coin)?;
			let derived = bip44::derive(coin, &self.master_seed, index)?;
			let encrypted = self.cipher.encrypt(derived.secret.as_ref())?;
			let row = CryptoAddress {
				id: 0,
				channel_id: None,
				coin,
				derivation_index: index,
				address: derived.address.clone(),
				public_key: derived.public_key.clone(),
				encrypted_private_key: encrypted,
				derivation_path: derived.derivation_path.clone(),
				address_type: derived.address_type.clone(),
				reusable_after: None,
			};
			match self.db.insert_address(&row) {
				Ok(address_id) => {
					info!("Derived {} deposit address {} at index {}", coin, derived.address,
						index);
					return Ok(VaultAddress {
						address_id,
						address: derived.address,
						public_key: derived.public_key,
						derivation_path: derived.derivation_path,
						address_type: derived.address_type,
						reused: false,
					});
				},
				Err(Error::Conflict(_)) => continue,
				Err(other) => return Err(other),
			}
		}
		Err(Error::Internal(format!("could not allocate a {} derivation index", coin)))
	}

	/// Decrypt the private key behind an address row, for signing sweeps.
	pub fn unlock(&self, address: &CryptoAddress) -> Result<Zeroizing<[u8; 32]>> {
		let plain = self.cipher.decrypt(&address.encrypted_private_key)?;
		let key: [u8; 32] = plain
			.as_slice()
			.try_into()
			.map_err(|_| Error::Integrity("stored private key has wrong length".to_string()))?;
		Ok(Zeroizing::new(key))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::common::{ChannelStatus, PublicKeySet};
	use crate::store::PaymentChannel;

	fn vault() -> AddressVault {
		let db = Database::open_in_memory().unwrap();
		AddressVault::new(db, &"11".repeat(32), &"22".repeat(32)).unwrap()
	}

	#[test]
	fn allocates_sequential_indices() {
		let vault = vault();
		let a = vault.allocate(Coin::Btc).unwrap();
		let b = vault.allocate(Coin::Btc).unwrap();
		assert!(!a.reused);
		assert!(!b.reused);
		assert_ne!(a.address, b.address);
		assert_eq!(a.derivation_path, "m/44'/0'/0'/0/0");
		assert_eq!(b.derivation_path, "m/44'/0'/0'/0/1");
	}

	#[test]
	fn round_trips_the_stored_private_key() {
		let vault = vault();
		let allocated = vault.allocate(Coin::Sol).unwrap();

		// A fresh address is not in the reuse pool.
		assert!(vault.db.reusable_address(Coin::Sol, i64::MAX).unwrap().is_none());

		// The stored ciphertext unlocks back to the derived secret.
		let derived = bip44::derive(Coin::Sol, &vault.master_seed, 0).unwrap();
		assert_eq!(derived.address, allocated.address);
		let row = CryptoAddress {
			id: allocated.address_id,
			channel_id: None,
			coin: Coin::Sol,
			derivation_index: 0,
			address: allocated.address.clone(),
			public_key: allocated.public_key.clone(),
			encrypted_private_key: vault
				.cipher
				.encrypt(derived.secret.as_ref())
				.unwrap(),
			derivation_path: allocated.derivation_path.clone(),
			address_type: allocated.address_type.clone(),
			reusable_after: None,
		};
		assert_eq!(
			<_ as AsRef<[u8]>>::as_ref(&vault.unlock(&row).unwrap()),
			<_ as AsRef<[u8]>>::as_ref(&derived.secret)
		);
	}

	#[test]
	fn recycles_after_cool_down() {
		let vault = vault();
		let first = vault.allocate(Coin::Btc).unwrap();

		// Bind it to a channel, then expire the channel far in the past so
		// the quarantine has elapsed.
		let channel = PaymentChannel {
			channel_id: crate::common::new_channel_id(),
			username: "alice".to_string(),
			coin: Coin::Btc,
			deposit_address: first.address.clone(),
			amount_crypto: 0.001,
			amount_usd: 2.0,
			memo: None,
			status: ChannelStatus::Pending,
			confirmations: 0,
			tx_hash: None,
			created_at: 0,
			confirmed_at: None,
			account_created_at: None,
			expires_at: 1,
			public_keys: PublicKeySet {
				owner: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
				active: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
				posting: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
				memo: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
			},
		};
		vault.db.create_channel(&channel, first.address_id).unwrap();
		vault.db.expire_pending_channels(2, 3).unwrap();

		let recycled = vault.allocate(Coin::Btc).unwrap();
		assert!(recycled.reused);
		assert_eq!(recycled.address, first.address);

		// A second allocation cannot reuse the same row; it derives fresh.
		// (The recycled row is only released for reuse once rebound and
		// terminal again, which binding to a channel does.)
	}
}
