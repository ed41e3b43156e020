use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, Network, NetworkKind};
use std::str::FromStr;
use tracing::info;
use zeroize::Zeroize;

use crate::error::{CustodyError, Result};

/// BIP44 account branch every deposit address lives under; the last step is the trader's index
pub const DERIVATION_BRANCH: &str = "m/44'/0'/0'/0";

/// Environment variables holding the master extended private key
pub const MASTER_KEY_ENV: &str = "CUSTODIAN_MASTER_XPRV";
pub const LEGACY_MASTER_KEY_ENV: &str = "BTC_XPRV";

/// Key material for one derivation index.
///
/// Lives only for the duration of a single signing operation; the secret is
/// erased on drop.
pub struct DerivedKey {
    pub index: u32,
    pub address: Address,
    pub public_key: CompressedPublicKey,
    secret_key: SecretKey,
}

impl DerivedKey {
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.secret_key.non_secure_erase();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("index", &self.index)
            .field("address", &self.address)
            .finish()
    }
}

/// Deterministic index → (address, signing key) derivation from one master key.
///
/// The same master key and index always produce the same P2WPKH address and
/// key; deposits already sent to an address can only be spent as long as this
/// holds.
#[derive(Clone)]
pub struct KeyDerivation {
    master: Xpriv,
    branch: DerivationPath,
    network: Network,
    secp: Secp256k1<All>,
}

impl KeyDerivation {
    /// Parse a base58 `xprv`/`tprv` and bind it to `network`.
    ///
    /// The master key string is not retained.
    pub fn from_xprv(xprv: &str, network: Network) -> Result<Self> {
        let master = Xpriv::from_str(xprv.trim())
            .map_err(|e| CustodyError::KeyDerivation(format!("Invalid master key: {}", e)))?;

        if master.network != NetworkKind::from(network) {
            return Err(CustodyError::KeyDerivation(format!(
                "Master key network {:?} does not match configured network {}",
                master.network, network
            )));
        }

        let branch = DerivationPath::from_str(DERIVATION_BRANCH)
            .map_err(|e| CustodyError::KeyDerivation(e.to_string()))?;

        Ok(Self {
            master,
            branch,
            network,
            secp: Secp256k1::new(),
        })
    }

    /// Load the master key from the environment.
    ///
    /// The raw key string is zeroized once parsed.
    pub fn from_env(network: Network) -> Result<Self> {
        let mut xprv = std::env::var(MASTER_KEY_ENV)
            .or_else(|_| std::env::var(LEGACY_MASTER_KEY_ENV))
            .map_err(|_| {
                CustodyError::KeyDerivation(format!(
                    "{MASTER_KEY_ENV} or {LEGACY_MASTER_KEY_ENV} environment variable not set"
                ))
            })?;

        let result = Self::from_xprv(&xprv, network);
        xprv.zeroize();

        if let Ok(ref keys) = result {
            info!(
                "Master key loaded for {} (fingerprint {})",
                network,
                keys.master.fingerprint(&keys.secp)
            );
        }
        result
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Full derivation path for an index
    pub fn path(&self, index: u32) -> Result<DerivationPath> {
        let child = ChildNumber::from_normal_idx(index).map_err(|e| {
            CustodyError::KeyDerivation(format!("Index {} out of derivation range: {}", index, e))
        })?;
        Ok(self.branch.child(child))
    }

    /// Derive the deposit address and signing key for `index`.
    pub fn derive(&self, index: u32) -> Result<DerivedKey> {
        let path = self.path(index)?;
        let child = self
            .master
            .derive_priv(&self.secp, &path)
            .map_err(|e| CustodyError::KeyDerivation(format!("Derivation of {} failed: {}", path, e)))?;

        let public_key = CompressedPublicKey(PublicKey::from_secret_key(&self.secp, &child.private_key));
        let address = Address::p2wpkh(&public_key, self.network);

        Ok(DerivedKey {
            index,
            address,
            public_key,
            secret_key: child.private_key,
        })
    }

    /// Derive only the address for `index`.
    pub fn address(&self, index: u32) -> Result<Address> {
        Ok(self.derive(index)?.address.clone())
    }
}

impl std::fmt::Debug for KeyDerivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDerivation")
            .field("branch", &self.branch)
            .field("network", &self.network)
            .finish()
    }
}
