//! BIP84 receive address derivation
//!
//! Derives single-use SegWit (P2WPKH) receive addresses from the
//! platform's extended private key, one address per donation attempt.
//! Derivation is pure: the same (key, index, network) always yields the
//! same address, and no state is touched.
//!
//! Accepted keys are BIP84-flavored extended private keys: `zprv`
//! (mainnet, version bytes 0x04B2430C) and `vprv` (testnet, version
//! bytes 0x045F18BC). Keys exported at any depth between master and
//! account level are handled; depth 1 is treated as already being at
//! the account level (Electrum exports such keys).

use bitcoin::base58;
use bitcoin::bip32::{ChainCode, ChildNumber, Fingerprint, Xpriv};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, Network, NetworkKind};

/// Version bytes for a BIP84 mainnet extended private key (zprv)
const VERSION_ZPRV: [u8; 4] = [0x04, 0xB2, 0x43, 0x0C];
/// Version bytes for a BIP84 testnet extended private key (vprv)
const VERSION_VPRV: [u8; 4] = [0x04, 0x5F, 0x18, 0xBC];

/// Serialized extended key payload length after the base58 checksum
const XKEY_PAYLOAD_LEN: usize = 78;

/// Errors from address derivation
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    /// The extended key is malformed or does not match the network
    #[error("invalid extended key format: {0}")]
    InvalidKeyFormat(String),

    /// The extended key depth is not between master and account level
    #[error("unsupported extended key depth: {0}")]
    InvalidKeyDepth(u8),

    /// Child derivation produced an invalid scalar. Extremely rare;
    /// callers should retry with the next index.
    #[error("child derivation failed: {0}")]
    DerivationFailure(String),
}

/// Derive the P2WPKH receive address at `m/84'/0'/0'/0/{index}`.
///
/// The key may be a master key (depth 0), a purpose- or coin-level key
/// (depths 1-2), or an account-level key (depth 3); derivation picks up
/// from wherever the key sits on the BIP84 path.
pub fn derive_address(xkey: &str, index: u32, network: Network) -> Result<String, WalletError> {
    let node = parse_extended_key(xkey, network)?;

    // Remaining hardened steps down to the account level, by depth.
    // Depth 1 keys are treated as account-level (Electrum quirk).
    let mut path: Vec<ChildNumber> = match node.depth {
        0 => vec![hardened(84)?, hardened(0)?, hardened(0)?],
        1 => vec![],
        2 => vec![hardened(0)?],
        3 => vec![],
        d => return Err(WalletError::InvalidKeyDepth(d)),
    };

    // External (receiving) chain, then the requested index
    path.push(
        ChildNumber::from_normal_idx(0)
            .map_err(|e| WalletError::DerivationFailure(e.to_string()))?,
    );
    path.push(
        ChildNumber::from_normal_idx(index)
            .map_err(|e| WalletError::DerivationFailure(e.to_string()))?,
    );

    let secp = Secp256k1::new();
    let child = node
        .derive_priv(&secp, &path)
        .map_err(|e| WalletError::DerivationFailure(e.to_string()))?;

    let pubkey = CompressedPublicKey(child.private_key.public_key(&secp));
    Ok(Address::p2wpkh(&pubkey, network).to_string())
}

/// Decode a base58check zprv/vprv string into an HD node.
///
/// Layout of the 78-byte payload: 4 B version, 1 B depth, 4 B parent
/// fingerprint, 4 B child number, 32 B chain code, 33 B key data
/// (0x00 prefix + 32 B private key).
fn parse_extended_key(xkey: &str, network: Network) -> Result<Xpriv, WalletError> {
    let payload = base58::decode_check(xkey)
        .map_err(|e| WalletError::InvalidKeyFormat(e.to_string()))?;

    if payload.len() != XKEY_PAYLOAD_LEN {
        return Err(WalletError::InvalidKeyFormat(format!(
            "expected {} byte payload, got {}",
            XKEY_PAYLOAD_LEN,
            payload.len()
        )));
    }

    let expected_version = match network {
        Network::Bitcoin => VERSION_ZPRV,
        _ => VERSION_VPRV,
    };
    if payload[0..4] != expected_version {
        return Err(WalletError::InvalidKeyFormat(format!(
            "version bytes do not match a BIP84 private key for {}",
            network
        )));
    }

    let depth = payload[4];
    if depth > 3 {
        return Err(WalletError::InvalidKeyDepth(depth));
    }

    let mut fingerprint = [0u8; 4];
    fingerprint.copy_from_slice(&payload[5..9]);
    let mut child_bytes = [0u8; 4];
    child_bytes.copy_from_slice(&payload[9..13]);
    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(&payload[13..45]);

    if payload[45] != 0x00 {
        return Err(WalletError::InvalidKeyFormat(
            "key data is not a private key".to_string(),
        ));
    }
    let private_key = SecretKey::from_slice(&payload[46..78])
        .map_err(|e| WalletError::InvalidKeyFormat(e.to_string()))?;

    Ok(Xpriv {
        network: match network {
            Network::Bitcoin => NetworkKind::Main,
            _ => NetworkKind::Test,
        },
        depth,
        parent_fingerprint: Fingerprint::from(fingerprint),
        child_number: ChildNumber::from(u32::from_be_bytes(child_bytes)),
        private_key,
        chain_code: ChainCode::from(chain_code),
    })
}

fn hardened(index: u32) -> Result<ChildNumber, WalletError> {
    ChildNumber::from_hardened_idx(index)
        .map_err(|e| WalletError::DerivationFailure(e.to_string()))
}

/// Structural bech32 shape check for client-supplied addresses.
///
/// Prefix must match the configured network, total length must fall in
/// [42, 90], and the data part must stick to the bech32 charset (which
/// excludes `1`, `b`, `i` and `o`). The checksum is not verified;
/// explorers reject addresses that fail it.
pub fn is_valid_address_shape(address: &str, network: Network) -> bool {
    let prefix = match network {
        Network::Bitcoin => "bc1",
        _ => "tb1",
    };
    if !address.starts_with(prefix) {
        return false;
    }
    if address.len() < 42 || address.len() > 90 {
        return false;
    }
    address[prefix.len()..].chars().all(|c| {
        c.is_ascii_lowercase() && c != 'b' && c != 'i' && c != 'o'
            || c.is_ascii_digit() && c != '1'
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vectors from the BIP84 document (mnemonic "abandon ...
    // about"): the master key and the account 0 key derive the same
    // first receiving addresses.
    const MASTER_ZPRV: &str = "zprvAWgYBBk7JR8Gjrh4UJQ2uJdG1r3WNRRfURiABBE3RvMXYSrRJL62XuezvGdPvG6GFBZduosCc1YP5wixPox7zhZLfiUm8aUnE1Wcqw5ZahGz3";
    const ACCOUNT_ZPRV: &str = "zprvAdG4iTXWBoARxkkzNpNh8r6Qag3irQB8PzEMkAFeTRXxHpbF9z4QgEvBRmfvqWvGp42t42nvgGpNgYSJA9iefm1yYNZKEm7z6qUWCroSQnE";
    const ADDR_0: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
    const ADDR_1: &str = "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g";

    #[test]
    fn test_derive_from_master_key() {
        let addr = derive_address(MASTER_ZPRV, 0, Network::Bitcoin).unwrap();
        assert_eq!(addr, ADDR_0);
        let addr = derive_address(MASTER_ZPRV, 1, Network::Bitcoin).unwrap();
        assert_eq!(addr, ADDR_1);
    }

    #[test]
    fn test_derive_from_account_key() {
        // Depth-3 key picks up below the account level
        let addr = derive_address(ACCOUNT_ZPRV, 0, Network::Bitcoin).unwrap();
        assert_eq!(addr, ADDR_0);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_address(MASTER_ZPRV, 7, Network::Bitcoin).unwrap();
        let b = derive_address(MASTER_ZPRV, 7, Network::Bitcoin).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_indices_distinct_addresses() {
        let mut seen = std::collections::HashSet::new();
        for index in 0..16 {
            let addr = derive_address(MASTER_ZPRV, index, Network::Bitcoin).unwrap();
            assert!(seen.insert(addr), "index {} repeated an address", index);
        }
    }

    #[test]
    fn test_network_mismatch_rejected() {
        let err = derive_address(MASTER_ZPRV, 0, Network::Testnet).unwrap_err();
        assert!(matches!(err, WalletError::InvalidKeyFormat(_)));
    }

    #[test]
    fn test_garbage_key_rejected() {
        let err = derive_address("not-a-key", 0, Network::Bitcoin).unwrap_err();
        assert!(matches!(err, WalletError::InvalidKeyFormat(_)));
    }

    #[test]
    fn test_excessive_depth_rejected() {
        // Re-encode the master key with a patched depth byte
        let mut payload = base58::decode_check(MASTER_ZPRV).unwrap();
        payload[4] = 4;
        let patched = base58::encode_check(&payload);
        let err = derive_address(&patched, 0, Network::Bitcoin).unwrap_err();
        assert!(matches!(err, WalletError::InvalidKeyDepth(4)));
    }

    #[test]
    fn test_address_shape_accepts_valid() {
        assert!(is_valid_address_shape(ADDR_0, Network::Bitcoin));
        assert!(is_valid_address_shape(
            "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx",
            Network::Testnet
        ));
    }

    #[test]
    fn test_address_shape_rejects_wrong_network() {
        assert!(!is_valid_address_shape(ADDR_0, Network::Testnet));
    }

    #[test]
    fn test_address_shape_rejects_bad_charset() {
        // 'b' and 'i' and 'o' and '1' are not bech32 data characters
        assert!(!is_valid_address_shape(
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8zbbbbbb",
            Network::Bitcoin
        ));
        // Uppercase is rejected outright
        assert!(!is_valid_address_shape(
            "bc1QCR8TE4KR609GCAWUTMRZA0J4XV80JY8Z306FYU",
            Network::Bitcoin
        ));
    }

    #[test]
    fn test_address_shape_rejects_bad_length() {
        assert!(!is_valid_address_shape("bc1qshort", Network::Bitcoin));
    }
}
