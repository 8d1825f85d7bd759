//! Coinbase transaction split around the extranonce.
//!
//! The coinbase is serialized without witness data (its txid is what goes
//! into the merkle tree) and cut where the extranonces sit in the input
//! script:
//!
//! ```text
//! coinbase1: version | 1 input | null prevout | script len | height push
//! (gap):     extranonce1 | extranonce2
//! coinbase2: signature push | sequence | outputs | locktime
//! ```

use bitcoin::consensus::encode::{VarInt, serialize};
use bitcoin::hashes::{Hash, sha256d};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, Txid, Witness};

use crate::coin::CoinError;

/// Consensus limit on the coinbase input script.
const MAX_SCRIPT_SIG_LEN: usize = 100;

const TX_VERSION: u32 = 2;

/// Everything needed to split one template's coinbase.
#[derive(Debug, Clone)]
pub struct CoinbaseBuilder<'a> {
    pub height: u64,
    pub value: u64,
    pub payout_script: &'a ScriptBuf,
    /// Combined size of extranonce1 and extranonce2.
    pub extranonce_size: usize,
    pub signature: &'a [u8],
    pub witness_commitment: Option<&'a [u8]>,
}

/// The two halves of a coinbase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseParts {
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
}

impl CoinbaseBuilder<'_> {
    pub fn build(&self) -> Result<CoinbaseParts, CoinError> {
        let height_push = Builder::new()
            .push_int(self.height as i64)
            .into_script()
            .into_bytes();

        let signature_push = self.signature_push()?;

        let script_len = height_push.len() + self.extranonce_size + signature_push.len();
        if script_len > MAX_SCRIPT_SIG_LEN {
            return Err(CoinError::InvalidTemplate(format!(
                "coinbase script of {} bytes exceeds {}",
                script_len, MAX_SCRIPT_SIG_LEN
            )));
        }

        let mut coinbase1 = Vec::with_capacity(64);
        coinbase1.extend_from_slice(&TX_VERSION.to_le_bytes());
        coinbase1.push(1);
        coinbase1.extend_from_slice(&[0u8; 32]);
        coinbase1.extend_from_slice(&u32::MAX.to_le_bytes());
        coinbase1.extend(serialize(&VarInt(script_len as u64)));
        coinbase1.extend_from_slice(&height_push);

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(self.value),
            script_pubkey: self.payout_script.clone(),
        }];
        if let Some(commitment) = self.witness_commitment {
            outputs.push(TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::from_bytes(commitment.to_vec()),
            });
        }

        let mut coinbase2 = signature_push;
        coinbase2.extend_from_slice(&u32::MAX.to_le_bytes());
        coinbase2.extend(serialize(&VarInt(outputs.len() as u64)));
        for output in &outputs {
            coinbase2.extend(serialize(output));
        }
        coinbase2.extend_from_slice(&0u32.to_le_bytes());

        Ok(CoinbaseParts {
            coinbase1,
            coinbase2,
        })
    }

    fn signature_push(&self) -> Result<Vec<u8>, CoinError> {
        if self.signature.is_empty() {
            return Ok(Vec::new());
        }
        let data = PushBytesBuf::try_from(self.signature.to_vec())
            .map_err(|e| CoinError::InvalidTemplate(format!("coinbase signature: {}", e)))?;
        Ok(Builder::new().push_slice(data).into_script().into_bytes())
    }
}

impl CoinbaseParts {
    /// Legacy serialization of the coinbase with the miner's extranonces.
    pub fn assemble(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            self.coinbase1.len() + extranonce1.len() + extranonce2.len() + self.coinbase2.len(),
        );
        bytes.extend_from_slice(&self.coinbase1);
        bytes.extend_from_slice(extranonce1);
        bytes.extend_from_slice(extranonce2);
        bytes.extend_from_slice(&self.coinbase2);
        bytes
    }
}

/// Hash of a legacy-serialized coinbase, internal byte order.
pub fn coinbase_hash(bytes: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(bytes).to_byte_array()
}

pub fn coinbase_txid(bytes: &[u8]) -> Txid {
    Txid::from_raw_hash(sha256d::Hash::hash(bytes))
}

/// The coinbase as it appears in a block. With a witness commitment the
/// input carries the 32-byte reserved value as its witness.
pub fn block_coinbase(bytes: &[u8], segwit: bool) -> Result<Transaction, CoinError> {
    let mut tx: Transaction = bitcoin::consensus::deserialize(bytes)
        .map_err(|e| CoinError::Serialization(format!("coinbase: {}", e)))?;
    if segwit {
        if let Some(input) = tx.input.first_mut() {
            input.witness = Witness::from_slice(&[[0u8; 32]]);
        }
    }
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::address::NetworkUnchecked;
    use bitcoin::{Address, Network};

    fn payout() -> ScriptBuf {
        "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080"
            .parse::<Address<NetworkUnchecked>>()
            .unwrap()
            .require_network(Network::Regtest)
            .unwrap()
            .script_pubkey()
    }

    fn builder<'a>(script: &'a ScriptBuf, commitment: Option<&'a [u8]>) -> CoinbaseBuilder<'a> {
        CoinbaseBuilder {
            height: 840_000,
            value: 312_500_000,
            payout_script: script,
            extranonce_size: 8,
            signature: b"/mujina/",
            witness_commitment: commitment,
        }
    }

    #[test]
    fn test_assembled_coinbase_parses() {
        let script = payout();
        let parts = builder(&script, None).build().unwrap();
        let bytes = parts.assemble(&[0xaa; 4], &[0xbb; 4]);

        let tx: Transaction = bitcoin::consensus::deserialize(&bytes).unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, Amount::from_sat(312_500_000));
        assert_eq!(tx.output[0].script_pubkey, script);

        let script_sig = tx.input[0].script_sig.as_bytes();
        assert!(
            script_sig
                .windows(8)
                .any(|w| w == [0xaa, 0xaa, 0xaa, 0xaa, 0xbb, 0xbb, 0xbb, 0xbb])
        );
        assert!(script_sig.ends_with(b"/mujina/"));
    }

    #[test]
    fn test_height_is_first_push() {
        let script = payout();
        let parts = builder(&script, None).build().unwrap();
        // 840000 = 0x0cd140, pushed as three little-endian bytes.
        assert!(parts.coinbase1.ends_with(&[0x03, 0x40, 0xd1, 0x0c]));
    }

    #[test]
    fn test_witness_commitment_output() {
        let script = payout();
        let commitment = hex::decode(
            "6a24aa21a9ede2f61c3f71d1defd3fa999dfa36953755c690689799962b48bebd836974e8cf9",
        )
        .unwrap();
        let parts = builder(&script, Some(&commitment)).build().unwrap();
        let bytes = parts.assemble(&[0; 4], &[0; 4]);

        let legacy: Transaction = bitcoin::consensus::deserialize(&bytes).unwrap();
        assert_eq!(legacy.output.len(), 2);
        assert_eq!(legacy.output[1].script_pubkey.as_bytes(), commitment.as_slice());

        let tx = block_coinbase(&bytes, true).unwrap();
        assert_eq!(tx.input[0].witness.len(), 1);
        // The witness does not change the txid.
        assert_eq!(tx.compute_txid(), coinbase_txid(&bytes));
    }

    #[test]
    fn test_oversized_script_rejected() {
        let script = payout();
        let signature = [b'x'; 90];
        let builder = CoinbaseBuilder {
            signature: &signature,
            ..builder(&script, None)
        };
        assert!(matches!(builder.build(), Err(CoinError::InvalidTemplate(_))));
    }
}
