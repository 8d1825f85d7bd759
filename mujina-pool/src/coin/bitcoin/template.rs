//! `getblocktemplate` results (BIP22/BIP23).

use std::str::FromStr;

use bitcoin::pow::CompactTarget;
use bitcoin::{BlockHash, Txid};
use serde::Deserialize;

use crate::coin::CoinError;

/// The parts of a block template the pool uses.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub version: i32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    /// Compact target, hex.
    pub bits: String,
    pub height: u64,
    #[serde(rename = "curtime")]
    pub current_time: u32,
    /// Script of the segwit commitment output, hex.
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
    #[serde(rename = "longpollid", default)]
    pub longpoll_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    /// Serialized transaction, hex.
    pub data: String,
    /// Transaction id in display byte order.
    pub txid: String,
}

impl BlockTemplate {
    pub fn prev_hash(&self) -> Result<BlockHash, CoinError> {
        BlockHash::from_str(&self.previous_block_hash)
            .map_err(|e| CoinError::InvalidTemplate(format!("previousblockhash: {}", e)))
    }

    pub fn bits(&self) -> Result<CompactTarget, CoinError> {
        u32::from_str_radix(&self.bits, 16)
            .map(CompactTarget::from_consensus)
            .map_err(|e| CoinError::InvalidTemplate(format!("bits: {}", e)))
    }

    pub fn txids(&self) -> Result<Vec<Txid>, CoinError> {
        self.transactions
            .iter()
            .map(|tx| {
                Txid::from_str(&tx.txid)
                    .map_err(|e| CoinError::InvalidTemplate(format!("txid {}: {}", tx.txid, e)))
            })
            .collect()
    }

    pub fn witness_commitment(&self) -> Result<Option<Vec<u8>>, CoinError> {
        self.default_witness_commitment
            .as_deref()
            .map(|script| {
                hex::decode(script).map_err(|e| {
                    CoinError::InvalidTemplate(format!("default_witness_commitment: {}", e))
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_template() {
        let template: BlockTemplate = serde_json::from_value(json!({
            "version": 536870912,
            "previousblockhash": "000000000000000000015296bc96391d0d67f4a301f2d4fc6db962c16b6455fd",
            "transactions": [{
                "data": "00",
                "txid": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
                "hash": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
                "fee": 1000,
            }],
            "coinbasevalue": 312500000,
            "bits": "17034219",
            "height": 840000,
            "curtime": 1713571767,
            "longpollid": "0000abc1",
            "rules": ["csv", "!segwit", "taproot"],
        }))
        .unwrap();

        assert_eq!(template.height, 840_000);
        assert_eq!(template.bits().unwrap().to_consensus(), 0x17034219);
        assert_eq!(template.txids().unwrap().len(), 1);
        assert_eq!(template.witness_commitment().unwrap(), None);
        assert_eq!(
            template.prev_hash().unwrap().to_string(),
            "000000000000000000015296bc96391d0d67f4a301f2d4fc6db962c16b6455fd"
        );
    }

    #[test]
    fn test_bad_bits() {
        let template: BlockTemplate = serde_json::from_value(json!({
            "version": 4,
            "previousblockhash": "00".repeat(32),
            "coinbasevalue": 1,
            "bits": "zz",
            "height": 1,
            "curtime": 1,
        }))
        .unwrap();
        assert!(matches!(template.bits(), Err(CoinError::InvalidTemplate(_))));
    }
}
