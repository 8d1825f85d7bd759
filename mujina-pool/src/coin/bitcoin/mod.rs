//! SHA256d coins built from bitcoind's `getblocktemplate`.
//!
//! Miners receive Stratum v1 work: the two coinbase halves around their
//! extranonces, the merkle branch, and the header fields. A submission
//! carries extranonce2, ntime, nonce and optionally rolled version bits,
//! which is enough to rebuild the header and hash it.

mod coinbase;
mod merkle;
mod template;

pub use template::{BlockTemplate, TemplateTransaction};

use bitcoin::address::NetworkUnchecked;
use bitcoin::block::{Header, Version};
use bitcoin::consensus::encode::{VarInt, serialize};
use bitcoin::hashes::Hash;
use bitcoin::pow::{CompactTarget, Target};
use bitcoin::{Address, BlockHash, Network, ScriptBuf, TxMerkleNode};
use serde_json::{Value, json};
use time::OffsetDateTime;

use self::coinbase::{CoinbaseBuilder, CoinbaseParts, block_coinbase, coinbase_hash, coinbase_txid};
use self::merkle::{merkle_branches, merkle_root};
use super::{
    BlockSubmission, CoinAdapter, CoinError, CoinFamily, PowOutcome, PreparedWork, SubmitRequest,
    Submission,
};
use crate::job::{Job, TemplateIdentity};
use crate::share::ShareError;
use crate::types::DifficultyMath;
use crate::u256::U256;

/// How far ahead of the pool's clock a submitted ntime may be, in seconds.
const MAX_NTIME_DRIFT: i64 = 7200;

/// Work for one template.
#[derive(Debug)]
pub struct BitcoinWork {
    version: i32,
    prev_hash: BlockHash,
    bits: CompactTarget,
    current_time: u32,
    coinbase: CoinbaseParts,
    merkle_branches: Vec<[u8; 32]>,
    /// Serialized template transactions, hex, in block order.
    transactions: Vec<String>,
    segwit: bool,
}

/// Submission fields of `mining.submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitcoinSubmit {
    pub extranonce1: Vec<u8>,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    pub version_bits: Option<u32>,
    pub version_mask: u32,
}

#[derive(Debug, Clone)]
pub struct BitcoinAdapter {
    network: Network,
    payout_script: ScriptBuf,
    coinbase_signature: Vec<u8>,
    /// extranonce1 plus extranonce2 bytes reserved in the coinbase.
    extranonce_size: usize,
    math: DifficultyMath,
}

impl BitcoinAdapter {
    pub fn new(
        network: Network,
        pool_address: &str,
        coinbase_signature: impl Into<Vec<u8>>,
        extranonce_size: usize,
    ) -> Result<Self, CoinError> {
        let address = parse_address(pool_address, network)
            .ok_or_else(|| CoinError::InvalidAddress(pool_address.to_string()))?;

        Ok(Self {
            network,
            payout_script: address.script_pubkey(),
            coinbase_signature: coinbase_signature.into(),
            extranonce_size,
            math: DifficultyMath::bitcoin(),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn header(&self, work: &BitcoinWork, fields: &BitcoinSubmit, root: [u8; 32]) -> Header {
        let mut version = work.version as u32;
        if let Some(bits) = fields.version_bits {
            version = (version & !fields.version_mask) | (bits & fields.version_mask);
        }

        Header {
            version: Version::from_consensus(version as i32),
            prev_blockhash: work.prev_hash,
            merkle_root: TxMerkleNode::from_byte_array(root),
            time: fields.ntime,
            bits: work.bits,
            nonce: fields.nonce,
        }
    }
}

fn parse_address(address: &str, network: Network) -> Option<Address> {
    address
        .parse::<Address<NetworkUnchecked>>()
        .ok()?
        .require_network(network)
        .ok()
}

/// Previous block hash as Stratum sends it: internal byte order with each
/// 4-byte word reversed.
fn stratum_prev_hash(hash: &BlockHash) -> String {
    let mut bytes = hash.to_byte_array();
    for word in bytes.chunks_exact_mut(4) {
        word.reverse();
    }
    hex::encode(bytes)
}

fn str_param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str, ShareError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| ShareError::malformed(format!("missing {}", name)))
}

fn hex_u32(value: &str, name: &str) -> Result<u32, ShareError> {
    if value.len() != 8 {
        return Err(ShareError::malformed(format!("incorrect size of {}", name)));
    }
    u32::from_str_radix(value, 16).map_err(|_| ShareError::malformed(format!("invalid {}", name)))
}

impl CoinAdapter for BitcoinAdapter {
    type Template = BlockTemplate;
    type Work = BitcoinWork;
    type SubmitFields = BitcoinSubmit;

    fn family(&self) -> CoinFamily {
        CoinFamily::Bitcoin
    }

    fn difficulty_math(&self) -> DifficultyMath {
        self.math
    }

    fn validate_address(&self, address: &str) -> bool {
        parse_address(address, self.network).is_some()
    }

    fn parse_template(&self, raw: &Value) -> Result<BlockTemplate, CoinError> {
        serde_json::from_value(raw.clone()).map_err(|e| CoinError::InvalidTemplate(e.to_string()))
    }

    fn template_identity(&self, template: &BlockTemplate) -> TemplateIdentity {
        TemplateIdentity {
            height: template.height,
            prev_hash: template.previous_block_hash.clone(),
        }
    }

    fn long_poll_id(&self, template: &BlockTemplate) -> Option<String> {
        template.longpoll_id.clone()
    }

    fn build_job(&self, template: BlockTemplate) -> Result<PreparedWork<BitcoinWork>, CoinError> {
        let prev_hash = template.prev_hash()?;
        let bits = template.bits()?;
        let commitment = template.witness_commitment()?;
        let txids: Vec<[u8; 32]> = template
            .txids()?
            .iter()
            .map(|txid| txid.to_byte_array())
            .collect();

        let coinbase = CoinbaseBuilder {
            height: template.height,
            value: template.coinbase_value,
            payout_script: &self.payout_script,
            extranonce_size: self.extranonce_size,
            signature: &self.coinbase_signature,
            witness_commitment: commitment.as_deref(),
        }
        .build()?;

        let target = Target::from_compact(bits);

        Ok(PreparedWork {
            network_target: U256::from_le_bytes(target.to_le_bytes()),
            work: BitcoinWork {
                version: template.version,
                prev_hash,
                bits,
                current_time: template.current_time,
                coinbase,
                merkle_branches: merkle_branches(&txids),
                transactions: template.transactions.into_iter().map(|tx| tx.data).collect(),
                segwit: commitment.is_some(),
            },
        })
    }

    fn notify_params(&self, job: &Job<BitcoinWork>, clean_jobs: bool) -> Value {
        let work = job.work();
        let branches: Vec<String> = work.merkle_branches.iter().map(hex::encode).collect();

        json!([
            job.id(),
            stratum_prev_hash(&work.prev_hash),
            hex::encode(&work.coinbase.coinbase1),
            hex::encode(&work.coinbase.coinbase2),
            branches,
            format!("{:08x}", work.version as u32),
            format!("{:08x}", work.bits.to_consensus()),
            format!("{:08x}", work.current_time),
            clean_jobs,
        ])
    }

    fn parse_submission(
        &self,
        request: &SubmitRequest<'_>,
    ) -> Result<Submission<BitcoinSubmit>, ShareError> {
        let params = request.params;
        if params.len() < 5 {
            return Err(ShareError::malformed("incorrect number of parameters"));
        }

        str_param(params, 0, "worker")?;
        let job_id = str_param(params, 1, "job id")?;

        let extranonce2_hex = str_param(params, 2, "extranonce2")?;
        if extranonce2_hex.len() != request.extranonce2_size * 2 {
            return Err(ShareError::malformed("incorrect size of extranonce2"));
        }
        let extranonce2 = hex::decode(extranonce2_hex)
            .map_err(|_| ShareError::malformed("invalid extranonce2"))?;

        let ntime = hex_u32(str_param(params, 3, "ntime")?, "ntime")?;
        let nonce = hex_u32(str_param(params, 4, "nonce")?, "nonce")?;

        let version_mask = request.version_mask.unwrap_or(0);
        let version_bits = match params.get(5) {
            None | Some(Value::Null) => None,
            Some(_) => {
                let bits = hex_u32(str_param(params, 5, "version bits")?, "version bits")?;
                if bits & !version_mask != 0 {
                    return Err(ShareError::malformed("invalid version bits"));
                }
                Some(bits)
            }
        };

        Ok(Submission {
            job_id: job_id.to_string(),
            fields: BitcoinSubmit {
                extranonce1: request.extranonce1.to_vec(),
                extranonce2,
                ntime,
                nonce,
                version_bits,
                version_mask,
            },
        })
    }

    fn check_submission(
        &self,
        job: &Job<BitcoinWork>,
        fields: &BitcoinSubmit,
    ) -> Result<(), ShareError> {
        let ntime = i64::from(fields.ntime);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if ntime < i64::from(job.work().current_time) || ntime > now + MAX_NTIME_DRIFT {
            return Err(ShareError::NtimeOutOfRange);
        }
        Ok(())
    }

    fn fingerprint(&self, fields: &BitcoinSubmit) -> String {
        format!(
            "{}{}{:08x}{:08x}{:08x}",
            hex::encode(&fields.extranonce1),
            hex::encode(&fields.extranonce2),
            fields.ntime,
            fields.nonce,
            fields.version_bits.unwrap_or(0)
        )
    }

    fn hash(&self, job: &Job<BitcoinWork>, fields: &BitcoinSubmit) -> Result<PowOutcome, ShareError> {
        let work = job.work();
        let coinbase = work
            .coinbase
            .assemble(&fields.extranonce1, &fields.extranonce2);
        let root = merkle_root(coinbase_hash(&coinbase), &work.merkle_branches);
        let block_hash = self.header(work, fields, root).block_hash();

        Ok(PowOutcome {
            hash: U256::from_le_bytes(block_hash.to_byte_array()),
            block_hash: block_hash.to_string(),
            verified: true,
        })
    }

    fn serialize_block(
        &self,
        job: &Job<BitcoinWork>,
        fields: &BitcoinSubmit,
        outcome: &PowOutcome,
    ) -> Result<BlockSubmission, CoinError> {
        let work = job.work();
        let coinbase = work
            .coinbase
            .assemble(&fields.extranonce1, &fields.extranonce2);
        let root = merkle_root(coinbase_hash(&coinbase), &work.merkle_branches);
        let header = self.header(work, fields, root);

        let block_hash = header.block_hash().to_string();
        if block_hash != outcome.block_hash {
            return Err(CoinError::Serialization(format!(
                "header hash {} does not match share hash {}",
                block_hash, outcome.block_hash
            )));
        }

        let mut payload = hex::encode(serialize(&header));
        payload.push_str(&hex::encode(serialize(&VarInt(
            work.transactions.len() as u64 + 1,
        ))));
        payload.push_str(&hex::encode(serialize(&block_coinbase(
            &coinbase, work.segwit,
        )?)));
        for tx in &work.transactions {
            payload.push_str(tx);
        }

        Ok(BlockSubmission {
            payload,
            block_hash,
            confirmation_data: Some(coinbase_txid(&coinbase).to_string()),
        })
    }
}
