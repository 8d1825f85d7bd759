//! Deterministic coin for tests.
//!
//! Submissions carry the difficulty their hash should prove, so tests can
//! drive the validator through every branch without mining anything:
//!
//! ```text
//! mining.submit ["worker", "<job id>", "<nonce: 8 hex>", <difficulty>]
//! ```
//!
//! The nonce `00000000` fails verification.

use serde_json::{Value, json};

use super::{
    BlockSubmission, CoinAdapter, CoinError, CoinFamily, DedupScope, PowOutcome, PreparedWork,
    SubmitRequest, Submission,
};
use crate::job::{Job, TemplateIdentity};
use crate::share::ShareError;
use crate::types::DifficultyMath;

#[derive(Debug, Clone, PartialEq)]
pub struct TestTemplate {
    pub height: u64,
    pub prev_hash: String,
    pub network_difficulty: f64,
    pub longpoll_id: Option<String>,
}

#[derive(Debug)]
pub struct TestWork {
    pub prev_hash: String,
}

#[derive(Debug, Clone)]
pub struct TestFields {
    pub extranonce1: String,
    pub nonce: String,
    pub difficulty: f64,
}

/// Template JSON as `MockDaemon` serves it.
pub fn template_json(height: u64, network_difficulty: f64) -> Value {
    json!({
        "height": height,
        "previousblockhash": format!("{:064x}", height - 1),
        "difficulty": network_difficulty,
        "longpollid": format!("lp{}", height),
    })
}

pub fn submit_params(job_id: &str, nonce: u32, difficulty: f64) -> Vec<Value> {
    vec![
        json!("bc1qminer.rig1"),
        json!(job_id),
        json!(format!("{:08x}", nonce)),
        json!(difficulty),
    ]
}

#[derive(Debug, Clone)]
pub struct TestCoin {
    pub dedup_scope: DedupScope,
}

impl Default for TestCoin {
    fn default() -> Self {
        Self {
            dedup_scope: DedupScope::Job,
        }
    }
}

impl CoinAdapter for TestCoin {
    type Template = TestTemplate;
    type Work = TestWork;
    type SubmitFields = TestFields;

    fn family(&self) -> CoinFamily {
        CoinFamily::Bitcoin
    }

    fn difficulty_math(&self) -> DifficultyMath {
        DifficultyMath::bitcoin()
    }

    fn dedup_scope(&self) -> DedupScope {
        self.dedup_scope
    }

    fn validate_address(&self, address: &str) -> bool {
        address.starts_with("bc1q")
    }

    fn parse_template(&self, raw: &Value) -> Result<TestTemplate, CoinError> {
        let field = |name: &str| {
            raw.get(name)
                .ok_or_else(|| CoinError::InvalidTemplate(format!("missing {}", name)))
        };
        Ok(TestTemplate {
            height: field("height")?
                .as_u64()
                .ok_or_else(|| CoinError::InvalidTemplate("height".into()))?,
            prev_hash: field("previousblockhash")?
                .as_str()
                .ok_or_else(|| CoinError::InvalidTemplate("previousblockhash".into()))?
                .to_string(),
            network_difficulty: field("difficulty")?
                .as_f64()
                .ok_or_else(|| CoinError::InvalidTemplate("difficulty".into()))?,
            longpoll_id: raw
                .get("longpollid")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn template_identity(&self, template: &TestTemplate) -> TemplateIdentity {
        TemplateIdentity {
            height: template.height,
            prev_hash: template.prev_hash.clone(),
        }
    }

    fn long_poll_id(&self, template: &TestTemplate) -> Option<String> {
        template.longpoll_id.clone()
    }

    fn build_job(&self, template: TestTemplate) -> Result<PreparedWork<TestWork>, CoinError> {
        Ok(PreparedWork {
            network_target: self.difficulty_math().target_for(template.network_difficulty),
            work: TestWork {
                prev_hash: template.prev_hash,
            },
        })
    }

    fn notify_params(&self, job: &Job<TestWork>, clean_jobs: bool) -> Value {
        json!([job.id(), job.work().prev_hash, clean_jobs])
    }

    fn parse_submission(
        &self,
        request: &SubmitRequest<'_>,
    ) -> Result<Submission<TestFields>, ShareError> {
        let [_worker, job_id, nonce, difficulty] = request.params else {
            return Err(ShareError::malformed("wrong number of params"));
        };
        let nonce = nonce
            .as_str()
            .filter(|n| n.len() == 8 && n.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| ShareError::malformed("incorrect size of nonce"))?;

        Ok(Submission {
            job_id: job_id
                .as_str()
                .ok_or_else(|| ShareError::malformed("job id not a string"))?
                .to_string(),
            fields: TestFields {
                extranonce1: hex::encode(request.extranonce1),
                nonce: nonce.to_string(),
                difficulty: difficulty
                    .as_f64()
                    .ok_or_else(|| ShareError::malformed("difficulty not a number"))?,
            },
        })
    }

    fn fingerprint(&self, fields: &TestFields) -> String {
        format!("{}:{}", fields.extranonce1, fields.nonce)
    }

    fn hash(&self, _job: &Job<TestWork>, fields: &TestFields) -> Result<PowOutcome, ShareError> {
        let hash = self.difficulty_math().target_for(fields.difficulty);
        Ok(PowOutcome {
            hash,
            block_hash: format!("{:x}", hash),
            verified: fields.nonce != "00000000",
        })
    }

    fn serialize_block(
        &self,
        job: &Job<TestWork>,
        fields: &TestFields,
        outcome: &PowOutcome,
    ) -> Result<BlockSubmission, CoinError> {
        Ok(BlockSubmission {
            payload: format!("block:{}:{}", job.id(), fields.nonce),
            block_hash: outcome.block_hash.clone(),
            confirmation_data: Some(format!("coinbase-{}", fields.nonce)),
        })
    }
}
