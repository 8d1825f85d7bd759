//! Bitcoin Core JSON-RPC client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{DaemonClient, DaemonStatus, RpcError, SubmitOutcome};
use crate::tracing::prelude::*;

/// Connection settings for a bitcoind-compatible daemon.
#[derive(Debug, Clone)]
pub struct BitcoindConfig {
    /// RPC endpoint, e.g. `http://127.0.0.1:8332`
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Push templates through `getblocktemplate` long polling.
    pub long_polling: bool,
    /// Timeout for ordinary requests. Long-poll requests have none.
    pub request_timeout: Duration,
}

/// JSON-RPC 1.0 over HTTP, as spoken by Bitcoin Core.
pub struct BitcoindClient {
    config: BitcoindConfig,
    client: reqwest::Client,
    long_poll_client: reqwest::Client,
    next_id: AtomicU64,
}

/// Reply envelope. bitcoind answers RPC errors with HTTP 500 and this same
/// body, so the envelope is parsed before the status is judged.
#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    blocks: u64,
    difficulty: f64,
    #[serde(rename = "initialblockdownload", default)]
    initial_block_download: bool,
}

#[derive(Debug, Deserialize)]
struct NetworkInfo {
    connections: u32,
}

impl BitcoindClient {
    pub fn new(config: BitcoindConfig) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let long_poll_client = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            client,
            long_poll_client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn call<T: DeserializeOwned>(
        &self,
        client: &reqwest::Client,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut request = client
            .post(&self.config.url)
            .json(&request_body(id, method, params));
        if let Some(user) = &self.config.user {
            request = request.basic_auth(user, self.config.password.as_ref());
        }

        trace!(method, id, "RPC request");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::INTERNAL_SERVER_ERROR {
            return Err(RpcError::Http(status.as_u16()));
        }

        let reply: RpcReply = response.json().await?;
        parse_reply(reply)
    }

    fn template_request(longpoll_id: Option<&str>) -> Value {
        let mut request = json!({ "rules": ["segwit"] });
        if let Some(id) = longpoll_id {
            request["longpollid"] = json!(id);
        }
        json!([request])
    }
}

fn request_body(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "1.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

fn parse_reply<T: DeserializeOwned>(reply: RpcReply) -> Result<T, RpcError> {
    if let Some(error) = reply.error {
        return Err(RpcError::Daemon {
            code: error.code,
            message: error.message,
        });
    }
    serde_json::from_value(reply.result).map_err(|e| RpcError::Malformed(e.to_string()))
}

/// `submitblock` returns null on acceptance and a reason string otherwise.
fn submit_outcome(result: Value) -> SubmitOutcome {
    match result {
        Value::Null => SubmitOutcome::Accepted,
        Value::String(reason) => SubmitOutcome::Rejected(reason),
        other => SubmitOutcome::Rejected(other.to_string()),
    }
}

#[async_trait]
impl DaemonClient for BitcoindClient {
    async fn get_block_template(&self) -> Result<Value, RpcError> {
        self.call(&self.client, "getblocktemplate", Self::template_request(None))
            .await
    }

    async fn submit_block(&self, payload: &str) -> Result<SubmitOutcome, RpcError> {
        let result: Value = self
            .call(&self.client, "submitblock", json!([payload]))
            .await?;
        Ok(submit_outcome(result))
    }

    async fn status(&self) -> Result<DaemonStatus, RpcError> {
        let chain: BlockchainInfo = self
            .call(&self.client, "getblockchaininfo", json!([]))
            .await?;
        let network: NetworkInfo = self
            .call(&self.client, "getnetworkinfo", json!([]))
            .await?;

        Ok(DaemonStatus {
            connections: network.connections,
            synced: !chain.initial_block_download,
            blocks: chain.blocks,
            difficulty: chain.difficulty,
        })
    }

    fn supports_long_poll(&self) -> bool {
        self.config.long_polling
    }

    async fn long_poll(&self, longpoll_id: &str) -> Result<Option<Value>, RpcError> {
        if !self.config.long_polling {
            return Ok(None);
        }
        let template = self
            .call(
                &self.long_poll_client,
                "getblocktemplate",
                Self::template_request(Some(longpoll_id)),
            )
            .await?;
        Ok(Some(template))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(url: String) -> BitcoindConfig {
        BitcoindConfig {
            url,
            user: Some("rpcuser".into()),
            password: Some("rpcpass".into()),
            long_polling: true,
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Serve canned JSON-RPC replies, one request per connection, keyed by
    /// method name.
    async fn serve(replies: Vec<(&'static str, u16, Value)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                let body: Value = serde_json::from_str(&request).unwrap();
                let method = body["method"].as_str().unwrap().to_string();
                let (_, status, reply) = replies
                    .iter()
                    .find(|(m, _, _)| *m == method)
                    .cloned()
                    .unwrap();
                let reply = reply.to_string();
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reply.len(),
                    reply
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });

        format!("http://{}", addr)
    }

    /// Read one HTTP request and return its body.
    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= split + 4 + length {
                    return text[split + 4..split + 4 + length].to_string();
                }
            }
            if n == 0 {
                panic!("connection closed mid-request");
            }
        }
    }

    #[test]
    fn test_request_body() {
        let body = request_body(7, "submitblock", json!(["00"]));
        assert_eq!(body["jsonrpc"], "1.0");
        assert_eq!(body["id"], 7);
        assert_eq!(body["method"], "submitblock");
        assert_eq!(body["params"], json!(["00"]));
    }

    #[test]
    fn test_template_request() {
        assert_eq!(
            BitcoindClient::template_request(None),
            json!([{ "rules": ["segwit"] }])
        );
        assert_eq!(
            BitcoindClient::template_request(Some("abc123")),
            json!([{ "rules": ["segwit"], "longpollid": "abc123" }])
        );
    }

    #[test]
    fn test_parse_reply_error() {
        let reply: RpcReply = serde_json::from_value(json!({
            "result": null,
            "error": { "code": -10, "message": "Bitcoin Core is in initial sync" },
        }))
        .unwrap();
        let err = parse_reply::<Value>(reply).unwrap_err();
        assert!(matches!(err, RpcError::Daemon { code: -10, .. }));
    }

    #[test]
    fn test_submit_outcome() {
        assert_eq!(submit_outcome(Value::Null), SubmitOutcome::Accepted);
        assert_eq!(
            submit_outcome(json!("high-hash")),
            SubmitOutcome::Rejected("high-hash".into())
        );
    }

    #[tokio::test]
    async fn test_status_combines_two_calls() {
        let url = serve(vec![
            (
                "getblockchaininfo",
                200,
                json!({ "result": { "blocks": 840000, "difficulty": 8.6e13, "initialblockdownload": false }, "error": null, "id": 1 }),
            ),
            (
                "getnetworkinfo",
                200,
                json!({ "result": { "connections": 10 }, "error": null, "id": 2 }),
            ),
        ])
        .await;

        let client = BitcoindClient::new(config(url)).unwrap();
        let status = client.status().await.unwrap();
        assert_eq!(status.blocks, 840_000);
        assert_eq!(status.connections, 10);
        assert!(status.is_ready());
    }

    #[tokio::test]
    async fn test_daemon_error_over_http_500() {
        let url = serve(vec![(
            "getblocktemplate",
            500,
            json!({ "result": null, "error": { "code": -9, "message": "Bitcoin Core is not connected!" }, "id": 1 }),
        )])
        .await;

        let client = BitcoindClient::new(config(url)).unwrap();
        let err = client.get_block_template().await.unwrap_err();
        assert!(matches!(err, RpcError::Daemon { code: -9, .. }));
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let url = serve(vec![("getblocktemplate", 401, json!({}))]).await;

        let client = BitcoindClient::new(config(url)).unwrap();
        let err = client.get_block_template().await.unwrap_err();
        assert!(matches!(err, RpcError::Http(401)));
    }

    #[tokio::test]
    async fn test_long_poll_disabled() {
        let mut config = config("http://127.0.0.1:1".into());
        config.long_polling = false;
        let client = BitcoindClient::new(config).unwrap();
        assert!(!client.supports_long_poll());
        assert_eq!(client.long_poll("lp").await.unwrap(), None);
    }
}
