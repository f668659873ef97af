use crate::client::NodeRpc;
use crate::error::{Result, RpcError};
use crate::types::{DecodedPayment, NodeAddress, NodeInfo};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

const CLN_REST_RUNE_HEADER: &str = "Rune";
const MSAT_PER_SAT: u64 = 1_000;

/// Core Lightning client speaking to the `clnrest` plugin (`POST /v1/<method>`).
#[derive(Clone)]
pub struct ClnRestClient {
    http: reqwest::Client,
    base_url: String,
    rune: String,
    fund_channel_sat: u64,
}

impl ClnRestClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(base_url: &str, rune: &str, timeout: Duration, fund_channel_sat: u64) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RpcError::InvalidInput("rpc base url is required".to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            rune: rune.to_string(),
            fund_channel_sat,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/v1/{method}", self.base_url)
    }

    #[tracing::instrument(level = "info", skip(self, params))]
    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let response = self
            .http
            .post(self.method_url(method))
            .header(CLN_REST_RUNE_HEADER, &self.rune)
            .json(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ClnErrorBody>(&body) {
                return Err(RpcError::Node {
                    method: method.to_string(),
                    code: err.code,
                    message: err.message,
                });
            }
            return Err(RpcError::Http(format!(
                "cln {method} status={status} body={body}"
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| RpcError::ResponseFormat(format!("cln {method}: {e} body={body}")))
    }
}

#[async_trait]
impl NodeRpc for ClnRestClient {
    async fn get_info(&self) -> Result<NodeInfo> {
        self.call("getinfo", json!({})).await
    }

    async fn get_invoice(
        &self,
        amount_sat: u64,
        label: &str,
        description: &str,
    ) -> Result<String> {
        if amount_sat == 0 {
            return Err(RpcError::InvalidInput("invoice amount must be > 0".to_string()));
        }
        let amount_msat = amount_sat
            .checked_mul(MSAT_PER_SAT)
            .ok_or_else(|| RpcError::InvalidInput(format!("invoice amount overflow: {amount_sat}")))?;
        let invoice: InvoiceResponse = self
            .call(
                "invoice",
                json!({
                    "amount_msat": amount_msat,
                    "label": label,
                    "description": description,
                }),
            )
            .await?;
        Ok(invoice.bolt11)
    }

    async fn connect(&self, node: &NodeAddress) -> Result<String> {
        let connected: ConnectResponse = self
            .call(
                "connect",
                json!({
                    "id": node.pubkey,
                    "host": node.host,
                    "port": node.port,
                }),
            )
            .await?;
        Ok(summarize_connect(&connected))
    }

    async fn pay(&self, bolt11: &str) -> Result<String> {
        let paid: PayResponse = self.call("pay", json!({ "bolt11": bolt11 })).await?;
        Ok(summarize_pay(&paid))
    }

    async fn decode_pay(&self, bolt11: &str) -> Result<DecodedPayment> {
        self.call("decodepay", json!({ "bolt11": bolt11 })).await
    }

    async fn fund_channel(&self, pubkey: &str) -> Result<String> {
        let funded: FundChannelResponse = self
            .call(
                "fundchannel",
                json!({
                    "id": pubkey,
                    "amount": self.fund_channel_sat,
                }),
            )
            .await?;
        Ok(summarize_fund_channel(&funded, self.fund_channel_sat))
    }
}

fn summarize_connect(resp: &ConnectResponse) -> String {
    match resp.direction.as_deref() {
        Some(direction) => format!("Connected to {} ({direction})", resp.id),
        None => format!("Connected to {}", resp.id),
    }
}

fn summarize_pay(resp: &PayResponse) -> String {
    let amount = resp
        .amount_sent_msat
        .or(resp.amount_msat)
        .map(|msat| format!(" {} sat", msat / MSAT_PER_SAT))
        .unwrap_or_default();
    format!(
        "Payment {}{amount}, preimage {}",
        resp.status.as_deref().unwrap_or("complete"),
        resp.payment_preimage
    )
}

fn summarize_fund_channel(resp: &FundChannelResponse, amount_sat: u64) -> String {
    format!(
        "Funded channel {} with {amount_sat} sat, txid {}",
        resp.channel_id, resp.txid
    )
}

#[derive(Debug, Deserialize)]
struct ClnErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    bolt11: String,
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    id: String,
    #[serde(default)]
    direction: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayResponse {
    payment_preimage: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount_msat: Option<u64>,
    #[serde(default)]
    amount_sent_msat: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FundChannelResponse {
    txid: String,
    channel_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_blank_base_url_and_trims_trailing_slash() {
        let err = ClnRestClient::new("  ", "rune", Duration::from_secs(5), 100_000)
            .err()
            .expect("blank url must be rejected");
        assert!(matches!(err, RpcError::InvalidInput(_)));

        let client = ClnRestClient::new("https://node.local:3010/", "rune", Duration::from_secs(5), 1)
            .expect("client");
        assert_eq!(client.method_url("getinfo"), "https://node.local:3010/v1/getinfo");
    }

    #[test]
    fn pay_summary_reports_sent_amount_in_sat() {
        let paid: PayResponse = serde_json::from_value(json!({
            "payment_preimage": "ab12",
            "status": "complete",
            "amount_msat": 1_000_000,
            "amount_sent_msat": 1_001_000,
        }))
        .expect("pay response");
        assert_eq!(summarize_pay(&paid), "Payment complete 1001 sat, preimage ab12");
    }

    #[test]
    fn connect_and_fund_summaries_name_the_peer_and_channel() {
        let connected: ConnectResponse =
            serde_json::from_value(json!({"id": "02cc", "direction": "out", "features": "08"}))
                .expect("connect response");
        assert_eq!(summarize_connect(&connected), "Connected to 02cc (out)");

        let funded: FundChannelResponse = serde_json::from_value(json!({
            "tx": "0200",
            "txid": "feed",
            "channel_id": "beef",
            "outnum": 0,
        }))
        .expect("fundchannel response");
        assert_eq!(
            summarize_fund_channel(&funded, 250_000),
            "Funded channel beef with 250000 sat, txid feed"
        );
    }

    #[test]
    fn node_error_body_is_parsed() {
        let err: ClnErrorBody =
            serde_json::from_str(r#"{"code":-32602,"message":"Unknown label"}"#).expect("body");
        assert_eq!(err.code, -32602);
        assert_eq!(err.message, "Unknown label");
    }
}
