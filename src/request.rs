//! Construction of the signed request body for one iteration.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::signer::Signer;

/// Produces strictly increasing nanosecond timestamps.
///
/// Wall-clock nanoseconds are used when they move forward; when two callers
/// land on the same tick (or the clock steps back) the previous value is bumped
/// by one, so no two ids of a run ever share a timestamp.
#[derive(Debug, Default)]
pub struct IterationIds {
    last: AtomicU64,
}

impl IterationIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_timestamp(&self) -> u64 {
        let now = unix_nanos();
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(prev.saturating_add(1))
    }

    /// `<timestamp_ns>:<phone_number>`
    pub fn next_id(&self, phone_number: &str) -> String {
        format!("{}:{phone_number}", self.next_timestamp())
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Body of the init call. Field order is the order expected by the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub request_id: String,
    pub order_id: String,
    pub phone_number: String,
    pub token: String,
    pub lang: String,
    pub partner_client_id: String,
    pub amount: u64,
    pub signature: String,
}

/// A request ready to be sent.
#[derive(Debug, Clone)]
pub struct BuiltRequest {
    pub iteration_id: String,
    pub body: Vec<u8>,
}

/// The exact message covered by the signature.
pub fn signature_message(order_id: &str, amount: u64, token: &str) -> String {
    format!("orderId={order_id}&amount={amount}&token={token}")
}

/// Builds signed payloads for the init endpoint.
#[derive(Clone)]
pub struct RequestBuilder {
    signer: Arc<dyn Signer>,
    ids: Arc<IterationIds>,
    amount: u64,
    lang: String,
}

impl RequestBuilder {
    pub fn new(signer: Arc<dyn Signer>, amount: u64, lang: impl Into<String>) -> Self {
        Self {
            signer,
            ids: Arc::new(IterationIds::new()),
            amount,
            lang: lang.into(),
        }
    }

    /// Compose the payload for one iteration.
    pub fn payload(&self, phone_number: &str, token: &str) -> InitPayload {
        let iteration_id = self.ids.next_id(phone_number);
        let signature = self
            .signer
            .sign(&signature_message(&iteration_id, self.amount, token));
        InitPayload {
            request_id: iteration_id.clone(),
            order_id: iteration_id,
            phone_number: phone_number.to_owned(),
            token: token.to_owned(),
            lang: self.lang.clone(),
            partner_client_id: phone_number.to_owned(),
            amount: self.amount,
            signature,
        }
    }

    /// Compose and serialize the payload for one iteration.
    pub fn build(&self, phone_number: &str, token: &str) -> Result<BuiltRequest, serde_json::Error> {
        let payload = self.payload(phone_number, token);
        let body = serde_json::to_vec(&payload)?;
        Ok(BuiltRequest {
            iteration_id: payload.request_id,
            body,
        })
    }
}
