//! Recorded proxy traffic and its replay through the cache.

use std::path::Path;

use anyhow::Context;
use mpc_cache::{relay, CacheModule, CacheStats, Outcome, ProxyModule};
use mpc_protocol::{ConnectionId, MapiRequest, MapiResponse, RpcCall, ECDORPC_OPNUM};
use serde::{Deserialize, Serialize};

fn ecdorpc() -> u16 {
    ECDORPC_OPNUM
}

/// One recorded call: the client's request and what the server answered.
/// An exchange with `disconnect` set only closes the connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Exchange {
    pub connection: ConnectionId,
    #[serde(default = "ecdorpc")]
    pub opnum: u16,
    #[serde(default)]
    pub request: MapiRequest,
    #[serde(default)]
    pub response: MapiResponse,
    #[serde(default)]
    pub disconnect: bool,
}

pub fn load(path: &Path) -> anyhow::Result<Vec<Exchange>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading trace {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing trace {}", path.display()))
}

#[derive(Debug, Default, Serialize)]
pub struct ReplayReport {
    pub exchanges: usize,
    pub forwarded: usize,
    pub short_circuited: usize,
    /// Positions of short-circuited exchanges whose local reply differs
    /// from the recorded one.
    pub mismatches: Vec<usize>,
    pub stats: CacheStats,
}

pub fn replay(module: &CacheModule, exchanges: &[Exchange]) -> anyhow::Result<ReplayReport> {
    let mut report = ReplayReport::default();
    for (position, exchange) in exchanges.iter().enumerate() {
        if exchange.disconnect {
            module.disconnect(exchange.connection)?;
            continue;
        }
        report.exchanges += 1;
        let call = RpcCall {
            connection: exchange.connection,
            opnum: exchange.opnum,
        };
        let (reply, outcome) = relay(module, &call, &exchange.request, |_| exchange.response.clone());
        match outcome {
            Outcome::Forwarded => report.forwarded += 1,
            Outcome::ShortCircuited => {
                report.short_circuited += 1;
                if reply.replies != exchange.response.replies {
                    report.mismatches.push(position);
                }
            }
        }
    }
    module.shutdown()?;
    report.stats = module.stats()?;
    Ok(report)
}
