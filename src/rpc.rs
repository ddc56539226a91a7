use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

use crate::config::RpcEndpointConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Only the primary endpoint is ever used.
    PrimaryOnly,
    /// Each call starts at the next endpoint in rotation and falls through the rest.
    RoundRobin,
    /// Primary first, then the secondaries in configured order.
    Failover,
}

impl FromStr for RoutingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "primary" | "primary_only" => Ok(Self::PrimaryOnly),
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "failover" => Ok(Self::Failover),
            other => Err(format!("unknown routing policy: {other}")),
        }
    }
}

pub struct RpcEndpoint {
    pub name: String,
    pub client: RpcClient,
    pub wss_url: Option<String>,
}

pub struct RpcPool {
    endpoints: Vec<RpcEndpoint>,
    policy: RoutingPolicy,
    next: AtomicUsize,
}

impl RpcPool {
    pub fn new(configs: &[RpcEndpointConfig], policy: RoutingPolicy) -> Result<Self> {
        if configs.is_empty() {
            return Err(anyhow!("at least one rpc endpoint is required"));
        }
        let endpoints = configs
            .iter()
            .enumerate()
            .map(|(i, c)| RpcEndpoint {
                name: if i == 0 { "primary".to_string() } else { format!("secondary_{i}") },
                client: RpcClient::new_with_commitment(c.http_url.clone(), CommitmentConfig::confirmed()),
                wss_url: c.wss_url.clone(),
            })
            .collect();
        Ok(Self {
            endpoints,
            policy,
            next: AtomicUsize::new(0),
        })
    }

    pub fn endpoints(&self) -> &[RpcEndpoint] {
        &self.endpoints
    }

    /// Endpoint indices to try, in order, for one call.
    pub fn route(&self) -> Vec<usize> {
        route_order(self.policy, self.endpoints.len(), || {
            self.next.fetch_add(1, Ordering::Relaxed)
        })
    }

    /// Runs `op` against the routed endpoints until one succeeds; returns the
    /// last error when all fail.
    pub async fn with_failover<'a, T, F, Fut>(&'a self, label: &str, op: F) -> Result<T>
    where
        F: Fn(&'a RpcClient) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut last_err = None;
        for idx in self.route() {
            let endpoint = &self.endpoints[idx];
            match op(&endpoint.client).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(endpoint = %endpoint.name, call = label, error = %e, "rpc.call.failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(anyhow!("{label}: {e}")),
            None => Err(anyhow!("{label}: no rpc endpoint available")),
        }
    }
}

fn route_order(policy: RoutingPolicy, len: usize, mut tick: impl FnMut() -> usize) -> Vec<usize> {
    if len == 0 {
        return vec![];
    }
    match policy {
        RoutingPolicy::PrimaryOnly => vec![0],
        RoutingPolicy::Failover => (0..len).collect(),
        RoutingPolicy::RoundRobin => {
            let start = tick() % len;
            (0..len).map(|i| (start + i) % len).collect()
        }
    }
}
