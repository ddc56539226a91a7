use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use borsh::BorshSerialize;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::{
    AccountState, Exchange, MarketType, OpenOrder, OrderParams, PerpPosition, PositionDirection, SpotPosition,
    PRICE_PRECISION,
};
use crate::domain::MarketSnapshot;
use crate::rpc::RpcPool;

pub const DRIFT_PROGRAM_ID: &str = "dRiftyHA39MWEi3EZ8ZYUMDN9k3LcRQFEbRFMnzYXjP";
pub const QUOTE_SPOT_MARKET_INDEX: u16 = 0;
const SPOT_BALANCE_PRECISION: f64 = 1_000_000_000.0;

// User account layout (after the 8-byte account discriminator).
const SPOT_POSITIONS_OFFSET: usize = 8 + 32 * 3;
const SPOT_POSITION_LEN: usize = 40;
const SPOT_POSITION_COUNT: usize = 8;
const PERP_POSITIONS_OFFSET: usize = SPOT_POSITIONS_OFFSET + SPOT_POSITION_LEN * SPOT_POSITION_COUNT;
const PERP_POSITION_LEN: usize = 96;
const PERP_POSITION_COUNT: usize = 8;
const ORDERS_OFFSET: usize = PERP_POSITIONS_OFFSET + PERP_POSITION_LEN * PERP_POSITION_COUNT;
const ORDER_LEN: usize = 96;
const ORDER_COUNT: usize = 32;
const USER_MIN_LEN: usize = ORDERS_OFFSET + ORDER_LEN * ORDER_COUNT;

const ORDER_STATUS_OPEN: u8 = 1;

/// Market accounts store their oracle right after discriminator and pubkey.
const MARKET_ORACLE_OFFSET: usize = 8 + 32;

pub fn anchor_discriminator(name: &str) -> [u8; 8] {
    let hash = Sha256::digest(format!("global:{name}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(b)
}

fn read_i64(data: &[u8], at: usize) -> i64 {
    read_u64(data, at) as i64
}

/// Decodes spot and perp positions, quote balance and open orders from raw
/// user account data.
pub fn decode_user_account(data: &[u8]) -> Result<AccountState> {
    if data.len() < USER_MIN_LEN {
        return Err(anyhow!("user account too short: {} bytes", data.len()));
    }

    let spot_positions: Vec<SpotPosition> = (0..SPOT_POSITION_COUNT)
        .map(|i| {
            let at = SPOT_POSITIONS_OFFSET + i * SPOT_POSITION_LEN;
            SpotPosition {
                scaled_balance: read_u64(data, at),
                market_index: read_u16(data, at + 32),
                is_deposit: data[at + 34] == 0,
                open_orders: data[at + 35],
            }
        })
        .filter(|p| p.scaled_balance > 0 || p.open_orders > 0)
        .collect();

    let quote_balance = spot_positions
        .iter()
        .find(|p| p.market_index == QUOTE_SPOT_MARKET_INDEX && p.is_deposit && p.scaled_balance > 0)
        .map(|p| p.scaled_balance as f64 / SPOT_BALANCE_PRECISION)
        .unwrap_or(0.0);

    let positions = (0..PERP_POSITION_COUNT)
        .map(|i| {
            let at = PERP_POSITIONS_OFFSET + i * PERP_POSITION_LEN;
            PerpPosition {
                base_asset_amount: read_i64(data, at + 8),
                quote_entry_amount: read_i64(data, at + 32),
                market_index: read_u16(data, at + 92),
                open_orders: data[at + 94],
            }
        })
        .filter(|p| p.is_open() || p.open_orders > 0)
        .collect();

    let open_orders = (0..ORDER_COUNT)
        .filter_map(|i| {
            let at = ORDERS_OFFSET + i * ORDER_LEN;
            if data[at + 82] != ORDER_STATUS_OPEN {
                return None;
            }
            Some(OpenOrder {
                order_id: read_u32(data, at + 76),
                market_index: read_u16(data, at + 80),
                market_type: if data[at + 84] == 0 { MarketType::Spot } else { MarketType::Perp },
                user_order_id: data[at + 85],
            })
        })
        .collect();

    Ok(AccountState { quote_balance, spot_positions, positions, open_orders })
}

/// Spot and perp market indices an instruction on `market_index` must
/// reference: the traded market, the quote market and every market the user
/// already holds a position or resting order on. Sorted and deduplicated.
pub fn referenced_markets(account: &AccountState, market_index: u16) -> (Vec<u16>, Vec<u16>) {
    let spot: BTreeSet<u16> = std::iter::once(QUOTE_SPOT_MARKET_INDEX)
        .chain(account.spot_positions.iter().map(|p| p.market_index))
        .collect();
    let perp: BTreeSet<u16> = std::iter::once(market_index)
        .chain(account.positions.iter().map(|p| p.market_index))
        .collect();
    (spot.into_iter().collect(), perp.into_iter().collect())
}

/// Oracles first (deduplicated), then spot markets, then perp markets.
fn remaining_metas(oracles: &[Pubkey], spot_markets: &[Pubkey], perp_markets: &[Pubkey]) -> Vec<AccountMeta> {
    let mut seen = BTreeSet::new();
    let mut metas: Vec<AccountMeta> = oracles
        .iter()
        .filter(|o| seen.insert(**o))
        .map(|o| AccountMeta::new_readonly(*o, false))
        .collect();
    metas.extend(spot_markets.iter().map(|m| AccountMeta::new_readonly(*m, false)));
    metas.extend(perp_markets.iter().map(|m| AccountMeta::new_readonly(*m, false)));
    metas
}

#[derive(Debug, Deserialize)]
struct L2Level {
    price: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct L2Response {
    #[serde(default)]
    bids: Vec<L2Level>,
    #[serde(default)]
    asks: Vec<L2Level>,
}

fn level_price(level: &L2Level) -> Option<f64> {
    let native = match &level.price {
        serde_json::Value::String(s) => s.parse::<f64>().ok()?,
        serde_json::Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    Some(native / PRICE_PRECISION)
}

fn snapshot_from_l2(market_index: u16, l2: &L2Response) -> MarketSnapshot {
    MarketSnapshot {
        market_index,
        best_ask: l2.asks.first().and_then(level_price),
        best_bid: l2.bids.first().and_then(level_price),
    }
}

#[derive(BorshSerialize)]
struct CancelOrdersArgs {
    market_type: Option<MarketType>,
    market_index: Option<u16>,
    direction: Option<PositionDirection>,
}

pub struct DriftExchange {
    program_id: Pubkey,
    authority: Pubkey,
    sub_account_id: u16,
    rpc: Arc<RpcPool>,
    dlob_url: String,
    http: Client,
}

impl DriftExchange {
    pub fn new(rpc: Arc<RpcPool>, authority: Pubkey, sub_account_id: u16, dlob_url: String) -> Result<Self> {
        let program_id = Pubkey::from_str(DRIFT_PROGRAM_ID)?;
        Ok(Self {
            program_id,
            authority,
            sub_account_id,
            rpc,
            dlob_url: dlob_url.trim_end_matches('/').to_string(),
            http: Client::new(),
        })
    }

    pub fn state_pda(&self) -> Pubkey {
        Pubkey::find_program_address(&[b"drift_state"], &self.program_id).0
    }

    pub fn user_pda(&self) -> Pubkey {
        Pubkey::find_program_address(
            &[b"user", self.authority.as_ref(), &self.sub_account_id.to_le_bytes()],
            &self.program_id,
        )
        .0
    }

    pub fn perp_market_pda(&self, market_index: u16) -> Pubkey {
        Pubkey::find_program_address(&[b"perp_market", &market_index.to_le_bytes()], &self.program_id).0
    }

    pub fn spot_market_pda(&self, market_index: u16) -> Pubkey {
        Pubkey::find_program_address(&[b"spot_market", &market_index.to_le_bytes()], &self.program_id).0
    }

    async fn account_data(&self, address: &Pubkey) -> Result<Vec<u8>> {
        self.rpc
            .with_failover("getAccountInfo", |c| c.get_account_data(address))
            .await
    }

    async fn market_oracle(&self, market: &Pubkey) -> Result<Pubkey> {
        let data = self.account_data(market).await?;
        let bytes = data
            .get(MARKET_ORACLE_OFFSET..MARKET_ORACLE_OFFSET + 32)
            .ok_or_else(|| anyhow!("market account {market} too short"))?;
        Ok(Pubkey::try_from(bytes)?)
    }

    /// Market and oracle accounts the margin check loads, in the order the
    /// program expects them after the fixed accounts.
    async fn remaining_accounts(&self, account: &AccountState, market_index: u16) -> Result<Vec<AccountMeta>> {
        let (spot_indices, perp_indices) = referenced_markets(account, market_index);
        let spot_markets: Vec<Pubkey> = spot_indices.iter().map(|i| self.spot_market_pda(*i)).collect();
        let perp_markets: Vec<Pubkey> = perp_indices.iter().map(|i| self.perp_market_pda(*i)).collect();

        let mut oracles = Vec::with_capacity(spot_markets.len() + perp_markets.len());
        for market in spot_markets.iter().chain(perp_markets.iter()) {
            oracles.push(self.market_oracle(market).await?);
        }
        Ok(remaining_metas(&oracles, &spot_markets, &perp_markets))
    }

    fn instruction(&self, name: &str, args: Vec<u8>, remaining: &[AccountMeta]) -> Instruction {
        let mut data = anchor_discriminator(name).to_vec();
        data.extend(args);

        let mut accounts = vec![
            AccountMeta::new_readonly(self.state_pda(), false),
            AccountMeta::new(self.user_pda(), false),
            AccountMeta::new_readonly(self.authority, true),
        ];
        accounts.extend_from_slice(remaining);
        Instruction { program_id: self.program_id, accounts, data }
    }
}

#[async_trait]
impl Exchange for DriftExchange {
    fn authority(&self) -> Pubkey {
        self.authority
    }

    async fn order_book(&self, market_index: u16) -> Result<MarketSnapshot> {
        let url = format!("{}/l2", self.dlob_url);
        let l2: L2Response = self
            .http
            .get(url)
            .query(&[
                ("marketIndex", market_index.to_string()),
                ("marketType", "perp".to_string()),
                ("depth", "1".to_string()),
                ("includeVamm", "true".to_string()),
            ])
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(snapshot_from_l2(market_index, &l2))
    }

    async fn account_state(&self) -> Result<AccountState> {
        let user = self.user_pda();
        let data = self
            .account_data(&user)
            .await
            .with_context(|| format!("fetch user account {user}"))?;
        decode_user_account(&data)
    }

    async fn place_order_instructions(&self, account: &AccountState, orders: &[OrderParams]) -> Result<Vec<Instruction>> {
        let mut resolved: Vec<(u16, Vec<AccountMeta>)> = Vec::new();
        let mut out = Vec::with_capacity(orders.len());
        for order in orders {
            if !resolved.iter().any(|(m, _)| *m == order.market_index) {
                let metas = self.remaining_accounts(account, order.market_index).await?;
                resolved.push((order.market_index, metas));
            }
            let remaining = resolved
                .iter()
                .find(|(m, _)| *m == order.market_index)
                .map(|(_, metas)| metas.as_slice())
                .unwrap_or_default();
            out.push(self.instruction("place_perp_order", borsh::to_vec(order)?, remaining));
        }
        Ok(out)
    }

    async fn cancel_orders_instruction(&self, account: &AccountState, market_index: u16) -> Result<Instruction> {
        let args = CancelOrdersArgs {
            market_type: Some(MarketType::Perp),
            market_index: Some(market_index),
            direction: None,
        };
        let remaining = self.remaining_accounts(account, market_index).await?;
        Ok(self.instruction("cancel_orders", borsh::to_vec(&args)?, &remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_user() -> Vec<u8> {
        vec![0u8; USER_MIN_LEN + 112]
    }

    fn put_u64(data: &mut [u8], at: usize, v: u64) {
        data[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u16(data: &mut [u8], at: usize, v: u16) {
        data[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    #[test]
    fn discriminator_is_sha256_prefix() {
        let d = anchor_discriminator("place_perp_order");
        let full = Sha256::digest(b"global:place_perp_order");
        assert_eq!(&d[..], &full[..8]);
        assert_ne!(d, anchor_discriminator("cancel_orders"));
    }

    #[test]
    fn decodes_positions_orders_and_quote_balance() {
        let mut data = blank_user();

        // quote deposit of 1250.5 in spot slot 0
        put_u64(&mut data, SPOT_POSITIONS_OFFSET, 1_250_500_000_000);

        // short 3 base on market 2 in perp slot 1
        let at = PERP_POSITIONS_OFFSET + PERP_POSITION_LEN;
        put_u64(&mut data, at + 8, (-3_000_000_000i64) as u64);
        put_u64(&mut data, at + 32, 450_000_000);
        put_u16(&mut data, at + 92, 2);
        data[at + 94] = 1;

        // one open perp order with user order id 4 in order slot 5
        let at = ORDERS_OFFSET + 5 * ORDER_LEN;
        data[at + 76..at + 80].copy_from_slice(&42u32.to_le_bytes());
        put_u16(&mut data, at + 80, 2);
        data[at + 82] = ORDER_STATUS_OPEN;
        data[at + 84] = 1;
        data[at + 85] = 4;

        // a filled order is ignored
        let at = ORDERS_OFFSET + 6 * ORDER_LEN;
        data[at + 82] = 2;

        // borrowed SOL in spot slot 3
        let at = SPOT_POSITIONS_OFFSET + 3 * SPOT_POSITION_LEN;
        put_u64(&mut data, at, 2_000_000_000);
        put_u16(&mut data, at + 32, 1);
        data[at + 34] = 1;

        let state = decode_user_account(&data).unwrap();
        assert!((state.quote_balance - 1250.5).abs() < 1e-9);
        assert_eq!(state.spot_positions.len(), 2);
        assert_eq!(
            state.spot_positions[1],
            SpotPosition { market_index: 1, scaled_balance: 2_000_000_000, is_deposit: false, open_orders: 0 }
        );
        let pos = state.position(2).unwrap();
        assert_eq!(pos.base_asset_amount, -3_000_000_000);
        assert_eq!(pos.entry_price(), Some(150.0));
        assert_eq!(state.open_orders.len(), 1);
        assert_eq!(
            state.open_orders[0],
            OpenOrder { order_id: 42, market_index: 2, market_type: MarketType::Perp, user_order_id: 4 }
        );
    }

    #[test]
    fn short_account_is_rejected() {
        assert!(decode_user_account(&[0u8; 100]).is_err());
    }

    #[test]
    fn l2_prices_are_scaled() {
        let raw = r#"{"bids":[{"price":"99000000","size":"1"}],"asks":[{"price":101000000,"size":"2"}],"slot":1}"#;
        let l2: L2Response = serde_json::from_str(raw).unwrap();
        let snap = snapshot_from_l2(0, &l2);
        assert_eq!(snap.best_bid, Some(99.0));
        assert_eq!(snap.best_ask, Some(101.0));
    }

    #[test]
    fn empty_l2_side_is_none() {
        let l2: L2Response = serde_json::from_str(r#"{"bids":[],"asks":[]}"#).unwrap();
        let snap = snapshot_from_l2(3, &l2);
        assert_eq!(snap.best_ask, None);
        assert_eq!(snap.best_bid, None);
    }

    fn offline_exchange(authority: Pubkey) -> DriftExchange {
        let rpc = Arc::new(
            RpcPool::new(
                &[crate::config::RpcEndpointConfig { http_url: "http://localhost:8899".into(), wss_url: None }],
                crate::rpc::RoutingPolicy::PrimaryOnly,
            )
            .unwrap(),
        );
        DriftExchange::new(rpc, authority, 0, "https://dlob.example/".into()).unwrap()
    }

    fn perp(market_index: u16, base_asset_amount: i64) -> PerpPosition {
        PerpPosition { market_index, base_asset_amount, quote_entry_amount: 0, open_orders: 0 }
    }

    #[test]
    fn flat_account_references_traded_and_quote_markets() {
        let (spot, perp) = referenced_markets(&AccountState::default(), 1);
        assert_eq!(spot, vec![0]);
        assert_eq!(perp, vec![1]);
    }

    #[test]
    fn open_positions_are_referenced_alongside_the_traded_market() {
        let account = AccountState {
            positions: vec![perp(2, 5_000_000_000)],
            spot_positions: vec![
                SpotPosition { market_index: 0, scaled_balance: 10, is_deposit: true, open_orders: 0 },
                SpotPosition { market_index: 1, scaled_balance: 3, is_deposit: false, open_orders: 0 },
            ],
            ..Default::default()
        };
        let (spot, perp_markets) = referenced_markets(&account, 0);
        assert_eq!(spot, vec![0, 1]);
        assert_eq!(perp_markets, vec![0, 2]);

        let (_, same_market) = referenced_markets(&account, 2);
        assert_eq!(same_market, vec![2]);
    }

    #[tokio::test]
    async fn remaining_metas_list_every_referenced_market() {
        let ex = offline_exchange(Pubkey::new_unique());
        let account = AccountState { positions: vec![perp(2, -1)], ..Default::default() };
        let (spot, perp_markets) = referenced_markets(&account, 0);
        let spot: Vec<Pubkey> = spot.iter().map(|i| ex.spot_market_pda(*i)).collect();
        let perp_markets: Vec<Pubkey> = perp_markets.iter().map(|i| ex.perp_market_pda(*i)).collect();

        // quote and market 0 share an oracle
        let shared = Pubkey::new_unique();
        let other = Pubkey::new_unique();
        let metas = remaining_metas(&[shared, shared, other], &spot, &perp_markets);

        let keys: Vec<Pubkey> = metas.iter().map(|m| m.pubkey).collect();
        assert_eq!(
            keys,
            vec![shared, other, ex.spot_market_pda(0), ex.perp_market_pda(0), ex.perp_market_pda(2)]
        );
        assert!(metas.iter().all(|m| !m.is_writable && !m.is_signer));
    }

    #[tokio::test]
    async fn instructions_carry_fixed_accounts() {
        let authority = Pubkey::new_unique();
        let ex = offline_exchange(authority);
        let order = OrderParams::limit(0, PositionDirection::Long, 1, 1);
        let ix = ex.instruction("place_perp_order", borsh::to_vec(&order).unwrap(), &[]);

        assert_eq!(ix.program_id.to_string(), DRIFT_PROGRAM_ID);
        assert_eq!(ix.accounts.len(), 3);
        assert_eq!(ix.accounts[1].pubkey, ex.user_pda());
        assert!(ix.accounts[1].is_writable);
        assert_eq!(ix.accounts[2].pubkey, authority);
        assert!(ix.accounts[2].is_signer);
        assert_eq!(&ix.data[..8], &anchor_discriminator("place_perp_order"));
        assert_eq!(ex.dlob_url, "https://dlob.example");
    }
}
