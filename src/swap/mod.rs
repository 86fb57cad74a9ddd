pub mod events;
pub mod rotation;
pub mod settlement;
pub mod store;

use std::fmt;
use std::str::FromStr;

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

use crate::proto::boltzrpc as pb;

/// Status token the daemon emits when an automated swap has been created.
pub const STATUS_SWAP_CREATED: &str = "swap.created";
/// Status token for a lockup transaction seen in the mempool.
pub const STATUS_TRANSACTION_MEMPOOL: &str = "transaction.mempool";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapKind {
    Submarine,
    Reverse,
    Chain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Pending,
    Successful,
    Error,
    ServerError,
    Refunded,
    Abandoned,
}

impl From<pb::SwapState> for SwapState {
    fn from(state: pb::SwapState) -> Self {
        match state {
            pb::SwapState::Pending => SwapState::Pending,
            pb::SwapState::Successful => SwapState::Successful,
            pb::SwapState::Error => SwapState::Error,
            pb::SwapState::ServerError => SwapState::ServerError,
            pb::SwapState::Refunded => SwapState::Refunded,
            pb::SwapState::Abandoned => SwapState::Abandoned,
        }
    }
}

/// One swap state change as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapEvent {
    pub swap_id: String,
    pub kind: SwapKind,
    pub status: String,
    pub state: SwapState,
    pub is_automated: bool,
    pub tenant_id: u64,
    pub lockup_address: Option<String>,
    pub claim_address: Option<String>,
    pub to_address: Option<String>,
    pub lockup_tx_id: Option<String>,
    pub refund_tx_id: Option<String>,
    pub refund_address: Option<String>,
    pub amount: Amount,
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

impl SwapEvent {
    pub fn from_submarine(swap: &pb::SwapInfo) -> Self {
        Self {
            swap_id: swap.id.clone(),
            kind: SwapKind::Submarine,
            status: swap.status.clone(),
            state: swap.state().into(),
            is_automated: swap.is_auto,
            tenant_id: swap.tenant_id,
            lockup_address: non_empty(&swap.lockup_address),
            claim_address: None,
            to_address: None,
            lockup_tx_id: swap.lockup_transaction_id.clone(),
            refund_tx_id: swap.refund_transaction_id.clone(),
            refund_address: swap.refund_address.clone(),
            amount: Amount::from_sat(swap.expected_amount),
        }
    }

    pub fn from_reverse(swap: &pb::ReverseSwapInfo) -> Self {
        Self {
            swap_id: swap.id.clone(),
            kind: SwapKind::Reverse,
            status: swap.status.clone(),
            state: swap.state().into(),
            is_automated: swap.is_auto,
            tenant_id: swap.tenant_id,
            lockup_address: non_empty(&swap.lockup_address),
            claim_address: non_empty(&swap.claim_address),
            to_address: None,
            lockup_tx_id: swap.lockup_transaction_id.clone(),
            refund_tx_id: None,
            refund_address: None,
            amount: Amount::from_sat(swap.onchain_amount),
        }
    }

    pub fn from_chain(swap: &pb::ChainSwapInfo) -> Self {
        let from = swap.from_data.as_ref();
        let to = swap.to_data.as_ref();
        Self {
            swap_id: swap.id.clone(),
            kind: SwapKind::Chain,
            status: swap.status.clone(),
            state: swap.state().into(),
            is_automated: swap.is_auto,
            tenant_id: swap.tenant_id,
            lockup_address: from.and_then(|d| non_empty(&d.lockup_address)),
            claim_address: None,
            to_address: to.and_then(|d| d.address.clone()),
            lockup_tx_id: from.and_then(|d| d.lockup_transaction_id.clone()),
            refund_tx_id: swap.refund_transaction_id.clone(),
            refund_address: swap.refund_address.clone(),
            amount: Amount::from_sat(from.map(|d| d.amount).unwrap_or_default()),
        }
    }

    pub fn from_response(resp: &pb::GetSwapInfoResponse) -> Option<Self> {
        if let Some(swap) = &resp.swap {
            Some(Self::from_submarine(swap))
        } else if let Some(swap) = &resp.reverse_swap {
            Some(Self::from_reverse(swap))
        } else {
            resp.chain_swap.as_ref().map(Self::from_chain)
        }
    }

    pub fn from_list(resp: &pb::ListSwapsResponse) -> Vec<Self> {
        resp.swaps
            .iter()
            .map(Self::from_submarine)
            .chain(resp.reverse_swaps.iter().map(Self::from_reverse))
            .chain(resp.chain_swaps.iter().map(Self::from_chain))
            .collect()
    }

    /// Address the swap pays out to, for the kinds AutoSwap drives.
    pub fn destination(&self) -> Option<&str> {
        match self.kind {
            SwapKind::Chain => self.to_address.as_deref(),
            SwapKind::Reverse => self.claim_address.as_deref(),
            SwapKind::Submarine => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Processing,
    Settled,
}

/// Platform currency: `code` and number of fractional digits it is tracked with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyUnit {
    pub code: String,
    pub divisibility: u32,
}

impl CurrencyUnit {
    pub fn btc() -> Self {
        Self {
            code: "BTC".to_string(),
            divisibility: 8,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("{sats} sat is not representable with {divisibility} decimals")]
    Inexact { sats: u64, divisibility: u32 },
    #[error("divisibility {0} is out of range")]
    Divisibility(u32),
    #[error("invalid decimal amount `{0}`")]
    Parse(String),
}

const SATS_DECIMALS: u32 = 8;
const MAX_DIVISIBILITY: u32 = 18;

/// Fixed-point amount: `minor_units / 10^divisibility`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentAmount {
    minor_units: u128,
    divisibility: u32,
}

impl PaymentAmount {
    /// Converts satoshis into `unit`, staying in integers. Fails instead of
    /// rounding when `unit` has fewer than eight decimals and the amount has
    /// sub-unit satoshis.
    pub fn from_sats(amount: Amount, unit: &CurrencyUnit) -> Result<Self, AmountError> {
        let divisibility = unit.divisibility;
        if divisibility > MAX_DIVISIBILITY {
            return Err(AmountError::Divisibility(divisibility));
        }
        let sats = amount.to_sat();
        let scaled = u128::from(sats) * 10u128.pow(divisibility);
        let one_btc = u128::from(Amount::ONE_BTC.to_sat());
        if scaled % one_btc != 0 {
            return Err(AmountError::Inexact { sats, divisibility });
        }
        Ok(Self {
            minor_units: scaled / one_btc,
            divisibility,
        })
    }

    pub fn new(minor_units: u128, divisibility: u32) -> Result<Self, AmountError> {
        if divisibility > MAX_DIVISIBILITY {
            return Err(AmountError::Divisibility(divisibility));
        }
        Ok(Self {
            minor_units,
            divisibility,
        })
    }

    pub fn minor_units(&self) -> u128 {
        self.minor_units
    }

    pub fn divisibility(&self) -> u32 {
        self.divisibility
    }

    /// Value in satoshis, assuming a BTC-denominated amount.
    pub fn to_sats(&self) -> Option<u64> {
        let scaled = if self.divisibility >= SATS_DECIMALS {
            self.minor_units / 10u128.pow(self.divisibility - SATS_DECIMALS)
        } else {
            self.minor_units * 10u128.pow(SATS_DECIMALS - self.divisibility)
        };
        u64::try_from(scaled).ok()
    }
}

impl fmt::Display for PaymentAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = 10u128.pow(self.divisibility);
        let whole = self.minor_units / scale;
        let frac = self.minor_units % scale;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:0width$}", width = self.divisibility as usize);
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl FromStr for PaymentAmount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AmountError::Parse(s.to_string());
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let divisibility = u32::try_from(frac.len()).map_err(|_| err())?;
        if divisibility > MAX_DIVISIBILITY {
            return Err(AmountError::Divisibility(divisibility));
        }
        let digits = format!("{whole}{frac}");
        let minor_units = digits.parse::<u128>().map_err(|_| err())?;
        Ok(Self {
            minor_units,
            divisibility,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub swap_id: String,
    pub transaction_id: String,
    pub refund_transaction_id: Option<String>,
    pub refund_address: Option<String>,
}

/// Platform payment created from a swap lockup. `id` is the lockup txid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub id: String,
    pub status: PaymentStatus,
    pub amount: PaymentAmount,
    pub currency: String,
    pub details: PaymentDetails,
}
