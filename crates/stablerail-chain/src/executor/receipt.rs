use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Confirmed,
    Failed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of dispatching one payment mandate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReceipt {
    pub mandate_id: String,
    pub tx_hash: String,
    pub chain: String,
    pub block_number: Option<u64>,
    pub confirmations: u64,
    /// Audit hash carried in the calldata suffix.
    pub audit_anchor: Option<String>,
    pub status: ReceiptStatus,
    /// Revert or rejection reason for `failed` receipts.
    pub reason: Option<String>,
    pub from: String,
    pub to: String,
    pub amount_minor: u64,
    pub token: String,
}

impl ChainReceipt {
    pub fn is_confirmed(&self) -> bool {
        self.status == ReceiptStatus::Confirmed
    }
}

/// Confirmation tracker lifecycle.
///
/// ```text
/// Pending ──► Confirmed
///    │  ├───► Failed
///    │  └───► TimedOut    (receipt stays pending)
///    └──────► Cancelled   (receipt stays pending)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Pending,
    Confirmed,
    Failed,
    TimedOut,
    Cancelled,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Latest tracker state and receipt, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchState {
    pub poll: PollState,
    pub receipt: ChainReceipt,
}

/// Wei amounts serialize as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasEstimate {
    pub chain: String,
    pub gas_limit: u64,
    #[serde(with = "wei")]
    pub base_fee_per_gas: u128,
    #[serde(with = "wei")]
    pub max_priority_fee_per_gas: u128,
    #[serde(with = "wei")]
    pub max_fee_per_gas: u128,
    /// `gas_limit × max_fee_per_gas`, the most the transfer can cost.
    #[serde(with = "wei")]
    pub max_cost_wei: u128,
}

mod wei {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gas_estimate_wei_as_strings() {
        let estimate = GasEstimate {
            chain: "base".into(),
            gas_limit: 60_000,
            base_fee_per_gas: 1_000_000_000,
            max_priority_fee_per_gas: 1_500_000_000,
            max_fee_per_gas: 3_500_000_000,
            max_cost_wei: 210_000_000_000_000,
        };
        let value = serde_json::to_value(&estimate).unwrap();
        assert_eq!(value["max_fee_per_gas"], "3500000000");
        assert_eq!(value["gas_limit"], 60_000);
        let back: GasEstimate = serde_json::from_value(value).unwrap();
        assert_eq!(back, estimate);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!PollState::Pending.is_terminal());
        for state in [
            PollState::Confirmed,
            PollState::Failed,
            PollState::TimedOut,
            PollState::Cancelled,
        ] {
            assert!(state.is_terminal());
        }
    }
}
