//! Fee quoting, ceiling enforcement and replacement bumps.

use alloy::network::TransactionBuilder;
use alloy::primitives::U256;
use alloy::rpc::types::TransactionRequest;

use crate::chain::{ChainClient, ChainError, FeeData};

/// Fees offered for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasQuote {
    Legacy { gas_price: u128 },
    Eip1559 { max_fee: u128, max_priority_fee: u128 },
}

impl GasQuote {
    /// Worst-case price per gas unit.
    pub fn fee_per_gas(&self) -> u128 {
        match self {
            GasQuote::Legacy { gas_price } => *gas_price,
            GasQuote::Eip1559 { max_fee, .. } => *max_fee,
        }
    }

    /// Worst-case cost of `gas_limit` units.
    pub fn cost(&self, gas_limit: u64) -> U256 {
        U256::from(gas_limit) * U256::from(self.fee_per_gas())
    }

    /// Quote raised by `percent`, clamped to `ceiling`.
    ///
    /// Every raised value is strictly greater than before unless it already sits at the ceiling.
    pub fn bumped(&self, percent: u32, ceiling: Option<u128>) -> GasQuote {
        match *self {
            GasQuote::Legacy { gas_price } => GasQuote::Legacy {
                gas_price: bump(gas_price, percent, ceiling),
            },
            GasQuote::Eip1559 {
                max_fee,
                max_priority_fee,
            } => {
                let max_fee = bump(max_fee, percent, ceiling);
                GasQuote::Eip1559 {
                    max_fee,
                    max_priority_fee: bump(max_priority_fee, percent, Some(max_fee)),
                }
            }
        }
    }

    /// Writes the fee fields onto `tx`.
    pub fn apply(&self, tx: TransactionRequest) -> TransactionRequest {
        match *self {
            GasQuote::Legacy { gas_price } => tx.with_gas_price(gas_price),
            GasQuote::Eip1559 {
                max_fee,
                max_priority_fee,
            } => tx
                .with_max_fee_per_gas(max_fee)
                .with_max_priority_fee_per_gas(max_priority_fee),
        }
    }
}

fn bump(value: u128, percent: u32, ceiling: Option<u128>) -> u128 {
    let raised = (value.saturating_mul(100 + percent as u128) / 100).max(value.saturating_add(1));
    match ceiling {
        Some(ceiling) => raised.min(ceiling.max(value)),
        None => raised,
    }
}

/// Turns live fee data into a [`GasQuote`] under the configured policy.
#[derive(Debug, Clone, Copy)]
pub struct GasPricer {
    /// Maximum price per gas the pipeline will ever offer, in wei.
    pub ceiling: Option<u128>,
    /// Fixed priority fee overriding the node's suggestion, in wei.
    pub priority_fee: Option<u128>,
    pub eip1559: bool,
}

impl GasPricer {
    pub fn quote(&self, fees: &FeeData) -> GasQuote {
        let quote = match (self.eip1559, fees.max_fee_per_gas) {
            (true, Some(estimated_max_fee)) => {
                let max_priority_fee = self
                    .priority_fee
                    .or(fees.max_priority_fee_per_gas)
                    .unwrap_or_default();
                GasQuote::Eip1559 {
                    max_fee: estimated_max_fee.max(max_priority_fee),
                    max_priority_fee,
                }
            }
            _ => GasQuote::Legacy {
                gas_price: fees.gas_price,
            },
        };
        self.clamp(quote)
    }

    /// Fetches live fees from `chain` and quotes them.
    pub async fn fetch<C: ChainClient + ?Sized>(&self, chain: &C) -> Result<GasQuote, ChainError> {
        let fees = chain.fee_estimate().await?;
        Ok(self.quote(&fees))
    }

    fn clamp(&self, quote: GasQuote) -> GasQuote {
        let Some(ceiling) = self.ceiling else {
            return quote;
        };
        if quote.fee_per_gas() > ceiling {
            tracing::warn!(
                quoted = quote.fee_per_gas(),
                ceiling,
                "network fee above gas ceiling, clamping"
            );
        }
        match quote {
            GasQuote::Legacy { gas_price } => GasQuote::Legacy {
                gas_price: gas_price.min(ceiling),
            },
            GasQuote::Eip1559 {
                max_fee,
                max_priority_fee,
            } => {
                let max_fee = max_fee.min(ceiling);
                GasQuote::Eip1559 {
                    max_fee,
                    max_priority_fee: max_priority_fee.min(max_fee),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GWEI: u128 = 1_000_000_000;

    fn fees(gas_price: u128, max_fee: Option<u128>, tip: Option<u128>) -> FeeData {
        FeeData {
            gas_price,
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: tip,
        }
    }

    #[test]
    fn test_legacy_quote_when_fee_market_disabled() {
        let pricer = GasPricer {
            ceiling: None,
            priority_fee: None,
            eip1559: false,
        };
        let quote = pricer.quote(&fees(5 * GWEI, Some(9 * GWEI), Some(GWEI)));
        assert_eq!(quote, GasQuote::Legacy { gas_price: 5 * GWEI });
    }

    #[test]
    fn test_legacy_fallback_when_node_has_no_fee_market() {
        let pricer = GasPricer {
            ceiling: None,
            priority_fee: None,
            eip1559: true,
        };
        assert!(matches!(
            pricer.quote(&fees(5 * GWEI, None, None)),
            GasQuote::Legacy { gas_price } if gas_price == 5 * GWEI
        ));
    }

    #[test]
    fn test_configured_priority_fee_overrides_node() {
        let pricer = GasPricer {
            ceiling: None,
            priority_fee: Some(3 * GWEI),
            eip1559: true,
        };
        let quote = pricer.quote(&fees(5 * GWEI, Some(20 * GWEI), Some(GWEI)));
        assert_eq!(
            quote,
            GasQuote::Eip1559 {
                max_fee: 20 * GWEI,
                max_priority_fee: 3 * GWEI
            }
        );
    }

    #[test]
    fn test_quote_never_exceeds_ceiling() {
        let pricer = GasPricer {
            ceiling: Some(10 * GWEI),
            priority_fee: Some(15 * GWEI),
            eip1559: true,
        };
        let quote = pricer.quote(&fees(50 * GWEI, Some(60 * GWEI), None));
        assert_eq!(quote.fee_per_gas(), 10 * GWEI);
        let GasQuote::Eip1559 {
            max_priority_fee, ..
        } = quote
        else {
            panic!("expected fee-market quote");
        };
        assert_eq!(max_priority_fee, 10 * GWEI);
    }

    #[test]
    fn test_cost_is_limit_times_worst_case_price() {
        let quote = GasQuote::Eip1559 {
            max_fee: 30 * GWEI,
            max_priority_fee: 2 * GWEI,
        };
        assert_eq!(quote.cost(21_000), U256::from(21_000u128 * 30 * GWEI));
    }

    #[test]
    fn test_bump_raises_both_fee_fields() {
        let quote = GasQuote::Eip1559 {
            max_fee: 100,
            max_priority_fee: 10,
        };
        assert_eq!(
            quote.bumped(20, None),
            GasQuote::Eip1559 {
                max_fee: 120,
                max_priority_fee: 12
            }
        );
    }

    #[test]
    fn test_bump_is_strictly_increasing_for_tiny_values() {
        let quote = GasQuote::Legacy { gas_price: 1 };
        assert_eq!(quote.bumped(10, None), GasQuote::Legacy { gas_price: 2 });
    }

    #[test]
    fn test_bump_stops_at_ceiling() {
        let quote = GasQuote::Legacy { gas_price: 95 };
        let bumped = quote.bumped(20, Some(100));
        assert_eq!(bumped, GasQuote::Legacy { gas_price: 100 });
        assert_eq!(bumped.bumped(20, Some(100)), bumped);
    }

    #[test]
    fn test_apply_sets_request_fields() {
        let tx = GasQuote::Legacy { gas_price: 7 }.apply(TransactionRequest::default());
        assert_eq!(tx.gas_price, Some(7));
        let tx = GasQuote::Eip1559 {
            max_fee: 9,
            max_priority_fee: 2,
        }
        .apply(TransactionRequest::default());
        assert_eq!(tx.max_fee_per_gas, Some(9));
        assert_eq!(tx.max_priority_fee_per_gas, Some(2));
    }
}
