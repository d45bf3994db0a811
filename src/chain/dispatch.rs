//! Ranked transaction dispatch strategies.
//!
//! A sender address can be served in more than one way: by a key held locally (sign, then
//! `eth_sendRawTransaction`) or by an account unlocked on the node (`eth_sendTransaction`,
//! dev chains only). Strategies are tried in rank order and the first one whose capability
//! is present wins. Selection is kept apart from transaction building so each strategy can
//! be checked on its own.

use alloy::primitives::Address;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchStrategy {
    /// Sign with a locally registered key and broadcast the raw envelope.
    LocalSigner,
    /// Let the node sign with one of its own unlocked accounts.
    NodeAccount,
}

impl DispatchStrategy {
    /// Default preference order.
    pub const RANKED: [DispatchStrategy; 2] =
        [DispatchStrategy::LocalSigner, DispatchStrategy::NodeAccount];

    pub fn name(&self) -> &'static str {
        match self {
            DispatchStrategy::LocalSigner => "local-signer",
            DispatchStrategy::NodeAccount => "node-account",
        }
    }

    pub fn is_available(&self, capabilities: &SenderCapabilities) -> bool {
        match self {
            DispatchStrategy::LocalSigner => capabilities.local_signer,
            DispatchStrategy::NodeAccount => capabilities.node_account,
        }
    }
}

impl Display for DispatchStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What is known about a particular sender address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderCapabilities {
    pub local_signer: bool,
    pub node_account: bool,
}

impl SenderCapabilities {
    pub fn probe(
        address: Address,
        has_local_signer: impl Fn(&Address) -> bool,
        node_accounts: &HashSet<Address>,
    ) -> Self {
        Self {
            local_signer: has_local_signer(&address),
            node_account: node_accounts.contains(&address),
        }
    }
}

/// First strategy in `ranked` that `capabilities` supports.
pub fn select_strategy(
    ranked: &[DispatchStrategy],
    capabilities: &SenderCapabilities,
) -> Option<DispatchStrategy> {
    ranked
        .iter()
        .copied()
        .find(|strategy| strategy.is_available(capabilities))
}
