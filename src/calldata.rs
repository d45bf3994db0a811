//! Calldata for the configured action call.
//!
//! The action is described by a Solidity signature and a list of string arguments coerced to
//! the parameter types at startup, so a bad configuration fails before anything is sent.
//! The placeholder `{wallet}` may appear in any argument and is replaced by the acting
//! wallet's address when calldata is built for that wallet.

use alloy::dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, Specifier};
use alloy::json_abi::Function;
use alloy::primitives::{Address, Bytes};
use thiserror::Error;

pub const WALLET_PLACEHOLDER: &str = "{wallet}";

#[derive(Error, Debug)]
pub enum CalldataError {
    #[error("Invalid function signature '{0}': {1}")]
    InvalidFunctionSignature(String, String),

    #[error("Invalid Solidity type for parameter {index} of '{function}': {reason}")]
    InvalidSolidityType {
        function: String,
        index: usize,
        reason: String,
    },

    #[error("Argument count mismatch: expected {expected}, got {actual} for function '{function}'")]
    ArgumentCountMismatch {
        function: String,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to parse argument '{value}' as {ty}: {reason}")]
    ArgumentParseFailed {
        value: String,
        ty: String,
        reason: String,
    },

    #[error("ABI encoding failed: {0}")]
    EncodingFailed(String),
}

impl From<alloy::dyn_abi::Error> for CalldataError {
    fn from(err: alloy::dyn_abi::Error) -> Self {
        CalldataError::EncodingFailed(err.to_string())
    }
}

#[derive(Debug, Clone)]
enum Argument {
    /// Value known up front.
    Fixed(DynSolValue),
    /// Contains the wallet placeholder; coerced per wallet.
    PerWallet { ty: DynSolType, template: String },
}

/// A parsed, validated action call.
#[derive(Debug, Clone)]
pub struct ActionCall {
    function: Function,
    arguments: Vec<Argument>,
}

impl ActionCall {
    pub fn parse(signature: &str, args: &[String]) -> Result<Self, CalldataError> {
        let function = Function::parse(signature.trim()).map_err(|e| {
            CalldataError::InvalidFunctionSignature(signature.to_string(), e.to_string())
        })?;

        if function.inputs.len() != args.len() {
            return Err(CalldataError::ArgumentCountMismatch {
                function: function.signature(),
                expected: function.inputs.len(),
                actual: args.len(),
            });
        }

        let mut arguments = Vec::with_capacity(args.len());
        for (index, (param, raw)) in function.inputs.iter().zip(args).enumerate() {
            let ty = param
                .resolve()
                .map_err(|e| CalldataError::InvalidSolidityType {
                    function: function.signature(),
                    index,
                    reason: e.to_string(),
                })?;
            if raw.contains(WALLET_PLACEHOLDER) {
                // Validate the shape now with a stand-in address.
                coerce(&ty, &substitute(raw, Address::ZERO))?;
                arguments.push(Argument::PerWallet {
                    ty,
                    template: raw.clone(),
                });
            } else {
                arguments.push(Argument::Fixed(coerce(&ty, raw)?));
            }
        }

        Ok(Self {
            function,
            arguments,
        })
    }

    /// Canonical signature, e.g. `mint(address,uint256)`.
    pub fn signature(&self) -> String {
        self.function.signature()
    }

    /// Selector-prefixed calldata for `wallet`.
    pub fn encode_for(&self, wallet: Address) -> Result<Bytes, CalldataError> {
        let values = self
            .arguments
            .iter()
            .map(|argument| match argument {
                Argument::Fixed(value) => Ok(value.clone()),
                Argument::PerWallet { ty, template } => coerce(ty, &substitute(template, wallet)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let encoded = self.function.abi_encode_input(&values)?;
        Ok(encoded.into())
    }
}

fn substitute(template: &str, wallet: Address) -> String {
    template.replace(WALLET_PLACEHOLDER, &wallet.to_string())
}

fn coerce(ty: &DynSolType, value: &str) -> Result<DynSolValue, CalldataError> {
    ty.coerce_str(value)
        .map_err(|e| CalldataError::ArgumentParseFailed {
            value: value.to_string(),
            ty: ty.sol_type_name().into_owned(),
            reason: e.to_string(),
        })
}
