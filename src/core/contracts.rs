//! Contract metadata cache.
//!
//! Contracts are fetched once on first reference and kept for the process
//! lifetime; tick size/value feed every P&L computation.

use crate::api::{ApiError, RestClient};
use crate::models::Contract;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Default)]
pub struct ContractCache {
    contracts: RwLock<HashMap<String, Contract>>,
}

impl ContractCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, contract_id: &str) -> Option<Contract> {
        self.contracts.read().get(contract_id).cloned()
    }

    pub fn insert(&self, contract: Contract) {
        self.contracts
            .write()
            .insert(contract.contract_id.clone(), contract);
    }

    pub fn len(&self) -> usize {
        self.contracts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.read().is_empty()
    }

    /// Fetch-and-cache on first reference. Failures propagate so callers
    /// can skip metric computations for this contract.
    pub async fn get_or_fetch(
        &self,
        rest: &RestClient,
        contract_id: &str,
    ) -> Result<Contract, ApiError> {
        if let Some(contract) = self.get(contract_id) {
            return Ok(contract);
        }
        debug!(contract_id, "contract not cached, fetching");
        match rest.search_contract(contract_id).await {
            Ok(contract) => {
                self.insert(contract.clone());
                Ok(contract)
            }
            Err(err) => {
                warn!(contract_id, error = %err, "contract fetch failed");
                Err(err)
            }
        }
    }
}
