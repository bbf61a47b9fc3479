//! Contract identity resolution for one refresh run.

use std::collections::HashMap;

use cot_core::{ContractId, NewContract};
use tracing::debug;

use crate::store::{CotStore, StoreError};

/// Name to id cache for one ingestion run. Contracts are created on first
/// sighting and never duplicated.
pub struct ContractRegistry<'a> {
    store: &'a dyn CotStore,
    ids: HashMap<String, ContractId>,
    created: usize,
}

impl<'a> ContractRegistry<'a> {
    pub fn new(store: &'a dyn CotStore) -> Self {
        Self {
            store,
            ids: HashMap::new(),
            created: 0,
        }
    }

    /// Bulk-load every known contract into the cache.
    pub async fn preload(&mut self) -> Result<usize, StoreError> {
        let contracts = self.store.load_contracts().await?;
        for contract in contracts {
            self.ids.insert(contract.name, contract.id);
        }
        Ok(self.ids.len())
    }

    pub async fn resolve(
        &mut self,
        name: &str,
        regulatory_code: Option<&str>,
    ) -> Result<ContractId, StoreError> {
        let name = name.trim();
        if let Some(id) = self.ids.get(name) {
            return Ok(*id);
        }

        let id = match self.store.find_contract(name).await? {
            Some(existing) => existing.id,
            None => {
                let mut contract = NewContract::named(name);
                contract.regulatory_code = regulatory_code.map(str::to_string);
                let id = self.store.insert_contract(&contract).await?;
                self.created += 1;
                debug!(contract = name, %id, "registered new contract");
                id
            }
        };
        self.ids.insert(name.to_string(), id);
        Ok(id)
    }

    /// Contracts inserted by this registry.
    pub fn created(&self) -> usize {
        self.created
    }
}
