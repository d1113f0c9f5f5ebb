use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use soroban_client::address::{Address, AddressTrait as _};
use soroban_client::contract::{ContractBehavior, Contracts};
use soroban_client::keypair::{Keypair, KeypairBehavior};
use soroban_client::server::{Options, Server};
use soroban_client::soroban_rpc::soroban_rpc::{
    GetTransactionResponse, SendTransactionResponse, SendTransactionStatus,
};
use soroban_client::transaction::TransactionBehavior;
use soroban_client::transaction::TransactionBuilder;
use soroban_client::transaction_builder::TransactionBuilderBehavior;
use soroban_client::xdr::next::{int128_helpers::*, Int128Parts};
use soroban_client::xdr::next::{LedgerEntryData, Limits, ReadXdr, ScVal};
use thiserror::Error;

use crate::farm::Farm;
use crate::types::Receipt;

const TX_FEE: u32 = 10000;
const CONFIRM_TIMEOUT_SECS: u64 = 35;
const CONFIRM_POLL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum KaleError {
    #[error("invalid contract id: {0}")]
    InvalidContract(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("xdr encoding failed: {0}")]
    Encoding(String),
    #[error("rpc request failed: {0}")]
    Rpc(String),
    #[error("simulation rejected: {0}")]
    Simulation(String),
    #[error("transaction rejected by the network")]
    Rejected,
    #[error("transaction failed: {0}")]
    Failed(String),
    #[error("transaction not confirmed after {0}s")]
    ConfirmTimeout(u64),
    #[error("unexpected return value: {0}")]
    UnexpectedReturn(String),
}

/// Soroban RPC implementation of the farm calls: builds, simulates, signs and
/// submits the contract invocation, then polls until it lands.
pub struct KaleClient {
    contract: Contracts,
    network: String,
    server: Server,
    keypair: Keypair,
}

impl std::fmt::Debug for KaleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KaleClient")
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl KaleClient {
    pub fn new(
        contract_id: &str,
        keypair: Keypair,
        network: String,
        rpc_url: &str,
        opts: Options,
    ) -> Result<Self, KaleError> {
        let contract =
            Contracts::new(contract_id).map_err(|e| KaleError::InvalidContract(format!("{e:?}")))?;
        Ok(KaleClient {
            contract,
            network,
            server: Server::new(rpc_url, opts),
            keypair,
        })
    }

    /// Current farming index from the contract instance storage, 0 when the
    /// contract has no `FarmIndex` entry yet.
    pub async fn farm_index(&self) -> Result<u32, KaleError> {
        let data = self
            .server
            .get_ledger_entries(vec![self.contract.get_footprint()])
            .await
            .map_err(|e| KaleError::Rpc(format!("{e:?}")))?;

        let Some(entries) = data.result.entries else {
            return Ok(0);
        };
        let farm_index = ScVal::Symbol("FarmIndex".try_into().unwrap());
        for e in entries {
            let Ok(LedgerEntryData::ContractData(entry)) =
                LedgerEntryData::from_xdr_base64(e.xdr, Limits::none())
            else {
                continue;
            };
            let ScVal::ContractInstance(instance) = entry.val else {
                continue;
            };
            let Some(storage) = instance.storage else {
                continue;
            };
            for s in storage.iter() {
                if let ScVal::Vec(Some(v)) = s.key.clone() {
                    if v.first() == Some(&farm_index) {
                        if let ScVal::U32(i) = s.val {
                            return Ok(i);
                        }
                    }
                }
            }
        }
        Ok(0)
    }

    fn address_val(&self, farmer: &str) -> Result<ScVal, KaleError> {
        let address =
            Address::new(farmer).map_err(|e| KaleError::InvalidAddress(format!("{e:?}")))?;
        address
            .to_sc_val()
            .map_err(|e| KaleError::Encoding(format!("{e:?}")))
    }

    async fn invoke(
        &self,
        method: &str,
        params: Option<Vec<ScVal>>,
    ) -> Result<(String, Option<ScVal>), KaleError> {
        let account = self
            .server
            .get_account(self.keypair.public_key().as_str())
            .await
            .map_err(|e| KaleError::Rpc(format!("{e:?}")))?;
        let source_account = Rc::new(RefCell::new(account));

        let contract_tx = TransactionBuilder::new(source_account, self.network.as_str(), None)
            .fee(TX_FEE)
            .add_operation(self.contract.call(method, params))
            .set_timeout(15)
            .expect("Timeout setting failed, it should not")
            .build();

        let simulation = self
            .server
            .simulate_transaction(contract_tx.clone(), None)
            .await
            .map_err(|e| KaleError::Rpc(format!("{e:?}")))?;
        if let Some(err) = simulation.error {
            return Err(KaleError::Simulation(format!("{err:?}")));
        }

        let mut prepared = self
            .server
            .prepare_transaction(contract_tx, Some(self.network.as_str()))
            .await
            .map_err(|e| KaleError::Rpc(format!("{e:?}")))?;
        prepared.sign(&[self.keypair.clone()]);

        let response = self
            .server
            .send_transaction(prepared)
            .await
            .map_err(|e| KaleError::Rpc(format!("{e:?}")))?;

        self.confirm(response).await
    }

    async fn confirm(
        &self,
        response: SendTransactionResponse,
    ) -> Result<(String, Option<ScVal>), KaleError> {
        let id = response.base.hash;
        match response.base.status {
            SendTransactionStatus::Pending | SendTransactionStatus::Success => {}
            _ => return Err(KaleError::Rejected),
        }

        let start = Instant::now();
        loop {
            let r = self
                .server
                .get_transaction(id.as_str())
                .await
                .map_err(|e| KaleError::Rpc(format!("{e:?}")))?;
            match r {
                GetTransactionResponse::Successful(info) => {
                    return Ok((id, info.returnValue));
                }
                GetTransactionResponse::Failed(f) => {
                    return Err(KaleError::Failed(format!("{f:?}")));
                }
                _ if start.elapsed().as_secs() > CONFIRM_TIMEOUT_SECS => {
                    return Err(KaleError::ConfirmTimeout(CONFIRM_TIMEOUT_SECS));
                }
                _ => tokio::time::sleep(CONFIRM_POLL).await,
            }
        }
    }
}

impl Farm for KaleClient {
    type Error = KaleError;

    async fn plant(&self, farmer: &str, amount: i128) -> Result<Receipt<()>, KaleError> {
        let farmer_val = self.address_val(farmer)?;
        let amount_val = ScVal::I128(Int128Parts {
            hi: i128_hi(amount),
            lo: i128_lo(amount),
        });

        let (hash, value) = self.invoke("plant", Some(vec![farmer_val, amount_val])).await?;
        match value {
            Some(ScVal::Void) => Ok(Receipt { hash, value: () }),
            other => Err(KaleError::UnexpectedReturn(format!("{other:?}"))),
        }
    }

    async fn work(&self, farmer: &str, hash: Vec<u8>, nonce: u64) -> Result<Receipt<u32>, KaleError> {
        let farmer_val = self.address_val(farmer)?;
        let hash_val: ScVal = hash
            .try_into()
            .map_err(|e| KaleError::Encoding(format!("{e:?}")))?;
        let nonce_val = ScVal::U64(nonce);

        let (hash, value) = self
            .invoke("work", Some(vec![farmer_val, hash_val, nonce_val]))
            .await?;
        match value {
            Some(ScVal::U32(gap)) => Ok(Receipt { hash, value: gap }),
            other => Err(KaleError::UnexpectedReturn(format!("{other:?}"))),
        }
    }

    async fn harvest(&self, farmer: &str, index: u32) -> Result<Receipt<i128>, KaleError> {
        let farmer_val = self.address_val(farmer)?;
        let index_val = ScVal::U32(index);

        let (hash, value) = self
            .invoke("harvest", Some(vec![farmer_val, index_val]))
            .await?;
        match value {
            Some(ScVal::I128(parts)) => Ok(Receipt {
                hash,
                value: i128_from_pieces(parts.hi, parts.lo),
            }),
            other => Err(KaleError::UnexpectedReturn(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soroban_client::network::{NetworkPassphrase, Networks};

    const SECRET: &str = "SAAACAQDAQCQMBYIBEFAWDANBYHRAEISCMKBKFQXDAMRUGY4DUPB6NKI";
    const CONTRACT: &str = "CDL74RF5BLYR2YBLCCI7F5FB6TPSCLKEJUBSD2RSVWZ4YHF3VMFAIGWA";

    fn opts() -> Options {
        Options {
            allow_http: None,
            timeout: None,
            headers: None,
        }
    }

    #[test]
    fn builds_a_client_from_cli_inputs() {
        let keypair = Keypair::from_secret(SECRET).unwrap();
        let client = KaleClient::new(
            CONTRACT,
            keypair,
            Networks::public().to_string(),
            "https://mainnet.sorobanrpc.com",
            opts(),
        );
        assert!(client.is_ok());
    }

    #[test]
    fn rejects_a_malformed_contract_id() {
        let keypair = Keypair::from_secret(SECRET).unwrap();
        let err = KaleClient::new(
            "not a contract",
            keypair,
            Networks::public().to_string(),
            "https://mainnet.sorobanrpc.com",
            opts(),
        )
        .unwrap_err();
        assert!(matches!(err, KaleError::InvalidContract(_)));
    }
}
