// src/ledger.rs

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const WALL_POST: &str = "WALL_POST";
pub const NHA_INVOCATION: &str = "NHA_INVOCATION";
pub const BOARD_MEETING: &str = "BOARD_MEETING";
pub const BITS_DRY_RUN: &str = "BITS_DRY_RUN";

static BUILTIN_TARIFFS: Lazy<HashMap<String, i64>> = Lazy::new(|| {
    HashMap::from([
        (WALL_POST.to_string(), -25),
        (NHA_INVOCATION.to_string(), -40),
        (BOARD_MEETING.to_string(), -60),
        (BITS_DRY_RUN.to_string(), -5),
    ])
});

/// Named action costs. Costs are signed deltas; debits are negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tariffs(HashMap<String, i64>);

impl Tariffs {
    pub fn builtin() -> Self {
        Self(BUILTIN_TARIFFS.clone())
    }

    /// Builtin table with overrides merged in from a JSON file of
    /// `{"KEY": cost}` pairs.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let overrides: HashMap<String, i64> = serde_json::from_str(&raw)?;
        let mut table = BUILTIN_TARIFFS.clone();
        table.extend(overrides);
        Ok(Self(table))
    }

    pub fn cost(&self, key: &str) -> Option<i64> {
        self.0.get(key).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LedgerEntry {
    pub tenant_id: String,
    pub delta: i64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Admission {
    pub ok: bool,
    pub new_balance: i64,
}

#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error("unknown tariff key `{0}`")]
    UnknownTariff(String),
}

struct TenantAccount {
    balance: i64,
    entries: Vec<LedgerEntry>,
    /// idempotency key -> previously returned admission
    admitted_refs: HashMap<String, Admission>,
}

/// Pre-flight admission check and atomic debit, one account per tenant.
/// All balance mutation goes through `admit`/`credit` under the tenant's
/// mutex; there is no read-then-write path.
pub struct MeteringGate {
    tariffs: Tariffs,
    opening_balance: i64,
    accounts: DashMap<String, Arc<Mutex<TenantAccount>>>,
}

impl MeteringGate {
    pub fn new(tariffs: Tariffs, opening_balance: i64) -> Arc<Self> {
        Arc::new(Self {
            tariffs,
            opening_balance,
            accounts: DashMap::new(),
        })
    }

    fn account(&self, tenant_id: &str) -> Arc<Mutex<TenantAccount>> {
        self.accounts
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TenantAccount {
                    balance: self.opening_balance,
                    entries: Vec::new(),
                    admitted_refs: HashMap::new(),
                }))
            })
            .clone()
    }

    /// Atomic check-and-debit. A rejected call leaves the balance untouched.
    /// An `admit` carrying a `ref_id` the tenant's ledger has already seen
    /// replays the recorded outcome without a second debit.
    pub async fn admit(
        &self,
        tenant_id: &str,
        tariff_key: &str,
        ref_id: Option<&str>,
    ) -> Result<Admission, AdmissionError> {
        let cost = self
            .tariffs
            .cost(tariff_key)
            .ok_or_else(|| AdmissionError::UnknownTariff(tariff_key.to_string()))?;

        let account = self.account(tenant_id);
        let mut account = account.lock().await;

        if let Some(key) = ref_id {
            if let Some(previous) = account.admitted_refs.get(key) {
                debug!(tenant_id, tariff_key, ref_id = key, "replaying admission");
                return Ok(previous.clone());
            }
        }

        let admission = if account.balance + cost < 0 {
            Admission { ok: false, new_balance: account.balance }
        } else {
            account.balance += cost;
            let entry = LedgerEntry {
                tenant_id: tenant_id.to_string(),
                delta: cost,
                reason: tariff_key.to_string(),
                ref_id: ref_id.map(str::to_string),
                timestamp: Utc::now(),
            };
            account.entries.push(entry);
            Admission { ok: true, new_balance: account.balance }
        };

        if let Some(key) = ref_id {
            account.admitted_refs.insert(key.to_string(), admission.clone());
        }
        Ok(admission)
    }

    pub async fn credit(&self, tenant_id: &str, amount: i64, reason: &str) -> i64 {
        let account = self.account(tenant_id);
        let mut account = account.lock().await;
        account.balance += amount;
        let entry = LedgerEntry {
            tenant_id: tenant_id.to_string(),
            delta: amount,
            reason: reason.to_string(),
            ref_id: None,
            timestamp: Utc::now(),
        };
        account.entries.push(entry);
        account.balance
    }

    pub async fn balance(&self, tenant_id: &str) -> i64 {
        self.account(tenant_id).lock().await.balance
    }

    pub async fn entries(&self, tenant_id: &str) -> Vec<LedgerEntry> {
        self.account(tenant_id).lock().await.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(balance: i64) -> Arc<MeteringGate> {
        MeteringGate::new(Tariffs::builtin(), balance)
    }

    #[tokio::test]
    async fn admit_debits_and_returns_new_balance() {
        let gate = gate(100);
        let admission = gate.admit("acme", WALL_POST, None).await.unwrap();
        assert!(admission.ok);
        assert_eq!(admission.new_balance, 75);
        assert_eq!(gate.balance("acme").await, 75);

        let entries = gate.entries("acme").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].delta, -25);
        assert_eq!(entries[0].reason, WALL_POST);
    }

    #[tokio::test]
    async fn rejection_leaves_balance_untouched() {
        let gate = gate(10);
        let admission = gate.admit("acme", NHA_INVOCATION, None).await.unwrap();
        assert!(!admission.ok);
        assert_eq!(admission.new_balance, 10);
        assert_eq!(gate.balance("acme").await, 10);
        assert!(gate.entries("acme").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_tariff_is_an_error() {
        let gate = gate(100);
        match gate.admit("acme", "NOT_A_TARIFF", None).await {
            Err(AdmissionError::UnknownTariff(key)) => assert_eq!(key, "NOT_A_TARIFF"),
            other => panic!("expected unknown tariff, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admits_never_double_spend() {
        // balance covers exactly 3 of the 8 debits
        let gate = gate(3 * 40);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.admit("acme", NHA_INVOCATION, None).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().ok {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 3);
        assert_eq!(gate.balance("acme").await, 0);
    }

    #[tokio::test]
    async fn idempotency_key_replays_without_second_debit() {
        let gate = gate(100);
        let first = gate.admit("acme", WALL_POST, Some("run-1")).await.unwrap();
        let second = gate.admit("acme", WALL_POST, Some("run-1")).await.unwrap();

        assert!(first.ok && second.ok);
        assert_eq!(first.new_balance, second.new_balance);
        assert_eq!(gate.balance("acme").await, 75);
        assert_eq!(gate.entries("acme").await.len(), 1);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let gate = gate(100);
        gate.admit("acme", WALL_POST, None).await.unwrap();
        assert_eq!(gate.balance("acme").await, 75);
        assert_eq!(gate.balance("globex").await, 100);
    }

    #[tokio::test]
    async fn credit_tops_up() {
        let gate = gate(0);
        assert!(!gate.admit("acme", BITS_DRY_RUN, None).await.unwrap().ok);
        gate.credit("acme", 50, "TOPUP").await;
        assert!(gate.admit("acme", BITS_DRY_RUN, None).await.unwrap().ok);
        assert_eq!(gate.balance("acme").await, 45);
    }
}
