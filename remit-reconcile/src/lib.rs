#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Reconciliation: scheduled comparison of local AR truth against the
//! processor's view. Divergences are recorded, never auto-resolved —
//! resolution is a follow-up command with its own audit trail, or an
//! explicit write-off.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use remit_ledger::ArStore;
use remit_ledger::ChargeStatus;
use remit_ledger::RefundStatus;
use remit_ledger::SubscriptionStatus;
use remit_processor::ProcessorClient;
use remit_retry::RunBudget;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub type TenantId = String;
pub type RunId = String;
pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("run {0} not found")]
    RunNotFound(RunId),
    #[error("snapshot error: {0}")]
    Snapshot(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<remit_ledger::LedgerError> for ReconcileError {
    fn from(err: remit_ledger::LedgerError) -> Self {
        ReconcileError::Snapshot(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceType {
    StatusMismatch,
    AmountMismatch,
    MissingLocal,
    MissingRemote,
    StaleMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Subscription,
    PaymentMethod,
    Charge,
    Refund,
}

/// A recorded disagreement, with both sides' snapshots attached so the
/// operator sees exactly what each system believed at run time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    pub id: String,
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub entity_kind: EntityKind,
    /// Processor-side key (token / processor id) for the entity.
    pub entity_key: String,
    pub divergence_type: DivergenceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_snapshot: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_snapshot: Option<serde_json::Value>,
    pub noted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: RunId,
    pub tenant_id: TenantId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub checked_count: usize,
    pub divergences: Vec<Divergence>,
}

pub trait ReconciliationRunStore: Send + Sync {
    fn create_run(&self, run: ReconciliationRun) -> ReconcileResult<ReconciliationRun>;
    fn save_run(&self, run: &ReconciliationRun) -> ReconcileResult<()>;
    fn get_run(&self, run_id: &RunId) -> ReconcileResult<ReconciliationRun>;
    fn list_runs(&self, tenant: &TenantId) -> ReconcileResult<Vec<ReconciliationRun>>;
}

#[derive(Default)]
pub struct InMemoryReconciliationRunStore {
    runs: RwLock<Vec<ReconciliationRun>>,
}

impl InMemoryReconciliationRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReconciliationRunStore for InMemoryReconciliationRunStore {
    fn create_run(&self, run: ReconciliationRun) -> ReconcileResult<ReconciliationRun> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| ReconcileError::Storage("run store poisoned".into()))?;
        runs.push(run.clone());
        Ok(run)
    }

    fn save_run(&self, run: &ReconciliationRun) -> ReconcileResult<()> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| ReconcileError::Storage("run store poisoned".into()))?;
        match runs.iter_mut().find(|stored| stored.id == run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(ReconcileError::RunNotFound(run.id.clone())),
        }
    }

    fn get_run(&self, run_id: &RunId) -> ReconcileResult<ReconciliationRun> {
        let runs = self
            .runs
            .read()
            .map_err(|_| ReconcileError::Storage("run store poisoned".into()))?;
        runs.iter()
            .find(|run| &run.id == run_id)
            .cloned()
            .ok_or_else(|| ReconcileError::RunNotFound(run_id.clone()))
    }

    fn list_runs(&self, tenant: &TenantId) -> ReconcileResult<Vec<ReconciliationRun>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| ReconcileError::Storage("run store poisoned".into()))?;
        Ok(runs
            .iter()
            .filter(|run| &run.tenant_id == tenant)
            .cloned()
            .collect())
    }
}

/// A processor-side inventory (e.g. a settlement report) used to detect
/// entities the processor knows about but the engine does not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInventory {
    pub charge_ids: HashSet<String>,
    pub refund_ids: HashSet<String>,
    pub subscription_ids: HashSet<String>,
}

pub struct ReconciliationRunner {
    store: Arc<dyn ArStore>,
    processor: Arc<dyn ProcessorClient>,
    runs: Arc<dyn ReconciliationRunStore>,
}

fn snapshot<T: Serialize>(value: &T) -> Option<serde_json::Value> {
    serde_json::to_value(value).ok()
}

fn local_subscription_status(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Active => "active",
        SubscriptionStatus::PastDue => "past_due",
        SubscriptionStatus::Canceled => "canceled",
    }
}

impl ReconciliationRunner {
    pub fn new(
        store: Arc<dyn ArStore>,
        processor: Arc<dyn ProcessorClient>,
        runs: Arc<dyn ReconciliationRunStore>,
    ) -> Self {
        Self {
            store,
            processor,
            runs,
        }
    }

    /// One reconciliation pass for a tenant. Reads a consistent-enough
    /// local snapshot, fetches each processor counterpart, and records
    /// divergences on the run. Never writes AR state.
    pub async fn run_for_tenant(
        &self,
        tenant: &TenantId,
        remote_inventory: Option<&RemoteInventory>,
        budget: RunBudget,
    ) -> ReconcileResult<ReconciliationRun> {
        let started_at = Utc::now();
        let mut run = self.runs.create_run(ReconciliationRun {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            checked_count: 0,
            divergences: Vec::new(),
        })?;

        self.check_payment_methods(tenant, &mut run, &budget).await?;
        self.check_charges(tenant, &mut run, &budget).await?;
        self.check_refunds(tenant, &mut run, &budget).await?;
        self.check_subscriptions(tenant, &mut run, &budget).await?;
        if let Some(inventory) = remote_inventory {
            self.check_missing_local(tenant, inventory, &mut run).await?;
        }

        run.status = RunStatus::Completed;
        run.finished_at = Some(Utc::now());
        self.runs.save_run(&run)?;
        tracing::info!(
            tenant_id = %tenant,
            run_id = %run.id,
            checked = run.checked_count,
            divergences = run.divergences.len(),
            "reconciliation run completed"
        );
        Ok(run)
    }

    fn note(
        run: &mut ReconciliationRun,
        entity_kind: EntityKind,
        entity_key: &str,
        divergence_type: DivergenceType,
        local_snapshot: Option<serde_json::Value>,
        remote_snapshot: Option<serde_json::Value>,
    ) {
        run.divergences.push(Divergence {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            tenant_id: run.tenant_id.clone(),
            entity_kind,
            entity_key: entity_key.to_string(),
            divergence_type,
            local_snapshot,
            remote_snapshot,
            noted_at: Utc::now(),
        });
    }

    async fn check_payment_methods(
        &self,
        tenant: &TenantId,
        run: &mut ReconciliationRun,
        budget: &RunBudget,
    ) -> ReconcileResult<()> {
        let customers = self
            .store
            .list_customers(tenant, remit_ledger::CustomerFilter::default())
            .await?;
        for customer in customers {
            if budget.expired(Utc::now()) {
                return Ok(());
            }
            let methods = self.store.list_payment_methods(tenant, &customer.id).await?;
            for method in methods.iter().filter(|method| method.is_usable()) {
                run.checked_count += 1;
                match self.processor.get_payment_method(&method.processor_token).await {
                    Ok(remote) => {
                        let stale = remote.brand != method.details.brand
                            || remote.last4 != method.details.last4
                            || remote.method_type != method.details.method_type;
                        if stale {
                            Self::note(
                                run,
                                EntityKind::PaymentMethod,
                                &method.processor_token,
                                DivergenceType::StaleMetadata,
                                snapshot(&method.details),
                                snapshot(&remote),
                            );
                        }
                    }
                    Err(err) if !err.retriable => {
                        Self::note(
                            run,
                            EntityKind::PaymentMethod,
                            &method.processor_token,
                            DivergenceType::MissingRemote,
                            snapshot(method),
                            None,
                        );
                    }
                    Err(err) => {
                        return Err(ReconcileError::Snapshot(format!(
                            "payment method fetch failed: {err}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_charges(
        &self,
        tenant: &TenantId,
        run: &mut ReconciliationRun,
        budget: &RunBudget,
    ) -> ReconcileResult<()> {
        let charges = self.store.list_charges(tenant).await?;
        for charge in charges {
            if budget.expired(Utc::now()) {
                return Ok(());
            }
            let Some(processor_charge_id) = &charge.processor_charge_id else {
                continue;
            };
            run.checked_count += 1;
            match self.processor.get_charge(processor_charge_id).await {
                Ok(remote) => {
                    let local_status = match charge.status {
                        ChargeStatus::Succeeded => "succeeded",
                        ChargeStatus::Failed => "failed",
                        ChargeStatus::Pending => "pending",
                    };
                    if remote.status != local_status {
                        Self::note(
                            run,
                            EntityKind::Charge,
                            processor_charge_id,
                            DivergenceType::StatusMismatch,
                            snapshot(&charge),
                            snapshot(&remote),
                        );
                    } else if remote
                        .amount_cents
                        .is_some_and(|amount| amount != charge.amount_cents)
                    {
                        Self::note(
                            run,
                            EntityKind::Charge,
                            processor_charge_id,
                            DivergenceType::AmountMismatch,
                            snapshot(&charge),
                            snapshot(&remote),
                        );
                    }
                }
                Err(err) if !err.retriable => {
                    Self::note(
                        run,
                        EntityKind::Charge,
                        processor_charge_id,
                        DivergenceType::MissingRemote,
                        snapshot(&charge),
                        None,
                    );
                }
                Err(err) => {
                    return Err(ReconcileError::Snapshot(format!("charge fetch failed: {err}")));
                }
            }
        }
        Ok(())
    }

    async fn check_refunds(
        &self,
        tenant: &TenantId,
        run: &mut ReconciliationRun,
        budget: &RunBudget,
    ) -> ReconcileResult<()> {
        let refunds = self.store.list_refunds(tenant).await?;
        for refund in refunds {
            if budget.expired(Utc::now()) {
                return Ok(());
            }
            let Some(processor_refund_id) = &refund.processor_refund_id else {
                continue;
            };
            run.checked_count += 1;
            match self.processor.get_refund(processor_refund_id).await {
                Ok(remote) => {
                    let local_status = match refund.status {
                        RefundStatus::Succeeded => "succeeded",
                        RefundStatus::Failed => "failed",
                        RefundStatus::Pending => "pending",
                    };
                    if remote.status != local_status {
                        Self::note(
                            run,
                            EntityKind::Refund,
                            processor_refund_id,
                            DivergenceType::StatusMismatch,
                            snapshot(&refund),
                            snapshot(&remote),
                        );
                    } else if remote
                        .amount_cents
                        .is_some_and(|amount| amount != refund.amount_cents)
                    {
                        Self::note(
                            run,
                            EntityKind::Refund,
                            processor_refund_id,
                            DivergenceType::AmountMismatch,
                            snapshot(&refund),
                            snapshot(&remote),
                        );
                    }
                }
                Err(err) if !err.retriable => {
                    Self::note(
                        run,
                        EntityKind::Refund,
                        processor_refund_id,
                        DivergenceType::MissingRemote,
                        snapshot(&refund),
                        None,
                    );
                }
                Err(err) => {
                    return Err(ReconcileError::Snapshot(format!("refund fetch failed: {err}")));
                }
            }
        }
        Ok(())
    }

    async fn check_subscriptions(
        &self,
        tenant: &TenantId,
        run: &mut ReconciliationRun,
        budget: &RunBudget,
    ) -> ReconcileResult<()> {
        let subscriptions = self.store.list_subscriptions(tenant).await?;
        for subscription in subscriptions {
            if budget.expired(Utc::now()) {
                return Ok(());
            }
            run.checked_count += 1;
            match self
                .processor
                .get_subscription(&subscription.processor_subscription_id)
                .await
            {
                Ok(remote) => {
                    let local_status = local_subscription_status(subscription.status);
                    if remote.status != local_status {
                        // A locally-flagged end-of-period cancel that never
                        // reached the processor shows up here as stale
                        // metadata rather than a hard status conflict.
                        let divergence_type = if subscription.cancel_at_period_end
                            && remote.status == "active"
                        {
                            DivergenceType::StaleMetadata
                        } else {
                            DivergenceType::StatusMismatch
                        };
                        Self::note(
                            run,
                            EntityKind::Subscription,
                            &subscription.processor_subscription_id,
                            divergence_type,
                            snapshot(&subscription),
                            snapshot(&remote),
                        );
                    }
                }
                Err(err) if !err.retriable => {
                    Self::note(
                        run,
                        EntityKind::Subscription,
                        &subscription.processor_subscription_id,
                        DivergenceType::MissingRemote,
                        snapshot(&subscription),
                        None,
                    );
                }
                Err(err) => {
                    return Err(ReconcileError::Snapshot(format!(
                        "subscription fetch failed: {err}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Diffs a processor-provided inventory against local indexes: anything
    /// the processor reports that the engine has no row for is recorded as
    /// MissingLocal.
    async fn check_missing_local(
        &self,
        tenant: &TenantId,
        inventory: &RemoteInventory,
        run: &mut ReconciliationRun,
    ) -> ReconcileResult<()> {
        for charge_id in &inventory.charge_ids {
            if self
                .store
                .charge_by_processor_id(tenant, charge_id)
                .await
                .is_err()
            {
                Self::note(
                    run,
                    EntityKind::Charge,
                    charge_id,
                    DivergenceType::MissingLocal,
                    None,
                    Some(serde_json::json!({"processor_charge_id": charge_id})),
                );
            }
        }
        for refund_id in &inventory.refund_ids {
            if self
                .store
                .refund_by_processor_id(tenant, refund_id)
                .await
                .is_err()
            {
                Self::note(
                    run,
                    EntityKind::Refund,
                    refund_id,
                    DivergenceType::MissingLocal,
                    None,
                    Some(serde_json::json!({"processor_refund_id": refund_id})),
                );
            }
        }
        for subscription_id in &inventory.subscription_ids {
            if self
                .store
                .subscription_by_processor_id(tenant, subscription_id)
                .await
                .is_err()
            {
                Self::note(
                    run,
                    EntityKind::Subscription,
                    subscription_id,
                    DivergenceType::MissingLocal,
                    None,
                    Some(serde_json::json!({"processor_subscription_id": subscription_id})),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use remit_ledger::AgingBuckets;
    use remit_ledger::Charge;
    use remit_ledger::Customer;
    use remit_ledger::DelinquencyState;
    use remit_ledger::InMemoryArStore;
    use remit_ledger::Upsert;
    use remit_processor::CreateChargeRequest;
    use remit_processor::CreateCustomerRequest;
    use remit_processor::SandboxProcessor;

    fn customer(tenant: &str, id: &str, external_id: &str) -> Customer {
        Customer {
            id: id.into(),
            tenant_id: tenant.into(),
            external_id: external_id.into(),
            email: format!("{external_id}@example.com"),
            display_name: external_id.into(),
            processor_customer_id: None,
            default_payment_method_id: None,
            ar_balance_cents: 0,
            aging: AgingBuckets::default(),
            delinquency: DelinquencyState::None,
            payment_retry_count: 0,
            next_retry_at: None,
            grace_period_end: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn runner(
        store: Arc<InMemoryArStore>,
        processor: Arc<SandboxProcessor>,
    ) -> (ReconciliationRunner, Arc<InMemoryReconciliationRunStore>) {
        let runs = Arc::new(InMemoryReconciliationRunStore::new());
        (
            ReconciliationRunner::new(store, processor, runs.clone()),
            runs,
        )
    }

    async fn settled_charge(
        store: &InMemoryArStore,
        processor: &SandboxProcessor,
        tenant: &str,
        customer_id: &str,
        amount: i64,
    ) -> Charge {
        let processor_customer = processor
            .create_customer(CreateCustomerRequest {
                external_id: customer_id.into(),
                email: "x@example.com".into(),
                display_name: "X".into(),
            })
            .await
            .expect("processor customer");
        let remote = processor
            .create_charge(CreateChargeRequest {
                processor_customer_id: processor_customer.id,
                payment_method_token: "pm_test_1".into(),
                amount_cents: amount,
                currency: "USD".into(),
                reference_id: "r-1".into(),
            })
            .await
            .expect("remote charge");

        let inserted = store
            .insert_charge(Charge {
                id: "ch-1".into(),
                tenant_id: tenant.into(),
                customer_id: customer_id.into(),
                reference_id: "r-1".into(),
                payment_method_id: None,
                amount_cents: amount,
                currency: "USD".into(),
                status: remit_ledger::ChargeStatus::Succeeded,
                processor_charge_id: Some(remote.id),
                failure_code: None,
                failure_message: None,
                created_at: Utc::now(),
                settled_at: Some(Utc::now()),
            })
            .await
            .expect("insert charge");
        match inserted {
            Upsert::Created(charge) => charge,
            Upsert::Existing(charge) => charge,
        }
    }

    #[tokio::test]
    async fn clean_state_yields_no_divergences() {
        let store = Arc::new(InMemoryArStore::new());
        let processor = Arc::new(SandboxProcessor::new());
        store
            .insert_customer(customer("acme", "cust-1", "cu_001"))
            .await
            .expect("insert");
        settled_charge(&store, &processor, "acme", "cust-1", 2_000).await;

        let (runner, runs) = runner(store, processor);
        let run = runner
            .run_for_tenant(&"acme".to_string(), None, RunBudget::unbounded())
            .await
            .expect("run");
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.divergences.is_empty());
        assert_eq!(run.checked_count, 1);

        let listed = runs.list_runs(&"acme".to_string()).expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn status_drift_is_recorded_with_both_snapshots() {
        let store = Arc::new(InMemoryArStore::new());
        let processor = Arc::new(SandboxProcessor::new());
        store
            .insert_customer(customer("acme", "cust-1", "cu_001"))
            .await
            .expect("insert");
        let charge = settled_charge(&store, &processor, "acme", "cust-1", 2_000).await;

        // Flip the local status so the two systems disagree.
        let mut drifted = charge;
        drifted.status = remit_ledger::ChargeStatus::Failed;
        store.update_charge(drifted).await.expect("update");

        let (runner, _) = runner(store, processor);
        let run = runner
            .run_for_tenant(&"acme".to_string(), None, RunBudget::unbounded())
            .await
            .expect("run");
        assert_eq!(run.divergences.len(), 1);
        let divergence = &run.divergences[0];
        assert_eq!(divergence.divergence_type, DivergenceType::StatusMismatch);
        assert_eq!(divergence.entity_kind, EntityKind::Charge);
        assert!(divergence.local_snapshot.is_some());
        assert!(divergence.remote_snapshot.is_some());
    }

    #[tokio::test]
    async fn unknown_remote_charge_is_missing_remote() {
        let store = Arc::new(InMemoryArStore::new());
        let processor = Arc::new(SandboxProcessor::new());
        store
            .insert_customer(customer("acme", "cust-1", "cu_001"))
            .await
            .expect("insert");
        store
            .insert_charge(Charge {
                id: "ch-1".into(),
                tenant_id: "acme".into(),
                customer_id: "cust-1".into(),
                reference_id: "r-1".into(),
                payment_method_id: None,
                amount_cents: 2_000,
                currency: "USD".into(),
                status: remit_ledger::ChargeStatus::Succeeded,
                processor_charge_id: Some("sbx_ch_never_existed".into()),
                failure_code: None,
                failure_message: None,
                created_at: Utc::now(),
                settled_at: Some(Utc::now()),
            })
            .await
            .expect("insert");

        let (runner, _) = runner(store, processor);
        let run = runner
            .run_for_tenant(&"acme".to_string(), None, RunBudget::unbounded())
            .await
            .expect("run");
        assert_eq!(run.divergences.len(), 1);
        assert_eq!(
            run.divergences[0].divergence_type,
            DivergenceType::MissingRemote
        );
    }

    #[tokio::test]
    async fn remote_inventory_detects_missing_local() {
        let store = Arc::new(InMemoryArStore::new());
        let processor = Arc::new(SandboxProcessor::new());
        store
            .insert_customer(customer("acme", "cust-1", "cu_001"))
            .await
            .expect("insert");

        let mut inventory = RemoteInventory::default();
        inventory.charge_ids.insert("sbx_ch_orphan".into());

        let (runner, _) = runner(store, processor);
        let run = runner
            .run_for_tenant(&"acme".to_string(), Some(&inventory), RunBudget::unbounded())
            .await
            .expect("run");
        assert_eq!(run.divergences.len(), 1);
        assert_eq!(
            run.divergences[0].divergence_type,
            DivergenceType::MissingLocal
        );
        assert!(run.divergences[0].local_snapshot.is_none());
    }

    #[tokio::test]
    async fn runs_never_mutate_ar_state() {
        let store = Arc::new(InMemoryArStore::new());
        let processor = Arc::new(SandboxProcessor::new());
        store
            .insert_customer(customer("acme", "cust-1", "cu_001"))
            .await
            .expect("insert");
        let charge = settled_charge(&store, &processor, "acme", "cust-1", 2_000).await;
        let mut drifted = charge.clone();
        drifted.status = remit_ledger::ChargeStatus::Failed;
        store.update_charge(drifted.clone()).await.expect("update");

        let (runner, _) = runner(store.clone(), processor);
        runner
            .run_for_tenant(&"acme".to_string(), None, RunBudget::unbounded())
            .await
            .expect("run");

        let after = store
            .charge(&"acme".to_string(), &charge.id)
            .await
            .expect("charge");
        assert_eq!(after, drifted, "reconciliation must not touch the charge");
    }
}
