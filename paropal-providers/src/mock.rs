use crate::{CloudProvider, Instance, InstanceSpec, ProviderError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

/// In-memory provider for tests and local runs.
///
/// Failures are injected per call kind and consumed in order. `list_lag`
/// hides freshly created instances from listings, mimicking an inventory
/// endpoint that trails behind create calls.
pub struct MockProvider {
    state: Mutex<MockState>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub list: usize,
    pub create: usize,
    pub delete: usize,
    pub attach: usize,
    pub charges: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachFailure {
    Upstream,
    AlreadyAttached,
}

#[derive(Default)]
struct MockState {
    instances: BTreeMap<String, Instance>,
    hidden: Vec<String>,
    attachments: HashMap<String, String>,
    calls: MockCalls,
    next_id: u64,
    pending_charges: f64,
    list_lag: bool,
    list_failures: usize,
    delete_failures: usize,
    create_failures: usize,
    charges_failures: usize,
    attach_failures: VecDeque<AttachFailure>,
    deleted_at: Vec<Instant>,
}

fn upstream_error(path: &str) -> ProviderError {
    ProviderError::Status {
        path: path.to_string(),
        status: StatusCode::BAD_GATEWAY,
        body: "mock upstream failure".to_string(),
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_instances(instances: Vec<Instance>) -> Self {
        let provider = Self::new();
        {
            let mut st = provider.lock();
            for instance in instances {
                st.instances.insert(instance.id.clone(), instance);
            }
        }
        provider
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_pending_charges(&self, amount: f64) {
        self.lock().pending_charges = amount;
    }

    pub fn set_list_lag(&self, lag: bool) {
        self.lock().list_lag = lag;
    }

    pub fn fail_next_lists(&self, n: usize) {
        self.lock().list_failures = n;
    }

    pub fn fail_next_deletes(&self, n: usize) {
        self.lock().delete_failures = n;
    }

    pub fn fail_next_creates(&self, n: usize) {
        self.lock().create_failures = n;
    }

    pub fn fail_next_charges(&self, n: usize) {
        self.lock().charges_failures = n;
    }

    pub fn push_attach_failure(&self, failure: AttachFailure) {
        self.lock().attach_failures.push_back(failure);
    }

    /// Marks a volume as attached without going through `attach_block_storage`.
    pub fn preattach(&self, block_storage_id: &str, instance_id: &str) {
        self.lock()
            .attachments
            .insert(block_storage_id.to_string(), instance_id.to_string());
    }

    pub fn calls(&self) -> MockCalls {
        self.lock().calls
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.lock().instances.values().cloned().collect()
    }

    /// When each successful delete happened, in call order.
    pub fn delete_times(&self) -> Vec<Instant> {
        self.lock().deleted_at.clone()
    }

    pub fn attached_to(&self, block_storage_id: &str) -> Option<String> {
        self.lock().attachments.get(block_storage_id).cloned()
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut st = self.lock();
        st.calls.list += 1;
        if st.list_failures > 0 {
            st.list_failures -= 1;
            return Err(upstream_error("/instances"));
        }
        let visible = st
            .instances
            .values()
            .filter(|i| !(st.list_lag && st.hidden.contains(&i.id)))
            .cloned()
            .collect();
        Ok(visible)
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        let mut st = self.lock();
        st.calls.create += 1;
        if st.create_failures > 0 {
            st.create_failures -= 1;
            return Err(upstream_error("/instances"));
        }
        st.next_id += 1;
        let id = format!("mock-{}", st.next_id);
        st.instances.insert(
            id.clone(),
            Instance {
                id: id.clone(),
                label: spec.label.clone(),
                status: "pending".to_string(),
                main_ip: None,
            },
        );
        st.hidden.push(id.clone());
        Ok(id)
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        if instance_id.trim().is_empty() {
            return Err(ProviderError::EmptyIdentifier("instance id"));
        }
        let mut st = self.lock();
        st.calls.delete += 1;
        if st.delete_failures > 0 {
            st.delete_failures -= 1;
            return Err(upstream_error("/instances/{id}"));
        }
        st.instances.remove(instance_id);
        st.deleted_at.push(Instant::now());
        st.attachments.retain(|_, attached| attached.as_str() != instance_id);
        Ok(())
    }

    async fn attach_block_storage(
        &self,
        block_storage_id: &str,
        instance_id: &str,
        _live: bool,
    ) -> Result<()> {
        if block_storage_id.trim().is_empty() {
            return Err(ProviderError::EmptyIdentifier("block storage id"));
        }
        if instance_id.trim().is_empty() {
            return Err(ProviderError::EmptyIdentifier("instance id"));
        }
        let mut st = self.lock();
        st.calls.attach += 1;
        match st.attach_failures.pop_front() {
            Some(AttachFailure::Upstream) => return Err(upstream_error("/blocks/{id}/attach")),
            Some(AttachFailure::AlreadyAttached) => {
                return Err(ProviderError::AlreadyAttached(
                    "Block storage is already attached".to_string(),
                ))
            }
            None => {}
        }
        if st.attachments.contains_key(block_storage_id) {
            return Err(ProviderError::AlreadyAttached(
                "Block storage is already attached".to_string(),
            ));
        }
        st.attachments
            .insert(block_storage_id.to_string(), instance_id.to_string());
        Ok(())
    }

    async fn pending_charges(&self) -> Result<f64> {
        let mut st = self.lock();
        st.calls.charges += 1;
        if st.charges_failures > 0 {
            st.charges_failures -= 1;
            return Err(upstream_error("/account"));
        }
        Ok(st.pending_charges)
    }
}
