use serde::{Deserialize, Serialize};

/// Label prefix marking instances this daemon manages.
///
/// This is a naming convention, not ownership: an unrelated instance whose
/// label happens to start with the prefix is treated as managed.
pub const LABEL_PREFIX: &str = "paropal-";

// --- Entities ---

/// Read-only snapshot of a compute instance as reported by the provider.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub label: String,
    pub status: String, // provider-defined free text
    pub main_ip: Option<String>,
}

impl Instance {
    pub fn has_address(&self) -> bool {
        self.main_ip.as_deref().is_some_and(|ip| !ip.is_empty())
    }

    pub fn is_terminating(&self) -> bool {
        is_terminating_status(&self.status)
    }
}

/// Everything needed to create one instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub region: String,
    pub plan: String,
    pub os_id: u32,
    pub label: String,
    pub ssh_key_ids: Vec<String>,
    pub user_scheme: String,
    /// Base64-encoded user data, opaque to the provider client.
    pub user_data: String,
}

// --- Conventions ---

pub fn has_label_prefix(instance: &Instance, prefix: &str) -> bool {
    instance.label.starts_with(prefix)
}

/// Heuristic match against the provider's free-form status text.
pub fn is_terminating_status(status: &str) -> bool {
    let s = status.trim().to_lowercase();
    if s.is_empty() {
        return false;
    }
    ["destroy", "delete", "terminate", "remov"]
        .iter()
        .any(|needle| s.contains(needle))
}

/// Picks the managed instance to act on among everything carrying `prefix`.
///
/// Instances with an address win over those without; ties go to the
/// lexicographically greatest label, which is the newest one since labels end
/// in a timestamp.
pub fn select_labeled_instance<I>(instances: I, prefix: &str) -> Option<Instance>
where
    I: IntoIterator<Item = Instance>,
{
    let mut best: Option<Instance> = None;
    for instance in instances {
        if !has_label_prefix(&instance, prefix) {
            continue;
        }
        let Some(current) = &best else {
            best = Some(instance);
            continue;
        };

        match (current.has_address(), instance.has_address()) {
            (false, true) => best = Some(instance),
            (true, false) => {}
            _ => {
                if instance.label > current.label {
                    best = Some(instance);
                }
            }
        }
    }
    best
}
