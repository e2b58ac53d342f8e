use crate::error::mentions_already_attached;
use crate::{CloudProvider, Instance, InstanceSpec, ProviderError, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.vultr.com/v2";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const PAGE_SIZE: &str = "100";
const MAX_ERROR_BODY_BYTES: usize = 4096;

pub struct VultrProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct VultrInstance {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    main_ip: String,
    #[serde(default)]
    label: String,
}

impl From<VultrInstance> for Instance {
    fn from(v: VultrInstance) -> Self {
        // Vultr reports 0.0.0.0 until an address is assigned.
        let ip = v.main_ip.trim();
        let main_ip = (!ip.is_empty() && ip != "0.0.0.0").then(|| ip.to_string());
        Instance {
            id: v.id,
            label: v.label,
            status: v.status,
            main_ip,
        }
    }
}

#[derive(Deserialize)]
struct ListInstancesResponse {
    #[serde(default)]
    instances: Vec<VultrInstance>,
    #[serde(default)]
    meta: Meta,
}

#[derive(Deserialize, Default)]
struct Meta {
    #[serde(default)]
    links: Links,
}

#[derive(Deserialize, Default)]
struct Links {
    #[serde(default)]
    next: String,
}

#[derive(Deserialize)]
struct CreateInstanceResponse {
    instance: CreatedInstance,
}

#[derive(Deserialize)]
struct CreatedInstance {
    #[serde(default)]
    id: String,
}

#[derive(Deserialize)]
struct AccountResponse {
    account: Account,
}

#[derive(Deserialize)]
struct Account {
    #[serde(default)]
    pending_charges: f64,
}

impl VultrProvider {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self> {
        // Default reqwest client has no overall timeout; a stalled upstream would hang a reconciler.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(ProviderError::Client)?;
        Ok(Self {
            client,
            api_key: api_key.trim().to_string(),
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(%method, %url, "vultr request");

        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .header(header::ACCEPT, "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|source| ProviderError::Http {
            path: path.to_string(),
            source,
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = read_error_body(resp).await;
            tracing::debug!(%url, %status, body = %body, "vultr request failed");
            return Err(ProviderError::Status {
                path: path.to_string(),
                status,
                body,
            });
        }

        let bytes = resp.bytes().await.map_err(|source| ProviderError::Http {
            path: path.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let bytes = self.send(Method::GET, path, query, None).await?;
        decode(path, &bytes)
    }

    /// Pulls the `cursor` query parameter out of a `meta.links.next` link.
    fn extract_cursor(&self, next_link: &str) -> Result<Option<String>> {
        let next_link = next_link.trim();
        if next_link.is_empty() {
            return Ok(None);
        }

        let pagination_err = |message: String| ProviderError::Pagination {
            link: next_link.to_string(),
            message,
        };
        let base = Url::parse(&format!("{}/", self.base_url)).map_err(|e| pagination_err(e.to_string()))?;
        let parsed = base.join(next_link).map_err(|e| pagination_err(e.to_string()))?;

        Ok(parsed
            .query_pairs()
            .find(|(k, _)| k == "cursor")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty()))
    }
}

/// Reads at most `MAX_ERROR_BODY_BYTES` of a failed response for diagnostics.
async fn read_error_body(mut resp: reqwest::Response) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < MAX_ERROR_BODY_BYTES {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(MAX_ERROR_BODY_BYTES - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

fn decode<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|source| ProviderError::Decode {
        path: path.to_string(),
        source,
    })
}

fn require_id(value: &str, what: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ProviderError::EmptyIdentifier(what));
    }
    Ok(())
}

#[async_trait]
impl CloudProvider for VultrProvider {
    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut instances = Vec::with_capacity(16);
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let mut query = vec![("per_page", PAGE_SIZE)];
            if let Some(c) = cursor.as_deref() {
                query.push(("cursor", c));
            }

            let page: ListInstancesResponse = self.get_json("/instances", &query).await?;
            instances.extend(page.instances.into_iter().map(Instance::from));

            match self.extract_cursor(&page.meta.links.next)? {
                Some(next) if !seen.insert(next.clone()) => {
                    return Err(ProviderError::Pagination {
                        link: page.meta.links.next,
                        message: format!("cursor {next:?} repeated"),
                    });
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(instances)
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        let mut body = json!({
            "region": spec.region,
            "plan": spec.plan,
            "os_id": spec.os_id,
            "label": spec.label,
        });
        if !spec.ssh_key_ids.is_empty() {
            body["sshkey_id"] = json!(spec.ssh_key_ids);
        }
        if !spec.user_scheme.is_empty() {
            body["user_scheme"] = json!(spec.user_scheme);
        }
        if !spec.user_data.is_empty() {
            body["user_data"] = json!(spec.user_data);
        }

        let path = "/instances";
        let bytes = self.send(Method::POST, path, &[], Some(&body)).await?;
        let created: CreateInstanceResponse = decode(path, &bytes)?;

        let instance_id = created.instance.id.trim().to_string();
        if instance_id.is_empty() {
            return Err(ProviderError::MissingInstanceId);
        }
        Ok(instance_id)
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        require_id(instance_id, "instance id")?;
        let path = format!("/instances/{}", urlencoding::encode(instance_id));
        self.send(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }

    async fn attach_block_storage(
        &self,
        block_storage_id: &str,
        instance_id: &str,
        live: bool,
    ) -> Result<()> {
        require_id(block_storage_id, "block storage id")?;
        require_id(instance_id, "instance id")?;

        let path = format!("/blocks/{}/attach", urlencoding::encode(block_storage_id));
        let body = json!({ "instance_id": instance_id, "live": live });

        match self.send(Method::POST, &path, &[], Some(&body)).await {
            Ok(_) => Ok(()),
            Err(ProviderError::Status { body, .. }) if mentions_already_attached(&body) => {
                Err(ProviderError::AlreadyAttached(body))
            }
            Err(e) => Err(e),
        }
    }

    async fn pending_charges(&self) -> Result<f64> {
        let account: AccountResponse = self.get_json("/account", &[]).await?;
        Ok(account.account.pending_charges)
    }
}
