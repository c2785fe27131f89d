// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP implementation of [`VirtClient`]
//!
//! Speaks the control plane's REST dialect: node-scoped paths,
//! form-encoded writes, and a `{"data": ...}` envelope on every
//! response.  A write's `data` is either `null` (applied synchronously)
//! or an opaque task identifier string.

use crate::types::CloneParams;
use crate::types::ConfigPatch;
use crate::types::RemoteTaskState;
use crate::types::RemoteTaskStatus;
use crate::types::TaskHandle;
use crate::types::VmConfig;
use crate::types::VmId;
use crate::types::WriteOutcome;
use crate::VirtClient;
use anvil_common::Error;
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::time::Duration;

/// Connection settings for the virtualization control plane
///
/// Injected into [`HttpVirtClient`] at construction; token material
/// lives here and nowhere else.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the control plane API, e.g.
    /// `https://virt.example.com:8006/api2/json`.
    pub base_url: String,
    /// API token identifier.
    pub token_id: String,
    /// API token secret.
    pub token_secret: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Accept self-signed certificates.  Common for lab clusters.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ClientConfig {
    /// Parse a config from TOML text.
    pub fn from_toml(text: &str) -> Result<ClientConfig, Error> {
        toml::from_str(text).map_err(|e| {
            Error::invalid_request(&format!("parsing client config: {}", e))
        })
    }
}

/// Response envelope used by every control plane endpoint.
#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

/// Wire shape of a task status read.
#[derive(Debug, Deserialize)]
struct WireTaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

/// Config slots checked, in order, for the primary disk.
const PRIMARY_DISK_SLOTS: [&str; 4] = ["scsi0", "virtio0", "sata0", "ide0"];

/// Extract the orchestrator's view of a VM config from the backend's
/// loosely-typed config object
///
/// Fields the backend fails to report come back as zero or `None`, never
/// as an invented figure: callers use these values for quota reclaim,
/// and crediting resources that were never read would corrupt the
/// ledger.
fn vm_config_from_json(raw: &serde_json::Value) -> VmConfig {
    let cores = raw.get("cores").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let memory_mib = match raw.get("memory") {
        // Older backend versions report memory as a string.
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        Some(v) => v.as_u64().unwrap_or(0),
        None => 0,
    };
    let slot = PRIMARY_DISK_SLOTS
        .iter()
        .find(|slot| raw.get(**slot).is_some())
        .copied();
    let primary_disk = slot
        .and_then(|slot| raw.get(slot))
        .and_then(|v| v.as_str())
        .map(str::to_owned);

    VmConfig {
        cores,
        memory_mib,
        primary_disk_slot: slot.map(str::to_owned),
        primary_disk,
    }
}

pub struct HttpVirtClient {
    config: ClientConfig,
    client: reqwest::Client,
    log: Logger,
}

impl HttpVirtClient {
    pub fn new(config: ClientConfig, log: &Logger) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| {
                Error::internal_error(&format!(
                    "building http client: {}",
                    e
                ))
            })?;
        let log = log.new(o!(
            "component" => "HttpVirtClient",
            "base_url" => config.base_url.clone(),
        ));
        Ok(HttpVirtClient { config, client, log })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn auth_value(&self) -> String {
        format!(
            "ApiToken {}={}",
            self.config.token_id, self.config.token_secret
        )
    }

    /// Issue a write and fold every failure mode into the outcome.
    async fn write<F: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        form: Option<&F>,
    ) -> WriteOutcome {
        debug!(self.log, "backend write"; "method" => %method, "path" => path);
        let mut request = self
            .client
            .request(method.clone(), self.url(path))
            .header("Authorization", self.auth_value());
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(self.log, "backend write transport error";
                    "path" => path, "error" => %e);
                return WriteOutcome::Failed(format!(
                    "transport error on {} {}: {}",
                    method, path, e
                ));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return WriteOutcome::Failed(format!(
                "{} {} returned {}: {}",
                method,
                path,
                status,
                body.trim()
            ));
        }

        match response.json::<DataEnvelope<Option<String>>>().await {
            Ok(DataEnvelope { data: Some(handle) }) if !handle.is_empty() => {
                WriteOutcome::Submitted(TaskHandle::new(handle))
            }
            Ok(_) => WriteOutcome::Applied,
            Err(e) => WriteOutcome::Failed(format!(
                "unparseable response from {} {}: {}",
                method, path, e
            )),
        }
    }

    async fn read<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        debug!(self.log, "backend read"; "path" => path);
        let response = self
            .client
            .get(self.url(path))
            .header("Authorization", self.auth_value())
            .send()
            .await
            .map_err(|e| {
                Error::backend_operation(&format!(
                    "transport error on GET {}: {}",
                    path, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::backend_operation(&format!(
                "GET {} returned {}: {}",
                path,
                status,
                body.trim()
            )));
        }

        let envelope: DataEnvelope<T> =
            response.json().await.map_err(|e| {
                Error::backend_operation(&format!(
                    "unparseable response from GET {}: {}",
                    path, e
                ))
            })?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl VirtClient for HttpVirtClient {
    async fn next_vm_id(&self) -> Result<VmId, Error> {
        // The backend hands out the id as a JSON string.
        let id: String = self.read("cluster/nextid").await?;
        let id = id.parse::<u32>().map_err(|_| {
            Error::backend_operation(&format!(
                "backend returned non-numeric vm id: {:?}",
                id
            ))
        })?;
        Ok(VmId(id))
    }

    async fn clone_vm(&self, params: &CloneParams) -> WriteOutcome {
        let path = format!(
            "nodes/{}/vms/{}/clone",
            params.source_node, params.source_vm
        );
        let mut form: Vec<(&str, String)> = vec![
            ("newid", params.new_vm.to_string()),
            ("name", params.name.clone()),
            ("target", params.target_node.clone()),
            ("full", if params.full { "1" } else { "0" }.to_string()),
        ];
        if let Some(storage) = &params.storage {
            form.push(("storage", storage.clone()));
        }
        self.write(Method::POST, &path, Some(&form)).await
    }

    async fn update_config(
        &self,
        node: &str,
        vm: VmId,
        patch: &ConfigPatch,
    ) -> WriteOutcome {
        let path = format!("nodes/{}/vms/{}/config", node, vm);
        self.write(Method::PUT, &path, Some(patch)).await
    }

    async fn resize_disk(
        &self,
        node: &str,
        vm: VmId,
        slot: &str,
        grow_gib: u64,
    ) -> WriteOutcome {
        let path = format!("nodes/{}/vms/{}/resize", node, vm);
        let form = [
            ("disk", slot.to_string()),
            ("size", format!("+{}G", grow_gib)),
        ];
        self.write(Method::PUT, &path, Some(&form)).await
    }

    async fn convert_to_template(&self, node: &str, vm: VmId) -> WriteOutcome {
        let path = format!("nodes/{}/vms/{}/template", node, vm);
        self.write::<[(&str, String); 0]>(Method::POST, &path, None).await
    }

    async fn delete_vm(&self, node: &str, vm: VmId) -> WriteOutcome {
        let path = format!("nodes/{}/vms/{}", node, vm);
        self.write::<[(&str, String); 0]>(Method::DELETE, &path, None).await
    }

    async fn vm_config(&self, node: &str, vm: VmId) -> Result<VmConfig, Error> {
        let path = format!("nodes/{}/vms/{}/config", node, vm);
        let raw: serde_json::Value = self.read(&path).await?;
        Ok(vm_config_from_json(&raw))
    }

    async fn task_status(
        &self,
        node: &str,
        handle: &TaskHandle,
    ) -> Result<RemoteTaskStatus, Error> {
        let path =
            format!("nodes/{}/tasks/{}/status", node, handle.as_str());
        let wire: WireTaskStatus = self.read(&path).await?;
        let state = match wire.status.as_str() {
            "running" => RemoteTaskState::Running,
            "stopped" => RemoteTaskState::Stopped,
            other => {
                return Err(Error::backend_operation(&format!(
                    "unknown task state {:?} for {}",
                    other,
                    handle.as_str()
                )))
            }
        };
        Ok(RemoteTaskStatus { state, exit_status: wire.exitstatus })
    }
}
