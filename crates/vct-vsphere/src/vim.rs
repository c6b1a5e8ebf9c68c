//! vSphere VI/JSON HTTP client with session-based authentication.
//!
//! Talks to vCenter / ESXi via `https://{host}:{port}/sdk/vim25/{release}/...`:
//! property reads are `GET {Type}/{moId}/{property}` and method calls are
//! `POST {Type}/{moId}/{Method}` with a JSON body. The session id returned by
//! `SessionManager.Login` travels in the `vmware-api-session-id` header.

use crate::config::VmConfigSpec;
use crate::error::{VctError, VctErrorKind, VctResult};
use crate::remote::{InventoryBrowser, RemoteSession};
use crate::types::{
    ContainerView, DatastoreSummary, InventoryNode, LiveDevice, ManagedObjectRef, NodeDetail,
    ObjectKind, ParentLink, PowerAction, Question, QuestionChoice, TaskRef, TaskSnapshot, TaskState,
    VimConfig, VimConfigSafe,
};

use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const SESSION_HEADER: &str = "vmware-api-session-id";

/// Folder levels fetched below a datacenter's VM root.
const VM_FOLDER_DEPTH: usize = 2;

// ─── Wire types ──────────────────────────────────────────────────────────────

/// `ServiceInstance.content`, trimmed to what the client uses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContent {
    pub root_folder: ManagedObjectRef,
    #[serde(default)]
    pub view_manager: Option<ManagedObjectRef>,
    #[serde(default)]
    pub session_manager: Option<ManagedObjectRef>,
    #[serde(default)]
    pub about: Option<AboutInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutInfo {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub api_version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    user_name: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct CreateContainerViewRequest<'a> {
    container: &'a ManagedObjectRef,
    #[serde(rename = "type")]
    types: Vec<&'static str>,
    recursive: bool,
}

#[derive(Serialize)]
struct CreateVmRequest<'a> {
    config: &'a VmConfigSpec,
    pool: &'a ManagedObjectRef,
}

#[derive(Serialize)]
struct ReconfigRequest<'a> {
    spec: &'a VmConfigSpec,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnswerRequest<'a> {
    question_id: &'a str,
    answer_choice: String,
}

#[derive(Serialize)]
struct NoArgs {}

#[derive(Debug, Deserialize)]
struct TaskInfoWire {
    state: TaskState,
    #[serde(default)]
    progress: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<MethodFaultWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MethodFaultWire {
    #[serde(default)]
    localized_message: Option<String>,
    #[serde(default)]
    fault: Option<serde_json::Value>,
}

impl TaskInfoWire {
    fn into_snapshot(self) -> TaskSnapshot {
        let error_message = self.error.map(|e| {
            e.localized_message
                .filter(|m| !m.is_empty())
                .or_else(|| {
                    e.fault
                        .as_ref()
                        .and_then(|f| f.get("_typeName"))
                        .and_then(|t| t.as_str())
                        .map(str::to_owned)
                })
                .unwrap_or_else(|| "unknown fault".to_string())
        });
        TaskSnapshot {
            state: self.state,
            progress: self.progress,
            error_message,
            pending_question: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuntimeWire {
    #[serde(default)]
    question: Option<QuestionWire>,
}

#[derive(Debug, Deserialize)]
struct QuestionWire {
    id: String,
    #[serde(default)]
    text: String,
    choice: ChoiceWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChoiceWire {
    #[serde(default)]
    choice_info: Vec<ElementDescriptionWire>,
    #[serde(default)]
    default_index: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ElementDescriptionWire {
    key: String,
    #[serde(default)]
    label: String,
}

impl QuestionWire {
    /// Choice keys arrive as strings; they are numeric in practice.
    fn into_question(self) -> VctResult<Question> {
        let choices = self
            .choice
            .choice_info
            .into_iter()
            .map(|c| {
                let key = c.key.trim().parse::<i32>().map_err(|_| {
                    VctError::parse(format!("Question '{}' has non-numeric choice key '{}'", self.id, c.key))
                })?;
                Ok(QuestionChoice { key, label: c.label })
            })
            .collect::<VctResult<Vec<_>>>()?;
        let default_key = self
            .choice
            .default_index
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| choices.get(i))
            .map(|c| c.key);
        Ok(Question { id: self.id, text: self.text, choices, default_key })
    }
}

#[derive(Debug, Deserialize)]
struct VmConfigInfoWire {
    hardware: HardwareWire,
}

#[derive(Debug, Deserialize)]
struct HardwareWire {
    #[serde(default)]
    device: Vec<DeviceWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceWire {
    #[serde(rename = "_typeName")]
    type_name: String,
    key: i32,
    #[serde(default)]
    controller_key: Option<i32>,
    #[serde(default)]
    unit_number: Option<i32>,
}

impl From<DeviceWire> for LiveDevice {
    fn from(d: DeviceWire) -> Self {
        LiveDevice {
            key: d.key,
            type_name: d.type_name,
            controller_key: d.controller_key,
            unit_number: d.unit_number,
        }
    }
}

// ─── URL helpers ─────────────────────────────────────────────────────────────

/// `https://{host}:{port}/sdk/vim25/{release}`
pub fn api_base(config: &VimConfig) -> VctResult<Url> {
    let url = Url::parse(&format!(
        "https://{}:{}/sdk/vim25/{}",
        config.host, config.port, config.api_release
    ))?;
    Ok(url)
}

/// `{base}/{kind}/{id}/{member}` with each segment percent-encoded.
pub fn endpoint_url(base: &Url, kind: &str, id: &str, member: &str) -> VctResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| VctError::connection(format!("Endpoint URL cannot carry a path: {base}")))?
        .pop_if_empty()
        .extend([kind, id, member]);
    Ok(url)
}

/// Fault type and message from a VI/JSON error body, if it is one.
fn parse_fault(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return (None, None);
    };
    let kind = value.get("_typeName").and_then(|v| v.as_str()).map(str::to_owned);
    let message = ["faultstring", "localizedMessage", "message"]
        .iter()
        .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .map(str::to_owned);
    (kind, message)
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// vSphere VI/JSON API client.
pub struct VimClient {
    client: Client,
    base_url: Url,
    session_id: Option<String>,
    content: Option<ServiceContent>,
    config: VimConfig,
}

impl VimClient {
    /// Build a new client from config (does NOT create a session yet).
    pub fn new(config: &VimConfig) -> VctResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .cookie_store(true)
            .build()
            .map_err(|e| VctError::connection(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: api_base(config)?,
            session_id: None,
            content: None,
            config: config.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Whether we have an active session.
    pub fn is_connected(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn config(&self) -> &VimConfig {
        &self.config
    }

    pub fn config_safe(&self) -> VimConfigSafe {
        VimConfigSafe {
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            insecure: self.config.insecure,
        }
    }

    /// Product name and API version reported at login.
    pub fn about(&self) -> Option<&AboutInfo> {
        self.content.as_ref().and_then(|c| c.about.as_ref())
    }

    fn content(&self) -> VctResult<&ServiceContent> {
        self.content
            .as_ref()
            .ok_or_else(|| VctError::connection("Not logged in; no service content"))
    }

    // ── Session management ──────────────────────────────────────────

    /// Fetch the service content and log in via `SessionManager.Login`.
    pub async fn login(&mut self) -> VctResult<String> {
        let url = endpoint_url(&self.base_url, "ServiceInstance", "ServiceInstance", "content")?;
        let resp = Self::check_status(self.client.get(url).send().await?).await?;
        let content: ServiceContent = Self::parse_response(resp).await?;

        let session_manager = content
            .session_manager
            .clone()
            .ok_or_else(|| VctError::connection("Endpoint exposes no session manager"))?;
        let url = endpoint_url(&self.base_url, &session_manager.kind, &session_manager.value, "Login")?;
        let body = LoginRequest {
            user_name: &self.config.username,
            password: &self.config.password,
        };
        let resp = self.client.post(url).json(&body).send().await?;
        let resp = Self::check_status(resp).await.map_err(|e| match e.kind {
            VctErrorKind::ApiError(_) | VctErrorKind::AuthenticationError => {
                VctError::auth(format!("Login failed: {}", e.message))
            }
            _ => e,
        })?;

        let session_id = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| VctError::auth("Login response carried no session id"))?;

        if let Some(about) = content.about.as_ref() {
            log::info!("Logged in to {} as {} (API {})", about.full_name, self.config.username, about.api_version);
        }
        self.session_id = Some(session_id.clone());
        self.content = Some(content);
        Ok(session_id)
    }

    /// Log out via `SessionManager.Logout`. Failures are ignored.
    pub async fn logout(&mut self) -> VctResult<()> {
        if let Some(session_manager) = self.content.as_ref().and_then(|c| c.session_manager.clone()) {
            if self.session_id.is_some() {
                if let Err(e) = self.invoke_void(&session_manager, "Logout", &NoArgs {}).await {
                    log::debug!("Logout failed: {e}");
                }
            }
        }
        self.session_id = None;
        self.content = None;
        Ok(())
    }

    // ── HTTP helpers ────────────────────────────────────────────────

    fn require_session(&self) -> VctResult<&str> {
        self.session_id
            .as_deref()
            .ok_or_else(|| VctError::auth("Not logged in; no active session"))
    }

    async fn send(&self, req: RequestBuilder) -> VctResult<Response> {
        let sid = self.require_session()?;
        let resp = req.header(SESSION_HEADER, sid).send().await?;
        Self::check_status(resp).await
    }

    /// GET a property of a managed object.
    pub async fn get_property<T: DeserializeOwned>(
        &self,
        moref: &ManagedObjectRef,
        property: &str,
    ) -> VctResult<T> {
        let url = endpoint_url(&self.base_url, &moref.kind, &moref.value, property)?;
        log::debug!("GET {moref}.{property}");
        let resp = self.send(self.client.get(url)).await?;
        Self::parse_response(resp).await
    }

    /// POST a method call, returning its parsed result.
    pub async fn invoke<B: Serialize, T: DeserializeOwned>(
        &self,
        moref: &ManagedObjectRef,
        method: &str,
        body: &B,
    ) -> VctResult<T> {
        let url = endpoint_url(&self.base_url, &moref.kind, &moref.value, method)?;
        log::debug!("POST {moref}.{method}");
        let resp = self.send(self.client.post(url).json(body)).await?;
        Self::parse_response(resp).await
    }

    /// POST a method call whose result is discarded.
    pub async fn invoke_void<B: Serialize>(
        &self,
        moref: &ManagedObjectRef,
        method: &str,
        body: &B,
    ) -> VctResult<()> {
        let url = endpoint_url(&self.base_url, &moref.kind, &moref.value, method)?;
        log::debug!("POST {moref}.{method}");
        self.send(self.client.post(url).json(body)).await?;
        Ok(())
    }

    // ── Inventory snapshots ─────────────────────────────────────────

    /// Name plus kind-specific detail of one object. Folders expand their
    /// children while `depth` lasts; a datacenter always carries its VM
    /// folder tree.
    fn describe(&self, moref: ManagedObjectRef, depth: usize) -> BoxFuture<'_, VctResult<InventoryNode>> {
        async move {
            let name: String = self.get_property(&moref, "name").await?;
            let mut node = InventoryNode::new(moref, name);

            match node.kind {
                ObjectKind::Datacenter => {
                    let vm_folder: ManagedObjectRef = self.get_property(&node.moref, "vmFolder").await?;
                    let mut root = self.describe(vm_folder, VM_FOLDER_DEPTH).await?;
                    root.parent = Some(node.link());
                    node.detail = NodeDetail::Datacenter { vm_folder: Some(Box::new(root)) };
                }
                ObjectKind::Folder => {
                    let child_type: Vec<String> = self.get_property(&node.moref, "childType").await?;
                    node.detail = NodeDetail::Folder { child_type };
                    if depth > 0 {
                        let children: Vec<ManagedObjectRef> =
                            self.get_property(&node.moref, "childEntity").await?;
                        for child in children {
                            let child = self.describe(child, depth - 1).await?;
                            node = node.with_child(child);
                        }
                    }
                }
                ObjectKind::ComputeResource => {
                    let ds_refs: Vec<ManagedObjectRef> = self.get_property(&node.moref, "datastore").await?;
                    let net_refs: Vec<ManagedObjectRef> = self.get_property(&node.moref, "network").await?;
                    let resource_pool: Option<ManagedObjectRef> =
                        self.get_property(&node.moref, "resourcePool").await?;

                    let mut datastores = Vec::with_capacity(ds_refs.len());
                    for ds in ds_refs {
                        datastores.push(self.describe(ds, 0).await?);
                    }
                    let mut networks = Vec::with_capacity(net_refs.len());
                    for net in net_refs {
                        networks.push(self.describe(net, 0).await?);
                    }
                    node.detail = NodeDetail::ComputeResource { datastores, networks, resource_pool };
                }
                ObjectKind::Datastore => {
                    let summary: DatastoreSummary = self.get_property(&node.moref, "summary").await?;
                    node.detail = NodeDetail::Datastore(summary);
                }
                _ => {}
            }
            Ok(node)
        }
        .boxed()
    }

    async fn parent_link(&self, moref: &ManagedObjectRef) -> VctResult<Option<ParentLink>> {
        let parent: Option<ManagedObjectRef> = self.get_property(moref, "parent").await?;
        match parent {
            Some(parent) => {
                let name: String = self.get_property(&parent, "name").await?;
                Ok(Some(ParentLink { moref: parent, name }))
            }
            None => Ok(None),
        }
    }

    async fn collect_view(&self, view: &ManagedObjectRef) -> VctResult<ContainerView> {
        let members: Vec<ManagedObjectRef> = self.get_property(view, "view").await?;
        let mut nodes = Vec::with_capacity(members.len());
        for member in members {
            let mut node = self.describe(member, 1).await?;
            node.parent = self.parent_link(&node.moref).await?;
            nodes.push(node);
        }
        Ok(ContainerView::new(nodes))
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn check_status(resp: Response) -> VctResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let code = status.as_u16();
        let body = resp.text().await.unwrap_or_default();
        let (fault, message) = parse_fault(&body);
        let detail = message.unwrap_or(body);

        match (status, fault.as_deref()) {
            (StatusCode::UNAUTHORIZED, _) | (_, Some("InvalidLogin" | "NotAuthenticated")) => {
                Err(VctError::auth(format!("Session expired or invalid: {detail}")))
            }
            (StatusCode::FORBIDDEN, _) | (_, Some("NoPermission")) => Err(VctError::new(
                VctErrorKind::AccessDenied,
                format!("Access denied: {detail}"),
            )),
            (StatusCode::NOT_FOUND, _) | (_, Some("ManagedObjectNotFound")) => {
                Err(VctError::not_found(format!("Resource not found: {detail}")))
            }
            (_, Some(fault)) => Err(VctError::api(code, format!("{fault}: {detail}"))),
            _ => Err(VctError::api(code, format!("API error {code}: {detail}"))),
        }
    }

    async fn parse_response<T: DeserializeOwned>(resp: Response) -> VctResult<T> {
        let text = resp
            .text()
            .await
            .map_err(|e| VctError::parse(format!("Failed to read response body: {e}")))?;

        // Void methods and unset properties come back empty.
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| {
            let head: String = text.chars().take(500).collect();
            VctError::parse(format!("JSON parse error: {e}; body: {head}"))
        })
    }
}

#[async_trait::async_trait]
impl InventoryBrowser for VimClient {
    async fn container_view(
        &self,
        root: &ManagedObjectRef,
        kinds: &[ObjectKind],
        recursive: bool,
    ) -> VctResult<ContainerView> {
        let view_manager = self
            .content()?
            .view_manager
            .clone()
            .ok_or_else(|| VctError::inventory_unavailable("Endpoint exposes no view manager"))?;
        let request = CreateContainerViewRequest {
            container: root,
            types: kinds.iter().map(|k| k.view_type()).collect(),
            recursive,
        };
        let view: ManagedObjectRef = self.invoke(&view_manager, "CreateContainerView", &request).await?;

        let result = self.collect_view(&view).await;
        if let Err(e) = self.invoke_void(&view, "DestroyView", &NoArgs {}).await {
            log::debug!("DestroyView on {view} failed: {e}");
        }
        result
    }
}

#[async_trait::async_trait]
impl RemoteSession for VimClient {
    fn root_folder(&self) -> VctResult<ManagedObjectRef> {
        Ok(self.content()?.root_folder.clone())
    }

    fn inventory(&self) -> Option<&dyn InventoryBrowser> {
        self.content
            .as_ref()
            .and_then(|c| c.view_manager.as_ref())
            .map(|_| self as &dyn InventoryBrowser)
    }

    async fn create_vm(
        &self,
        folder: &ManagedObjectRef,
        pool: &ManagedObjectRef,
        spec: &VmConfigSpec,
    ) -> VctResult<TaskRef> {
        self.invoke(folder, "CreateVM_Task", &CreateVmRequest { config: spec, pool })
            .await
    }

    async fn reconfigure_vm(&self, vm: &ManagedObjectRef, spec: &VmConfigSpec) -> VctResult<TaskRef> {
        self.invoke(vm, "ReconfigVM_Task", &ReconfigRequest { spec }).await
    }

    async fn power(&self, vm: &ManagedObjectRef, action: PowerAction) -> VctResult<Option<TaskRef>> {
        if action.is_guest_operation() {
            self.invoke_void(vm, action.method(), &NoArgs {}).await?;
            Ok(None)
        } else {
            let task: TaskRef = self.invoke(vm, action.method(), &NoArgs {}).await?;
            Ok(Some(task))
        }
    }

    async fn task_snapshot(
        &self,
        task: &TaskRef,
        target: Option<&ManagedObjectRef>,
    ) -> VctResult<TaskSnapshot> {
        let info: TaskInfoWire = self.get_property(task, "info").await?;
        let mut snapshot = info.into_snapshot();
        if let Some(vm) = target {
            let runtime: RuntimeWire = self.get_property(vm, "runtime").await?;
            snapshot.pending_question = runtime.question.map(QuestionWire::into_question).transpose()?;
        }
        Ok(snapshot)
    }

    async fn answer_question(
        &self,
        vm: &ManagedObjectRef,
        question_id: &str,
        choice_key: i32,
    ) -> VctResult<()> {
        let body = AnswerRequest { question_id, answer_choice: choice_key.to_string() };
        self.invoke_void(vm, "AnswerVM", &body).await
    }

    async fn live_devices(&self, vm: &ManagedObjectRef) -> VctResult<Vec<LiveDevice>> {
        let config: Option<VmConfigInfoWire> = self.get_property(vm, "config").await?;
        Ok(config
            .map(|c| c.hardware.device.into_iter().map(LiveDevice::from).collect())
            .unwrap_or_default())
    }
}
