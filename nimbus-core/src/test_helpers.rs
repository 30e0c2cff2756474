//! Test helpers for unit and integration tests
//!
//! [`RecordingExecutor`] stands in for the hosts: it records every script
//! run, can fail chosen invocations and keeps a model of each host's VxLAN
//! bridges so mesh properties can be checked. [`TestCloud`] wires it to an
//! in-memory store with a bootstrapped cloud admin.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::NimbusConfig;
use crate::context::RequestContext;
use crate::dispatcher::{Caller, Dispatcher};
use crate::error::NimbusResult;
use crate::remote::{RemoteCommand, RemoteExecutor, RemoteOutput, Script};
use crate::storage::ResourceStore;
use crate::types::{Host, HostCapacity, HostCredentials, HostResource, Role, Secret};
use crate::workflows::{CreateVmRequest, Orchestrator};

pub const ADMIN_ID: &str = "admin@acme.io";
pub const ORG: &str = "acme";
pub const PROJECT: &str = "default";

const MIB: u64 = 1024 * 1024;

/// Cloud admin of `acme`, active in `acme/default`
pub fn admin_ctx() -> RequestContext {
    RequestContext::new(ADMIN_ID, Role::CloudAdmin, ORG, PROJECT).unwrap()
}

/// Plain user active in `org/project`
pub fn user_ctx(org: &str, project: &str) -> RequestContext {
    RequestContext::new(&format!("user@{org}.io"), Role::User, org, project).unwrap()
}

/// Host reachable at `{name}.lan`
pub fn host(name: &str, architecture: &str, cores: u32, memory_mib: u64) -> Host {
    Host {
        hostname: name.to_string(),
        address: format!("{name}.lan"),
        host_type: "kvm".to_string(),
        credentials: HostCredentials {
            user: "root".to_string(),
            password: Secret::new(format!("{name}-secret")),
            host_key: format!("ssh-ed25519 AAAA{name}"),
            port: 22,
        },
        capacity: HostCapacity {
            cores,
            memory_bytes: memory_mib * MIB,
            disk_bytes: 500 * 1024 * MIB,
            network_speed: 1_000_000_000,
            sockets: 1,
        },
        processor: "x86".to_string(),
        architecture: architecture.to_string(),
        org: None,
        last_sync: None,
    }
}

/// Cloud image for `architecture`
pub fn image(name: &str, architecture: &str) -> HostResource {
    HostResource {
        name: name.to_string(),
        uri: format!("https://images.example/{name}.qcow2"),
        architecture: architecture.to_string(),
        description: format!("{name} image"),
        extra_info: "ubuntu22.04:qcow2".to_string(),
        resource_type: "image".to_string(),
    }
}

/// Minimal VM request
pub fn vm_request(name: &str, image: &str, cores: u32, memory_mb: u64) -> CreateVmRequest {
    CreateVmRequest {
        name: name.to_string(),
        description: format!("{name} test VM"),
        cores,
        memory_mb,
        disk_gb: 20,
        image: image.to_string(),
        ..Default::default()
    }
}

/// One script run as the executor saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub hostname: String,
    pub address: String,
    pub script: Script,
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
struct ExecutorState {
    calls: Vec<RecordedCall>,
    counts: HashMap<Script, usize>,
    /// 1-based invocation numbers to fail, per script
    fail_on: HashMap<Script, BTreeSet<usize>>,
    fail_always: HashSet<Script>,
    delays: HashMap<Script, Duration>,
    /// (host address, bridge label) -> peer addresses
    bridges: BTreeMap<(String, String), BTreeSet<String>>,
}

/// In-process stand-in for the hosts
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    state: Mutex<ExecutorState>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `nth` run of `script`, counting from 1 and from now on
    pub fn fail_on(&self, script: Script, nth: usize) {
        let mut state = self.state.lock();
        let seen = state.counts.get(&script).copied().unwrap_or(0);
        state.fail_on.entry(script).or_default().insert(seen + nth);
    }

    pub fn fail_always(&self, script: Script) {
        self.state.lock().fail_always.insert(script);
    }

    pub fn recover(&self, script: Script) {
        let mut state = self.state.lock();
        state.fail_always.remove(&script);
        state.fail_on.remove(&script);
    }

    /// Make every run of `script` take `delay`
    pub fn slow(&self, script: Script, delay: Duration) {
        self.state.lock().delays.insert(script, delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, script: Script) -> Vec<RecordedCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.script == script)
            .cloned()
            .collect()
    }

    pub fn count(&self, script: Script) -> usize {
        self.state.lock().counts.get(&script).copied().unwrap_or(0)
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Peer list of the bridge `label` on the host at `address`
    pub fn peers(&self, address: &str, label: &str) -> Option<BTreeSet<String>> {
        self.state
            .lock()
            .bridges
            .get(&(address.to_string(), label.to_string()))
            .cloned()
    }

    /// Addresses of every host carrying bridge `label`
    pub fn bridge_members(&self, label: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .bridges
            .keys()
            .filter(|(_, bridge)| bridge == label)
            .map(|(address, _)| address.clone())
            .collect()
    }

    fn apply(state: &mut ExecutorState, command: &RemoteCommand) {
        let address = command.host.address.clone();
        let label = command.args.first().cloned().unwrap_or_default();
        let listed: Vec<String> = command
            .args
            .get(2)
            .map(|peers| peers.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let key = (address, label);
        match command.script {
            Script::AddOrModifyVxlanBridge | Script::AddVxlanPeers => {
                state.bridges.entry(key).or_default().extend(listed);
            }
            Script::DeleteVxlanPeers => {
                if let Some(peers) = state.bridges.get_mut(&key) {
                    for peer in &listed {
                        peers.remove(peer);
                    }
                }
            }
            Script::DeleteVxlanBridge => {
                state.bridges.remove(&key);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl RemoteExecutor for RecordingExecutor {
    async fn execute(&self, command: RemoteCommand) -> NimbusResult<RemoteOutput> {
        let (fails, delay) = {
            let mut state = self.state.lock();
            let count = {
                let count = state.counts.entry(command.script).or_insert(0);
                *count += 1;
                *count
            };
            state.calls.push(RecordedCall {
                hostname: command.host.hostname.clone(),
                address: command.host.address.clone(),
                script: command.script,
                args: command.args.clone(),
            });
            let fails = state.fail_always.contains(&command.script)
                || state
                    .fail_on
                    .get(&command.script)
                    .is_some_and(|runs| runs.contains(&count));
            if !fails {
                Self::apply(&mut state, &command);
            }
            (fails, state.delays.get(&command.script).copied())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Ok(RemoteOutput::failed(
                format!("{} output", command.script),
                "injected failure",
            ));
        }
        Ok(RemoteOutput::succeeded(format!("{} ok", command.script)))
    }
}

/// In-memory cloud with one org, its default project and a cloud admin
pub struct TestCloud {
    pub store: Arc<ResourceStore>,
    pub executor: Arc<RecordingExecutor>,
    pub orchestrator: Arc<Orchestrator>,
    pub admin: RequestContext,
}

impl TestCloud {
    pub async fn new() -> NimbusResult<Self> {
        Self::with_config(NimbusConfig::test()).await
    }

    pub async fn with_config(config: NimbusConfig) -> NimbusResult<Self> {
        let store = Arc::new(ResourceStore::in_memory()?);
        let executor = Arc::new(RecordingExecutor::new());
        let orchestrator = Arc::new(Orchestrator::new(config, store.clone(), executor.clone()));

        let bootstrap = RequestContext::bootstrap(ADMIN_ID, ORG)?;
        store
            .add_user(&bootstrap, ADMIN_ID, "Admin", None, "cloudadmin")
            .await?;
        let admin = admin_ctx();
        orchestrator.init_org(&admin).await?;

        Ok(Self {
            store,
            executor,
            orchestrator,
            admin,
        })
    }

    pub async fn add_host(&self, name: &str, architecture: &str, cores: u32, memory_mib: u64) -> NimbusResult<Host> {
        let host = host(name, architecture, cores, memory_mib);
        self.orchestrator.add_host(&self.admin, &host).await?;
        Ok(host)
    }

    pub async fn add_image(&self, name: &str, architecture: &str) -> NimbusResult<HostResource> {
        let image = image(name, architecture);
        self.orchestrator.add_host_resource(&self.admin, &image).await?;
        Ok(image)
    }

    /// Register a plain user who is a member of `project`
    pub async fn add_member(&self, user_id: &str, project: &str) -> NimbusResult<RequestContext> {
        let admin = self.admin.with_project(ORG, project)?;
        self.orchestrator.add_project(&admin, project, "").await?;
        self.orchestrator
            .add_user(&admin, user_id, user_id, Some(ORG), Some("user"))
            .await?;
        self.orchestrator
            .add_user_to_project(&admin, user_id, Some(project))
            .await?;
        RequestContext::new(user_id, Role::User, ORG, project)
    }

    pub fn dispatcher(&self) -> NimbusResult<Dispatcher> {
        Dispatcher::new(self.orchestrator.clone())
    }

    pub fn admin_caller(&self) -> Caller {
        Caller {
            user_id: ADMIN_ID.to_string(),
            role: Role::CloudAdmin,
            org: ORG.to_string(),
            project: Some(PROJECT.to_string()),
            setup: false,
        }
    }
}
