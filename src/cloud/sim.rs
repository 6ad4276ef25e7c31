//! Simulated in-memory cloud driver
//!
//! `SimCloud` keeps the whole cloud inventory in memory and implements every
//! [`CloudDriver`] operation against it. It backs the test suite (including
//! fault injection for partial-failure scenarios) and `--simulate` runs of
//! the operator binary.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use super::{CloudBuilder, CloudDriver, VmssParams};
use crate::crd::{CloudConfig, VmStatus};
use crate::{Error, Result};

/// One simulated scale set
#[derive(Clone, Debug)]
struct SimVmss {
    params: VmssParams,
    instances: Vec<VmStatus>,
}

/// Full inventory of the simulated resource group
#[derive(Debug, Default)]
struct SimState {
    resource_group: bool,
    vnets: Vec<String>,
    internal_lbs: Vec<String>,
    public_lbs: Vec<String>,
    public_ips: BTreeMap<String, String>,
    vmss: BTreeMap<String, SimVmss>,
    run_commands: Vec<(String, String, String)>,
    create_calls: BTreeMap<String, u32>,
    faults: VecDeque<String>,
    next_ip_octet: u8,
}

/// In-memory cloud driver
#[derive(Default)]
pub struct SimCloud {
    state: Mutex<SimState>,
}

impl SimCloud {
    /// Create an empty simulated cloud
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transient failure for the next call of the named operation.
    ///
    /// Operation names match the `CloudDriver` method names.
    pub fn inject_fault(&self, operation: &str) {
        self.state.lock().unwrap().faults.push_back(operation.to_string());
    }

    /// Returns true when the resource group exists
    pub fn has_resource_group(&self) -> bool {
        self.state.lock().unwrap().resource_group
    }

    /// Returns true when the named vnet exists
    pub fn has_vnet(&self, name: &str) -> bool {
        self.state.lock().unwrap().vnets.iter().any(|v| v == name)
    }

    /// Parameters of a scale set, if it exists
    pub fn vmss_params(&self, name: &str) -> Option<VmssParams> {
        self.state
            .lock()
            .unwrap()
            .vmss
            .get(name)
            .map(|v| v.params.clone())
    }

    /// Names of all scale sets currently present
    pub fn vmss_names(&self) -> Vec<String> {
        self.state.lock().unwrap().vmss.keys().cloned().collect()
    }

    /// Number of times the named operation performed a create-or-update
    pub fn create_calls(&self, operation: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .create_calls
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    /// Scripts executed against scale-set members, oldest first
    pub fn run_command_log(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().run_commands.clone()
    }

    fn begin(&self, operation: &str) -> Result<std::sync::MutexGuard<'_, SimState>> {
        let mut state = self.state.lock().unwrap();
        if state.faults.front().map(String::as_str) == Some(operation) {
            state.faults.pop_front();
            return Err(Error::cloud(format!("simulated 503 during {operation}")));
        }
        *state.create_calls.entry(operation.to_string()).or_insert(0) += 1;
        Ok(state)
    }
}

fn instance(vmss_name: &str, index: usize) -> VmStatus {
    VmStatus {
        vm_computer_name: format!("{vmss_name}{index:06}"),
        vm_instance_id: index.to_string(),
    }
}

#[async_trait]
impl CloudDriver for SimCloud {
    async fn create_or_update_resource_group(&self) -> Result<()> {
        let mut state = self.begin("create_or_update_resource_group")?;
        state.resource_group = true;
        Ok(())
    }

    async fn delete_resource_group(&self) -> Result<()> {
        let mut state = self.begin("delete_resource_group")?;
        *state = SimState {
            faults: std::mem::take(&mut state.faults),
            create_calls: std::mem::take(&mut state.create_calls),
            ..Default::default()
        };
        Ok(())
    }

    async fn create_virtual_network_and_subnets(&self, vnet_name: &str) -> Result<()> {
        let mut state = self.begin("create_virtual_network_and_subnets")?;
        if !state.vnets.iter().any(|v| v == vnet_name) {
            state.vnets.push(vnet_name.to_string());
        }
        Ok(())
    }

    async fn create_internal_load_balancer(
        &self,
        _vnet_name: &str,
        _subnet_name: &str,
        lb_name: &str,
    ) -> Result<()> {
        let mut state = self.begin("create_internal_load_balancer")?;
        if !state.internal_lbs.iter().any(|l| l == lb_name) {
            state.internal_lbs.push(lb_name.to_string());
        }
        Ok(())
    }

    async fn create_public_load_balancer(&self, lb_name: &str, public_ip_name: &str) -> Result<()> {
        let mut state = self.begin("create_public_load_balancer")?;
        if !state.public_lbs.iter().any(|l| l == lb_name) {
            state.public_lbs.push(lb_name.to_string());
        }
        if !state.public_ips.contains_key(public_ip_name) {
            state.next_ip_octet = state.next_ip_octet.wrapping_add(1);
            let address = format!("52.180.40.{}", state.next_ip_octet);
            state.public_ips.insert(public_ip_name.to_string(), address);
        }
        Ok(())
    }

    async fn get_public_ip_address(&self, public_ip_name: &str) -> Result<String> {
        let state = self.begin("get_public_ip_address")?;
        state
            .public_ips
            .get(public_ip_name)
            .cloned()
            .ok_or_else(|| Error::cloud(format!("public ip {public_ip_name} not found")))
    }

    async fn create_or_update_vmss(&self, params: &VmssParams) -> Result<()> {
        let mut state = self.begin("create_or_update_vmss")?;
        let capacity = params.capacity.max(0) as usize;
        let instances = (0..capacity).map(|i| instance(&params.name, i)).collect();
        info!(vmss = %params.name, capacity, "sim: create or update vmss");
        state.vmss.insert(
            params.name.clone(),
            SimVmss {
                params: params.clone(),
                instances,
            },
        );
        Ok(())
    }

    async fn scale_vmss(&self, vmss_name: &str, custom_data: &str, capacity: i32) -> Result<()> {
        let mut state = self.begin("scale_vmss")?;
        let vmss = state
            .vmss
            .get_mut(vmss_name)
            .ok_or_else(|| Error::cloud(format!("vmss {vmss_name} not found")))?;
        vmss.params.custom_data = custom_data.to_string();
        vmss.params.capacity = capacity;

        let target = capacity.max(0) as usize;
        while vmss.instances.len() > target {
            vmss.instances.pop();
        }
        let mut next = vmss
            .instances
            .iter()
            .filter_map(|vm| vm.vm_instance_id.parse::<usize>().ok())
            .max()
            .map(|id| id + 1)
            .unwrap_or(0);
        while vmss.instances.len() < target {
            vmss.instances.push(instance(vmss_name, next));
            next += 1;
        }
        Ok(())
    }

    async fn delete_vmss(&self, vmss_name: &str) -> Result<()> {
        let mut state = self.begin("delete_vmss")?;
        state.vmss.remove(vmss_name);
        Ok(())
    }

    async fn delete_vmss_instance(&self, vmss_name: &str, instance_id: &str) -> Result<()> {
        let mut state = self.begin("delete_vmss_instance")?;
        if let Some(vmss) = state.vmss.get_mut(vmss_name) {
            vmss.instances.retain(|vm| vm.vm_instance_id != instance_id);
        }
        Ok(())
    }

    async fn list_vmss_instances(&self, vmss_name: &str) -> Result<Option<Vec<VmStatus>>> {
        let state = self.begin("list_vmss_instances")?;
        Ok(state.vmss.get(vmss_name).map(|v| v.instances.clone()))
    }

    async fn run_shell_script(
        &self,
        vmss_name: &str,
        instance_id: &str,
        script: &str,
    ) -> Result<()> {
        let mut state = self.begin("run_shell_script")?;
        state.run_commands.push((
            vmss_name.to_string(),
            instance_id.to_string(),
            script.to_string(),
        ));
        Ok(())
    }
}

/// Builder handing out one shared simulated cloud for every configuration
#[derive(Clone, Default)]
pub struct SimCloudBuilder {
    cloud: Arc<SimCloud>,
}

impl SimCloudBuilder {
    /// Create a builder around a fresh simulated cloud
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared simulated cloud, for inspection in tests
    pub fn cloud(&self) -> Arc<SimCloud> {
        self.cloud.clone()
    }
}

impl CloudBuilder for SimCloudBuilder {
    fn driver(&self, _config: &CloudConfig) -> Arc<dyn CloudDriver> {
        self.cloud.clone()
    }
}
