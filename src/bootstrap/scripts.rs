//! Shell-script and kubeadm-config generators for cloud-init payloads
//!
//! Every scale-set member boots through one generated script: the first
//! master runs `kubeadm init` with an embedded cluster configuration,
//! additional masters and workers run `kubeadm join` against a short-lived
//! bootstrap token pinned to the cluster CA. The scripts are plain string
//! templates; nodes execute them, the engine never does.

use serde::{Deserialize, Serialize};

/// Pod network CIDR used by all supported CNIs
pub const POD_SUBNET: &str = "10.244.0.0/16";

/// CNI flavor applied right after `kubeadm init`
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CniFlavor {
    /// Canal (calico policy + flannel networking)
    #[default]
    Canal,
    /// Flannel
    Flannel,
    /// Calico
    Calico,
}

impl CniFlavor {
    /// Manifest URL applied by the bootstrap script
    pub fn manifest_url(&self) -> &'static str {
        match self {
            CniFlavor::Canal => {
                "https://docs.projectcalico.org/v3.5/getting-started/kubernetes/installation/hosted/canal/canal.yaml"
            }
            CniFlavor::Flannel => {
                "https://raw.githubusercontent.com/coreos/flannel/master/Documentation/kube-flannel.yml"
            }
            CniFlavor::Calico => {
                "https://docs.projectcalico.org/v3.5/getting-started/kubernetes/installation/hosted/kubernetes-datastore/calico-networking/1.7/calico.yaml"
            }
        }
    }

    /// kubectl apply snippet for the bootstrap script
    pub fn apply_script(&self) -> String {
        format!(
            "sudo kubectl --kubeconfig /etc/kubernetes/admin.conf apply -f {}\n",
            self.manifest_url()
        )
    }
}

/// Package installation common to every member: container runtime plus
/// kubelet/kubectl pinned at the target version, kubeadm unpinned
pub fn prerequisites_install(kubernetes_version: &str) -> String {
    format!(
        r#"
sudo apt-get update && sudo apt-get install -y apt-transport-https ca-certificates curl gnupg-agent software-properties-common
curl -fsSL https://download.docker.com/linux/ubuntu/gpg | sudo apt-key add -
sudo add-apt-repository "deb [arch=amd64] https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable"
sudo apt-get install -y docker-ce=18.06.0~ce~3-0~ubuntu containerd.io
curl -fsSL https://packages.cloud.google.com/apt/doc/apt-key.gpg | sudo apt-key add -
cat <<EOF >/tmp/kubernetes.list
deb https://apt.kubernetes.io/ kubernetes-xenial main
EOF
sudo mv /tmp/kubernetes.list /etc/apt/sources.list.d/kubernetes.list
sudo apt-get update && sudo apt-get install -y kubelet={kubernetes_version}-00 kubectl={kubernetes_version}-00 kubeadm
sudo apt-mark hold kubelet kubeadm kubectl
sudo sysctl net.bridge.bridge-nf-call-iptables=1
"#
    )
}

/// Map an address onto the internal DNS name in /etc/hosts
fn etc_hosts_pin(address: &str, internal_dns_name: &str) -> String {
    format!(
        r#"
sudo cp -f /etc/hosts /tmp/hostsupdate
sudo chown $(id -u):$(id -g) /tmp/hostsupdate
echo '{address} {internal_dns_name}' >> /tmp/hostsupdate
sudo mv /etc/hosts /etc/hosts.bak
sudo mv /tmp/hostsupdate /etc/hosts
"#
    )
}

/// kubeadm InitConfiguration + ClusterConfiguration for the first master
pub fn kubeadm_init_config(
    kubernetes_version: &str,
    public_dns_name: &str,
    internal_dns_name: &str,
) -> String {
    format!(
        r#"
cat <<EOF >/tmp/kubeadm-config.yaml
apiVersion: kubeadm.k8s.io/v1beta1
nodeRegistration:
  kubeletExtraArgs:
    cloud-provider: azure
    cloud-config: /etc/kubernetes/azure.json
kind: InitConfiguration
---
apiVersion: kubeadm.k8s.io/v1beta1
kind: ClusterConfiguration
apiServer:
  certSANs:
  - "{public_dns_name}"
  - "{internal_dns_name}"
  - "10.0.0.100"
  extraArgs:
    cloud-config: /etc/kubernetes/azure.json
    cloud-provider: azure
  extraVolumes:
  - hostPath: /etc/kubernetes/azure.json
    mountPath: /etc/kubernetes/azure.json
    name: cloud-config
    readOnly: true
controllerManager:
  extraArgs:
    cloud-config: /etc/kubernetes/azure.json
    cloud-provider: azure
  extraVolumes:
  - hostPath: /etc/kubernetes/azure.json
    mountPath: /etc/kubernetes/azure.json
    name: cloud-config
    readOnly: true
kubernetesVersion: {kubernetes_version}
controlPlaneEndpoint: "{internal_dns_name}:6443"
networking:
  podSubnet: "{POD_SUBNET}"
EOF
"#
    )
}

/// First-master startup: install packages, pin the bootstrap address, run
/// `kubeadm init`, apply the CNI
pub fn bootstrap_startup_script(
    kubernetes_version: &str,
    public_dns_name: &str,
    internal_dns_name: &str,
    cni: CniFlavor,
) -> String {
    format!(
        r#"
set -eux
{init_config}
{prerequisites}
{hosts_pin}
sudo kubeadm init --config /tmp/kubeadm-config.yaml
mkdir -p $HOME/.kube
sudo cp -f /etc/kubernetes/admin.conf $HOME/.kube/config
sudo chown $(id -u):$(id -g) $HOME/.kube/config
{cni_apply}
"#,
        init_config = kubeadm_init_config(kubernetes_version, public_dns_name, internal_dns_name),
        prerequisites = prerequisites_install(kubernetes_version),
        hosts_pin = etc_hosts_pin("10.0.0.4", internal_dns_name),
        cni_apply = cni.apply_script(),
    )
}

/// kubeadm JoinConfiguration for an additional control-plane member
pub fn control_plane_join_config(
    bootstrap_token: &str,
    internal_dns_name: &str,
    discovery_hash: &str,
) -> String {
    format!(
        r#"
cat <<EOF >/tmp/kubeadm-config.yaml
apiVersion: kubeadm.k8s.io/v1beta1
kind: JoinConfiguration
nodeRegistration:
  kubeletExtraArgs:
    cloud-provider: azure
    cloud-config: /etc/kubernetes/azure.json
discovery:
  bootstrapToken:
    token: {bootstrap_token}
    apiServerEndpoint: "{internal_dns_name}:6443"
    caCertHashes:
    - {discovery_hash}
controlPlane:
  localAPIEndpoint:
EOF
"#
    )
}

/// Control-plane member startup: join in a loop, removing the node's own
/// stale etcd membership before each retry.
///
/// The etcd cleanup is the recovery path for a member whose previous join
/// attempt registered it with the etcd cluster but died before completing;
/// without it the rejoin is refused forever.
pub fn control_plane_startup_script(
    kubernetes_version: &str,
    api_server_address: &str,
    internal_dns_name: &str,
    bootstrap_token: &str,
    discovery_hash: &str,
    etcd_endpoints: &str,
) -> String {
    format!(
        r#"
set -eux
{prerequisites}
{hosts_pin}
{join_config}
#Setup using kubeadm
until sudo kubeadm join --config /tmp/kubeadm-config.yaml > /dev/null; do
	MEMBER_ID=$(sudo etcdctl --cert-file /etc/kubernetes/pki/etcd/server.crt --key-file /etc/kubernetes/pki/etcd/server.key --ca-file /etc/kubernetes/pki/etcd/ca.crt --endpoints \"{etcd_endpoints}\" member list | grep -i $(uname -n) | cut -d ':' -f1)
	[ ! -z "$MEMBER_ID" ] && sudo etcdctl --cert-file /etc/kubernetes/pki/etcd/server.crt --key-file /etc/kubernetes/pki/etcd/server.key --ca-file /etc/kubernetes/pki/etcd/ca.crt --endpoints \"{etcd_endpoints}\" member remove $MEMBER_ID
	sudo rm -rf /etc/kubernetes/manifests
	sleep 30
done
sudo cp -f /etc/hosts.bak /tmp/hostsupdate
sudo chown $(id -u):$(id -g) /tmp/hostsupdate
echo '127.0.0.1 {internal_dns_name}' >> /tmp/hostsupdate
sudo mv /tmp/hostsupdate /etc/hosts
"#,
        prerequisites = prerequisites_install(kubernetes_version),
        hosts_pin = etc_hosts_pin(api_server_address, internal_dns_name),
        join_config =
            control_plane_join_config(bootstrap_token, internal_dns_name, discovery_hash),
    )
}

/// kubeadm JoinConfiguration for a worker (no controlPlane section)
pub fn node_join_config(
    bootstrap_token: &str,
    internal_dns_name: &str,
    discovery_hash: &str,
) -> String {
    format!(
        r#"
cat <<EOF >/tmp/kubeadm-config.yaml
apiVersion: kubeadm.k8s.io/v1beta1
kind: JoinConfiguration
nodeRegistration:
  kubeletExtraArgs:
    cloud-provider: azure
    cloud-config: /etc/kubernetes/azure.json
discovery:
  bootstrapToken:
    token: {bootstrap_token}
    apiServerEndpoint: "{internal_dns_name}:6443"
    caCertHashes:
    - {discovery_hash}
EOF
"#
    )
}

/// Worker startup: install packages, pin the internal LB address, join
pub fn node_startup_script(
    kubernetes_version: &str,
    internal_dns_name: &str,
    bootstrap_token: &str,
    discovery_hash: &str,
) -> String {
    format!(
        r#"
{prerequisites}
{hosts_pin}
{join_config}
#Setup using kubeadm
sudo kubeadm join --config /tmp/kubeadm-config.yaml
"#,
        prerequisites = prerequisites_install(kubernetes_version),
        hosts_pin = etc_hosts_pin(crate::INTERNAL_LB_ADDRESS, internal_dns_name),
        join_config = node_join_config(bootstrap_token, internal_dns_name, discovery_hash),
    )
}

/// In-place control-plane upgrade, executed on one member at a time via
/// run-command: upgrade kubeadm/kubectl, apply the control-plane upgrade,
/// drain self, bump kubelet, restart, uncordon self
pub fn upgrade_script(kubernetes_version: &str) -> String {
    format!(
        r#"
sudo apt-get upgrade -y kubectl={kubernetes_version}-00 kubeadm={kubernetes_version}-00
sudo kubeadm upgrade apply --force --yes v{kubernetes_version}
sudo kubectl --kubeconfig /etc/kubernetes/admin.conf drain $(uname -n) --ignore-daemonsets
sudo apt-mark unhold kubelet
sudo apt-get upgrade -y kubelet={kubernetes_version}-00
sudo apt-mark hold kubelet
sudo systemctl restart kubelet
sudo kubectl --kubeconfig /etc/kubernetes/admin.conf uncordon $(uname -n)
"#
    )
}
