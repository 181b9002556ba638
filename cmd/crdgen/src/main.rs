use proxmox_cluster::crd::{ProxmoxCluster, ProxmoxClusterTemplate};
use proxmox_machine::crd::{ProxmoxMachine, ProxmoxMachineTemplate};

use kube::CustomResourceExt;

fn main() {
    for crd in [
        ProxmoxCluster::crd(),
        ProxmoxClusterTemplate::crd(),
        ProxmoxMachine::crd(),
        ProxmoxMachineTemplate::crd(),
    ] {
        // safe unwrap: we know CRD is serializable
        print!("---\n{}\n", serde_yaml::to_string(&crd).unwrap());
    }
}
