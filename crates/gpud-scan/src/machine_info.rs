//! Machine-info gathering is an external collaborator per `spec.md` §1
//! (CPU model, kernel version, PCI enumeration, DERP-based geolocation).
//! This crate only needs the one fact that feeds InfiniBand's port-rate
//! expectation: the GPU product name, if known.

pub trait MachineInfo: Send + Sync {
    fn gpu_product_name(&self) -> Option<String>;
}

/// Default collaborator for hosts/tests where machine info isn't wired up.
pub struct UnknownMachineInfo;

impl MachineInfo for UnknownMachineInfo {
    fn gpu_product_name(&self) -> Option<String> {
        None
    }
}
