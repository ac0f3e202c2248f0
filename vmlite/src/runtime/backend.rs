//! QEMU backend: builds controllers wired to the real host collaborators.

use std::sync::Arc;

use vmlite_shared::errors::{VmliteError, VmliteResult};

use crate::db::{Database, VmStore};
use crate::monitor::{PersistentMonitor, StatusMonitor};
use crate::net::{AddressResolver, DnsmasqLeases, HostNetwork, IpLinkNetwork, TapDevice};
use crate::portal::GuestConnector;
use crate::runtime::options::VmliteOptions;
use crate::vmm::process::HostProcessFactory;
use crate::vmm::qemu::{HypervisorProbe, QemuProbe};
use crate::vmm::{ControllerContext, VmController, VmDescriptor};

/// Creates `VmController`s for the `qemu` driver.
pub struct QemuBackend {
    options: VmliteOptions,
    monitor: Arc<dyn StatusMonitor>,
    guests: Arc<dyn GuestConnector>,
    network: Arc<dyn HostNetwork>,
    resolver: Arc<dyn AddressResolver>,
    hypervisor: Arc<dyn HypervisorProbe>,
}

impl QemuBackend {
    /// # Errors
    ///
    /// Returns `Config` when `options.driver` is not `qemu`.
    pub fn new(
        options: VmliteOptions,
        monitor: Arc<dyn StatusMonitor>,
        guests: Arc<dyn GuestConnector>,
    ) -> VmliteResult<Self> {
        if options.driver != "qemu" {
            return Err(VmliteError::Config(format!(
                "Unsupported virtualization driver: {}",
                options.driver
            )));
        }

        let network: Arc<dyn HostNetwork> = Arc::new(IpLinkNetwork::new(&options.bridge_name));
        let resolver: Arc<dyn AddressResolver> =
            Arc::new(DnsmasqLeases::new(&options.leases_path));
        let hypervisor: Arc<dyn HypervisorProbe> = Arc::new(QemuProbe::new(
            &options.qemu_binary,
            &options.qemu_img_binary,
        ));

        tracing::info!(
            qemu = %options.qemu_binary,
            bridge = %options.bridge_name,
            leases = %options.leases_path.display(),
            "QEMU backend initialized"
        );

        Ok(Self {
            options,
            monitor,
            guests,
            network,
            resolver,
            hypervisor,
        })
    }

    pub fn options(&self) -> &VmliteOptions {
        &self.options
    }

    /// Create a tap device for `desc` and a controller owning it.
    pub fn create_controller(&self, desc: VmDescriptor) -> VmliteResult<VmController> {
        let tap_name = format!("tap-{:08x}", rand::random::<u32>());
        let tap = TapDevice::create(tap_name, Arc::clone(&self.network))?;

        let ctx = ControllerContext {
            monitor: Arc::clone(&self.monitor),
            processes: Arc::new(HostProcessFactory),
            resolver: Arc::clone(&self.resolver),
            hypervisor: Arc::clone(&self.hypervisor),
            guests: Arc::clone(&self.guests),
            qemu_binary: self.options.qemu_binary.clone(),
            ip_timeout: self.options.ip_timeout(),
            ip_retry_interval: self.options.ip_retry_interval(),
        };

        Ok(VmController::new(desc, tap, ctx))
    }
}

/// Open the state database under the home dir and warm the monitor cache.
pub fn open_monitor(options: &VmliteOptions) -> VmliteResult<PersistentMonitor> {
    let db_path = options.db_path();
    let db = Database::open(&db_path).map_err(|e| {
        VmliteError::Storage(format!(
            "Failed to initialize database at {}: {}",
            db_path.display(),
            e
        ))
    })?;

    let monitor = PersistentMonitor::new(VmStore::new(db));
    let loaded = monitor.load_all()?;
    tracing::debug!(count = loaded, "Loaded persisted VM states");
    Ok(monitor)
}
