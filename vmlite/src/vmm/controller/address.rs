//! Guest address resolution and reachability.

use std::net::Ipv4Addr;
use std::time::Duration;

use vmlite_shared::constants::{SSH_PORT, SUSPEND_TAG, UNKNOWN_ADDRESS};
use vmlite_shared::errors::{VmliteError, VmliteResult};

use super::{VmController, VmState};
use crate::portal::GuestExecSession;
use crate::util::{TimeoutAction, try_action_for};
use crate::vmm::qemu::qmp;

impl VmController {
    /// Guest address, waiting for a DHCP lease if none is known yet.
    ///
    /// Each attempt first checks the hypervisor is alive, so a crashed
    /// instance fails fast with `StartFailure` instead of timing out.
    pub async fn ssh_hostname(&self) -> VmliteResult<String> {
        if let Some(ip) = self.cached_ip() {
            return Ok(ip.to_string());
        }

        let this = self;
        let ip = try_action_for(
            self.ctx.ip_timeout,
            self.ctx.ip_retry_interval,
            || VmliteError::AddressResolutionTimeout {
                vm_name: self.desc.vm_name.clone(),
                timeout: self.ctx.ip_timeout,
            },
            move || async move {
                this.ensure_running()?;
                Ok(match this.ctx.resolver.lookup(&this.desc.mac_addr) {
                    Some(ip) => TimeoutAction::Done(ip),
                    None => TimeoutAction::Retry,
                })
            },
        )
        .await?;

        self.shared.status.lock().ip = Some(ip);
        Ok(ip.to_string())
    }

    /// Guest address from the cache or a single lookup; `"UNKNOWN"` on a miss.
    pub fn ipv4(&self) -> String {
        match self.resolve_once() {
            Some(ip) => ip.to_string(),
            None => UNKNOWN_ADDRESS.to_string(),
        }
    }

    pub fn ssh_port(&self) -> u16 {
        SSH_PORT
    }

    pub fn ssh_username(&self) -> &str {
        &self.desc.ssh_username
    }

    /// Wait until the guest accepts command sessions.
    ///
    /// A `starting` or `restarting` instance becomes `running`. After a
    /// resume the memory snapshot is deleted from the image.
    pub async fn wait_until_reachable(&self, timeout: Duration) -> VmliteResult<()> {
        let this = self;
        try_action_for(
            timeout,
            self.ctx.ip_retry_interval,
            || VmliteError::GuestUnreachable {
                vm_name: self.desc.vm_name.clone(),
                timeout,
            },
            move || async move {
                this.ensure_running()?;
                let Some(ip) = this.resolve_once() else {
                    return Ok(TimeoutAction::Retry);
                };

                match this
                    .ctx
                    .guests
                    .connect(&ip.to_string(), SSH_PORT, &this.desc.ssh_username)
                    .await
                {
                    Ok(session) if session.is_connected() => Ok(TimeoutAction::Done(())),
                    Ok(_) => Ok(TimeoutAction::Retry),
                    Err(e) => {
                        tracing::debug!(vm_name = %this.desc.vm_name, error = %e, "Guest not reachable yet");
                        Ok(TimeoutAction::Retry)
                    }
                }
            },
        )
        .await?;

        let delete_snapshot = {
            let mut status = self.shared.status.lock();
            if matches!(status.state, VmState::Starting | VmState::Restarting) {
                self.shared.record(&mut status, VmState::Running);
            }
            std::mem::take(&mut status.delete_memory_snapshot)
        };

        if delete_snapshot && let Some(process) = &self.process {
            let command = qmp::human_command(&format!("delvm {}", SUSPEND_TAG));
            process.write(&command).await?;
            tracing::debug!(vm_name = %self.desc.vm_name, "Deleted memory snapshot");
        }

        Ok(())
    }

    /// Open a command session to the guest.
    pub async fn guest_session(&self) -> VmliteResult<Box<dyn GuestExecSession>> {
        let host = self.ssh_hostname().await?;
        self.ctx
            .guests
            .connect(&host, SSH_PORT, &self.desc.ssh_username)
            .await
    }

    fn cached_ip(&self) -> Option<Ipv4Addr> {
        self.shared.status.lock().ip
    }

    fn resolve_once(&self) -> Option<Ipv4Addr> {
        if let Some(ip) = self.cached_ip() {
            return Some(ip);
        }

        let ip = self.ctx.resolver.lookup(&self.desc.mac_addr)?;
        self.shared.status.lock().ip = Some(ip);
        Some(ip)
    }
}
