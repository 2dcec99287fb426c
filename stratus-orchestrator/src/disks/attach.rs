use super::devices::{self, DeviceProbe};
use super::{iscsi, DiskManager};
use crate::logger::ActionLog;
use crate::poller::Poller;
use crate::provider_errors::{classify, into_cpi, ProviderFailure};
use crate::settings::PollSettings;
use anyhow::{Context, Result};
use std::io::Write;
use stratus_common::{ComputeInstance, CpiError, Credential, Volume};
use stratus_providers::RemoteCommand;

/// iSCSI devices an instance may already carry before another attach.
const MAX_ATTACHED_DEVICES: usize = 2;

/// Remote shell on one instance, as the configured user.
struct Shell<'a> {
    remote: &'a dyn RemoteCommand,
    user: &'a str,
    instance: &'a ComputeInstance,
}

impl Shell<'_> {
    async fn run(&self, command: &str) -> Result<String> {
        self.remote
            .exec(
                self.user,
                &self.instance.root.password,
                &self.instance.primary_backend_ip,
                command,
            )
            .await
            .with_context(|| format!("running `{}` on vm {}", command, self.instance.id))
    }

    async fn has_multipath(&self) -> Result<bool> {
        Ok(self.run(iscsi::MULTIPATH_PROBE).await?.contains("multipath"))
    }

    async fn device_names(&self, multipath: bool) -> Result<Vec<String>> {
        let names = if multipath {
            devices::parse_dmsetup_ls(&self.run(iscsi::LIST_MULTIPATH_DEVICES).await?)?
        } else {
            devices::parse_proc_partitions(&self.run(iscsi::LIST_PARTITIONS).await?)?
        };
        tracing::debug!(cid = self.instance.id, ?names, multipath, "block devices");
        Ok(names)
    }

    async fn write_iscsid_conf(&self, chap: &Credential) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("iscsid_conf_")
            .tempfile()
            .context("creating iscsid.conf staging file")?;
        file.write_all(iscsi::render_iscsid_conf(chap).as_bytes())
            .context("staging iscsid.conf")?;
        file.flush().context("staging iscsid.conf")?;
        self.remote
            .upload(
                self.user,
                &self.instance.root.password,
                &self.instance.primary_backend_ip,
                file.path(),
                iscsi::ISCSID_CONF,
            )
            .await
            .with_context(|| format!("uploading {} to vm {}", iscsi::ISCSID_CONF, self.instance.id))
    }

    async fn discover_and_login(&self, portal: &str) -> Result<()> {
        self.run(&iscsi::discover(portal)).await?;
        self.run(iscsi::LOGIN).await?;
        Ok(())
    }
}

fn device_path(name: &str, multipath: bool) -> String {
    if multipath {
        format!("/dev/mapper/{}", name)
    } else {
        format!("/dev/{}", name)
    }
}

/// Flips host access on a volume, retrying while the volume is busy.
async fn change_access<F, Fut>(window: PollSettings, condition: &str, mut call: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    Poller::from(window)
        .wait_until(condition, || {
            let fut = call();
            async move {
                match fut.await {
                    Ok(done) => Ok(done),
                    Err(e) if classify(&e) == ProviderFailure::Transient => {
                        tracing::warn!(error = %e, "volume busy, retrying access change");
                        Ok(false)
                    }
                    Err(e) => Err(into_cpi(e, "changing volume access")),
                }
            }
        })
        .await
}

impl DiskManager {
    fn shell<'a>(&'a self, instance: &'a ComputeInstance) -> Shell<'a> {
        Shell {
            remote: self.remote.as_ref(),
            user: &self.settings.ssh_user,
            instance,
        }
    }

    async fn load(&self, cid: i64, volume_id: i64) -> Result<(ComputeInstance, Volume)> {
        let instance = self
            .provider
            .get_instance(cid)
            .await
            .map_err(|e| into_cpi(e, &format!("virtual guest {}", cid)))?;
        let volume = self
            .provider
            .get_volume(volume_id)
            .await
            .map_err(|e| into_cpi(e, &format!("volume {}", volume_id)))?;
        Ok((instance, volume))
    }

    /// Attaches `volume_id` to `cid` and returns the device path recorded in
    /// the instance's agent settings.
    pub async fn attach_disk(&self, cid: i64, volume_id: i64) -> Result<String> {
        let log = ActionLog::start("ATTACH_DISK", format!("{} -> vm {}", volume_id, cid));
        let result = self.attach_inner(cid, volume_id).await;
        log.finish(result)
    }

    async fn attach_inner(&self, cid: i64, volume_id: i64) -> Result<String> {
        let (instance, volume) = self.load(cid, volume_id).await?;
        let shell = self.shell(&instance);

        let multipath = shell.has_multipath().await?;
        let before = shell.device_names(multipath).await?;
        if before.len() > MAX_ATTACHED_DEVICES {
            return Err(CpiError::ProviderRejected(format!(
                "too many persistent disks attached to vm {} ({} devices: {})",
                cid,
                before.len(),
                before.join(", ")
            ))
            .into());
        }

        if volume.allowed_hosts.contains(&cid) {
            tracing::debug!(cid, volume_id, "host already authorized");
        } else {
            let provider = &self.provider;
            change_access(
                self.settings.timeouts.volume_authorize,
                &format!("vm {} authorized on volume {}", cid, volume_id),
                || provider.authorize_host(cid, volume_id),
            )
            .await?;
            tracing::info!(cid, volume_id, "host authorized");
        }

        let host = self
            .provider
            .allowed_host(cid)
            .await
            .map_err(|e| into_cpi(e, &format!("iscsi host credential of vm {}", cid)))?;

        shell.run(iscsi::BACKUP_CONF).await?;
        if let Some(name) = &host.name {
            shell.run(&iscsi::write_initiator_name(name)).await?;
        }
        shell.write_iscsid_conf(&host.credential).await?;
        shell.run(iscsi::RESTART).await?;
        shell.discover_and_login(&volume.backend_ip).await?;

        let shell_ref = &shell;
        let before_ref = &before;
        let name = Poller::from(self.settings.timeouts.device_appear)
            .poll(&format!("new block device for volume {} on vm {}", volume_id, cid), || async move {
                let now = shell_ref.device_names(multipath).await?;
                Ok(match devices::detect_new_device(before_ref, &now) {
                    DeviceProbe::Found(name) => Some(name),
                    DeviceProbe::None => None,
                    DeviceProbe::Ambiguous(names) => {
                        tracing::warn!(cid, volume_id, ?names, "more than one new device");
                        None
                    }
                })
            })
            .await?;
        let path = device_path(&name, multipath);
        tracing::info!(cid, volume_id, %path, "volume attached");

        let env = self
            .agent_env_store
            .fetch(&instance)
            .await
            .with_context(|| format!("fetching agent settings of vm {}", cid))?
            .attach_persistent_disk(&volume_id.to_string(), &path);
        self.agent_env_store
            .update(&instance, &env)
            .await
            .with_context(|| format!("updating agent settings of vm {}", cid))?;
        Ok(path)
    }

    pub async fn detach_disk(&self, cid: i64, volume_id: i64) -> Result<()> {
        let log = ActionLog::start("DETACH_DISK", format!("{} <- vm {}", volume_id, cid));
        let result = self.detach_inner(cid, volume_id).await;
        log.finish(result)
    }

    async fn detach_inner(&self, cid: i64, volume_id: i64) -> Result<()> {
        let (instance, _volume) = self.load(cid, volume_id).await?;
        let shell = self.shell(&instance);
        let mount_point = self.settings.persistent_mount.as_str();

        let multipath = shell.has_multipath().await?;

        let mounts = devices::parse_mounts(&shell.run(iscsi::LIST_MOUNTS).await?)?;
        if mounts.iter().any(|m| m.mount_point == mount_point) {
            shell.run(&iscsi::lazy_unmount(mount_point)).await?;
        }

        // Resets every iSCSI session on the instance, not only this volume's.
        shell.run(iscsi::STOP).await?;
        shell.run(iscsi::CLEAR_SEND_TARGETS).await?;
        shell.run(iscsi::CLEAR_NODES).await?;
        shell.run(iscsi::START).await?;
        if multipath {
            shell.run(iscsi::RESTART_MULTIPATH).await?;
        }

        let provider = &self.provider;
        change_access(
            self.settings.timeouts.volume_deauthorize,
            &format!("vm {} deauthorized from volume {}", cid, volume_id),
            || provider.deauthorize_host(cid, volume_id),
        )
        .await?;
        tracing::info!(cid, volume_id, "host deauthorized");

        let env = self
            .agent_env_store
            .fetch(&instance)
            .await
            .with_context(|| format!("fetching agent settings of vm {}", cid))?
            .detach_persistent_disk(&volume_id.to_string());
        self.agent_env_store
            .update(&instance, &env)
            .await
            .with_context(|| format!("updating agent settings of vm {}", cid))?;

        if env.disks.persistent.len() == 1 {
            if let Some((remaining_id, remaining_path)) = env.disks.persistent.iter().next() {
                let remaining_id: i64 = remaining_id
                    .parse()
                    .with_context(|| format!("persistent disk id '{}' is not numeric", remaining_id))?;
                let remaining = self
                    .provider
                    .get_volume(remaining_id)
                    .await
                    .map_err(|e| into_cpi(e, &format!("volume {}", remaining_id)))?;
                shell.discover_and_login(&remaining.backend_ip).await?;
                shell
                    .run(&iscsi::remount(remaining_path, multipath, mount_point))
                    .await?;
                tracing::info!(cid, volume_id = remaining_id, "remaining volume remounted");
            }
        }
        Ok(())
    }
}
