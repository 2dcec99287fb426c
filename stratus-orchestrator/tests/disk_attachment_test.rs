use std::sync::Arc;
use std::time::Duration;
use stratus_common::{error_kind, AgentEnv, ComputeInstance, Credential, ErrorKind, Volume};
use stratus_orchestrator::disks::DiskManager;
use stratus_orchestrator::settings::{Settings, Timeouts};
use stratus_providers::mock::{MockAgentEnvStore, MockCall, MockProvider, MockRemote};
use stratus_providers::ApiError;

const PARTITIONS_BEFORE: &str = "major minor  #blocks  name\n\n\
 202        0   26214400 xvda\n\
 202        1     262144 xvda1\n\
   8        0   20971520 sda\n";

const PARTITIONS_AFTER: &str = "major minor  #blocks  name\n\n\
 202        0   26214400 xvda\n\
 202        1     262144 xvda1\n\
   8        0   20971520 sda\n\
   8       16   20971520 sdb\n";

struct Fixture {
    provider: Arc<MockProvider>,
    remote: Arc<MockRemote>,
    envs: Arc<MockAgentEnvStore>,
    disks: DiskManager,
}

fn instance() -> ComputeInstance {
    ComputeInstance {
        id: 501,
        datacenter_id: 1,
        primary_ip: Some("169.50.2.1".into()),
        primary_backend_ip: "10.0.2.1".into(),
        fqdn: "bosh-1.example.com".into(),
        cpu: 1,
        memory_mb: 1024,
        private_vlan_id: 10,
        public_vlan_id: 20,
        root: Credential {
            username: "root".into(),
            password: "root-pw".into(),
        },
    }
}

fn volume(id: i64, portal: &str, allowed: Vec<i64>) -> Volume {
    Volume {
        id,
        capacity_gb: 20,
        iops: None,
        backend_ip: portal.into(),
        credential: Credential {
            username: format!("SL01SEL{}", id),
            password: "vol-pw".into(),
        },
        allowed_hosts: allowed,
    }
}

fn fixture() -> Fixture {
    let provider = Arc::new(MockProvider::new());
    provider.seed_instance(instance());
    let remote = Arc::new(MockRemote::new());
    let envs = Arc::new(MockAgentEnvStore::new());
    envs.put(
        501,
        AgentEnv {
            agent_id: "agent-1".into(),
            ..Default::default()
        },
    );
    let settings = Arc::new(Settings {
        timeouts: Timeouts::uniform(Duration::from_secs(60), Duration::from_secs(1)),
        ..Default::default()
    });
    let disks = DiskManager::new(provider.clone(), remote.clone(), envs.clone(), settings);
    Fixture {
        provider,
        remote,
        envs,
        disks,
    }
}

#[tokio::test(start_paused = true)]
async fn attach_without_multipath_records_scsi_device() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![]));
    f.remote.on("command -v multipath", "\n");
    f.remote
        .on_sequence("cat /proc/partitions", &[PARTITIONS_BEFORE, PARTITIONS_BEFORE, PARTITIONS_AFTER]);

    let path = f.disks.attach_disk(501, 9001).await.unwrap();
    assert_eq!(path, "/dev/sdb");

    let env = f.envs.get(501).unwrap();
    assert_eq!(env.disks.persistent["9001"], "/dev/sdb");
    assert!(f.provider.volume(9001).unwrap().allowed_hosts.contains(&501));

    let order = [
        "cp /etc/iscsi/iscsid.conf /etc/iscsi/iscsid.conf.save",
        "InitiatorName=iqn.2005-05.com.softlayer:sl01su501",
        "/etc/init.d/open-iscsi restart",
        "iscsiadm -m discovery -t sendtargets -p 10.2.0.10",
        "iscsiadm -m node -l",
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|c| f.remote.position(c).unwrap_or_else(|| panic!("missing `{}`", c)))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", positions);

    let uploads = f.remote.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "/etc/iscsi/iscsid.conf");
    assert!(uploads[0].1.contains("node.session.auth.username = SL01SU501-V501"));
}

#[tokio::test(start_paused = true)]
async fn attach_with_multipath_uses_mapper_path() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![]));
    f.remote.on("command -v multipath", "/sbin/multipath\n");
    f.remote.on_sequence(
        "dmsetup ls",
        &[
            "No devices found\n",
            "3600a09803830304f3124457a45757067\t(252:0)\n3600a09803830304f3124457a45757067-part1\t(252:1)\n",
        ],
    );

    let path = f.disks.attach_disk(501, 9001).await.unwrap();
    assert_eq!(path, "/dev/mapper/3600a09803830304f3124457a45757067");
    assert!(!f.remote.ran("cat /proc/partitions"));
}

#[tokio::test(start_paused = true)]
async fn busy_volume_authorization_is_retried() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![]));
    f.provider.set_authorize_busy(2);
    f.remote.on("command -v multipath", "");
    f.remote
        .on_sequence("cat /proc/partitions", &[PARTITIONS_BEFORE, PARTITIONS_AFTER]);

    f.disks.attach_disk(501, 9001).await.unwrap();
    assert_eq!(
        f.provider
            .count(|c| matches!(c, MockCall::AuthorizeHost { .. })),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn unavailable_storage_api_is_retried_until_authorized() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![]));
    f.provider.push_authorize_error(ApiError::new(
        503,
        "SoftLayer_Exception_Public",
        "Service Unavailable",
    ));
    f.remote.on("command -v multipath", "");
    f.remote
        .on_sequence("cat /proc/partitions", &[PARTITIONS_BEFORE, PARTITIONS_AFTER]);

    let path = f.disks.attach_disk(501, 9001).await.unwrap();
    assert_eq!(path, "/dev/sdb");
    assert_eq!(
        f.provider
            .count(|c| matches!(c, MockCall::AuthorizeHost { .. })),
        2
    );
    assert!(f.provider.volume(9001).unwrap().allowed_hosts.contains(&501));
}

#[tokio::test(start_paused = true)]
async fn rejected_authorization_aborts_before_iscsi_setup() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![]));
    f.provider.push_authorize_error(ApiError::new(
        400,
        "SoftLayer_Exception_Public",
        "Host is not in the same datacenter as the volume",
    ));
    f.remote.on("command -v multipath", "");
    f.remote.on("cat /proc/partitions", PARTITIONS_BEFORE);

    let err = f.disks.attach_disk(501, 9001).await.unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::ProviderRejected));
    assert_eq!(
        f.provider
            .count(|c| matches!(c, MockCall::AuthorizeHost { .. })),
        1
    );
    assert!(!f.remote.ran("iscsid.conf"));
    assert!(f.remote.uploads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn attach_refused_when_instance_already_carries_too_many_disks() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![]));
    f.remote.on("command -v multipath", "");
    let crowded = format!("{}   8       32   20971520 sdc\n", PARTITIONS_AFTER);
    f.remote.on("cat /proc/partitions", &crowded);

    let err = f.disks.attach_disk(501, 9001).await.unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::ProviderRejected));
    assert!(err.to_string().contains("too many persistent disks"));
    assert_eq!(
        f.provider
            .count(|c| matches!(c, MockCall::AuthorizeHost { .. })),
        0
    );
    assert!(!f.remote.ran("iscsiadm"));
}

#[tokio::test(start_paused = true)]
async fn no_new_device_times_out_without_touching_settings() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![]));
    f.remote.on("command -v multipath", "");
    f.remote.on("cat /proc/partitions", PARTITIONS_BEFORE);

    let err = f.disks.attach_disk(501, 9001).await.unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Timeout));
    assert!(f.envs.get(501).unwrap().disks.persistent.is_empty());
}

#[tokio::test(start_paused = true)]
async fn two_new_devices_against_populated_baseline_time_out() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![]));
    f.remote.on("command -v multipath", "");
    let two_new = format!("{}   8       32   20971520 sdc\n", PARTITIONS_AFTER);
    f.remote
        .on_sequence("cat /proc/partitions", &[PARTITIONS_BEFORE, two_new.as_str()]);

    let err = f.disks.attach_disk(501, 9001).await.unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::Timeout));
}

#[tokio::test(start_paused = true)]
async fn failing_remote_command_aborts_attach() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![]));
    f.remote.on("command -v multipath", "");
    f.remote.on("cat /proc/partitions", PARTITIONS_BEFORE);
    f.remote.fail_on("open-iscsi restart", "exit status 1");

    let err = f.disks.attach_disk(501, 9001).await.unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::RemoteExecution));
    assert!(!f.remote.ran("iscsiadm"));
}

#[tokio::test(start_paused = true)]
async fn unparseable_device_listing_is_typed_error() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![]));
    f.remote.on("command -v multipath", "");
    f.remote.on("cat /proc/partitions", "cat: /proc/partitions: No such file\n");

    let err = f.disks.attach_disk(501, 9001).await.unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::DeviceList));
}

#[tokio::test(start_paused = true)]
async fn detach_resets_iscsi_and_remounts_the_remaining_disk() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![501]));
    f.provider.seed_volume(volume(9002, "10.2.0.11", vec![501]));
    f.envs.put(
        501,
        AgentEnv::default()
            .attach_persistent_disk("9001", "/dev/sdb")
            .attach_persistent_disk("9002", "/dev/sdc"),
    );
    f.remote.on("command -v multipath", "");
    f.remote.on(
        "mount",
        "/dev/xvda2 on / type ext4 (rw)\n/dev/sdb1 on /var/vcap/store type ext4 (rw)\n",
    );

    f.disks.detach_disk(501, 9001).await.unwrap();

    let env = f.envs.get(501).unwrap();
    assert_eq!(env.disks.persistent.len(), 1);
    assert_eq!(env.disks.persistent["9002"], "/dev/sdc");
    assert!(!f.provider.volume(9001).unwrap().allowed_hosts.contains(&501));

    let order = [
        "umount -l /var/vcap/store",
        "/etc/init.d/open-iscsi stop",
        "rm -rf /etc/iscsi/send_targets",
        "rm -rf /etc/iscsi/nodes",
        "/etc/init.d/open-iscsi start",
        "iscsiadm -m discovery -t sendtargets -p 10.2.0.11",
        "sleep 5; mount /dev/sdc1 /var/vcap/store",
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|c| f.remote.position(c).unwrap_or_else(|| panic!("missing `{}`", c)))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", positions);
    assert!(!f.remote.ran("multipath-tools"));
}

#[tokio::test(start_paused = true)]
async fn detach_last_disk_under_multipath_restarts_daemon_without_remount() {
    let f = fixture();
    f.provider.seed_volume(volume(9001, "10.2.0.10", vec![501]));
    f.envs.put(
        501,
        AgentEnv::default().attach_persistent_disk("9001", "/dev/mapper/3600a0"),
    );
    f.remote.on("command -v multipath", "/sbin/multipath");
    f.remote.on("mount", "/dev/xvda2 on / type ext4 (rw)\n");

    f.disks.detach_disk(501, 9001).await.unwrap();

    assert!(f.remote.ran("service multipath-tools restart"));
    assert!(!f.remote.ran("umount"));
    assert!(!f.remote.ran("iscsiadm"));
    assert!(f.envs.get(501).unwrap().disks.persistent.is_empty());
}

#[tokio::test(start_paused = true)]
async fn disk_lifecycle_orders_waits_and_cancels() {
    let f = fixture();
    f.provider.set_volume_visible_after(2);

    let volume = f.disks.create_disk(30 * 1024, "dal10", Some(1000)).await.unwrap();
    assert_eq!(volume.capacity_gb, 40);
    assert_eq!(
        f.provider
            .count(|c| matches!(c, MockCall::FindVolumeByOrder(_))),
        3
    );

    f.disks.delete_disk(volume.id).await.unwrap();
    assert!(f.provider.volume(volume.id).is_none());
    let err = f.disks.delete_disk(volume.id).await.unwrap_err();
    assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));
}
