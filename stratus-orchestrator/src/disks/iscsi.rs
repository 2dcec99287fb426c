use stratus_common::Credential;

pub const ISCSID_CONF: &str = "/etc/iscsi/iscsid.conf";
pub const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

pub const MULTIPATH_PROBE: &str = "echo `command -v multipath`";
pub const LIST_MULTIPATH_DEVICES: &str = "dmsetup ls";
pub const LIST_PARTITIONS: &str = "cat /proc/partitions";
pub const LIST_MOUNTS: &str = "mount";

pub const BACKUP_CONF: &str = "cp /etc/iscsi/iscsid.conf /etc/iscsi/iscsid.conf.save";
pub const RESTART: &str = "/etc/init.d/open-iscsi restart";
pub const STOP: &str = "/etc/init.d/open-iscsi stop";
pub const START: &str = "/etc/init.d/open-iscsi start";
pub const CLEAR_SEND_TARGETS: &str = "rm -rf /etc/iscsi/send_targets";
pub const CLEAR_NODES: &str = "rm -rf /etc/iscsi/nodes";
pub const RESTART_MULTIPATH: &str = "service multipath-tools restart";
pub const LOGIN: &str = "sleep 5; echo `iscsiadm -m node -l`";

/// Quotes `value` for a POSIX shell. Words made only of safe characters pass
/// through unchanged.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-:/@%+=,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

pub fn write_initiator_name(name: &str) -> String {
    format!(
        "echo {} > {}",
        shell_quote(&format!("InitiatorName={}", name)),
        INITIATOR_NAME_FILE
    )
}

pub fn discover(portal: &str) -> String {
    format!("sleep 5; iscsiadm -m discovery -t sendtargets -p {}", shell_quote(portal))
}

pub fn lazy_unmount(mount_point: &str) -> String {
    format!("umount -l {}", shell_quote(mount_point))
}

/// Sets the hashed password of the `vcap` account.
pub fn set_vcap_password(hash: &str) -> String {
    format!("usermod -p {} vcap", shell_quote(hash))
}

/// First partition of a persistent disk device.
pub fn first_partition(device_path: &str, multipath: bool) -> String {
    if multipath {
        format!("{}-part1", device_path)
    } else {
        format!("{}1", device_path)
    }
}

pub fn remount(device_path: &str, multipath: bool, mount_point: &str) -> String {
    format!(
        "sleep 5; mount {} {}",
        shell_quote(&first_partition(device_path, multipath)),
        shell_quote(mount_point)
    )
}

/// `iscsid.conf` using CHAP for both the session and target discovery.
pub fn render_iscsid_conf(chap: &Credential) -> String {
    format!(
        "\
node.startup = automatic
node.session.auth.authmethod = CHAP
node.session.auth.username = {user}
node.session.auth.password = {password}
discovery.sendtargets.auth.authmethod = CHAP
discovery.sendtargets.auth.username = {user}
discovery.sendtargets.auth.password = {password}
node.session.timeo.replacement_timeout = 120
node.conn[0].timeo.login_timeout = 15
node.conn[0].timeo.logout_timeout = 15
node.conn[0].timeo.noop_out_interval = 10
node.conn[0].timeo.noop_out_timeout = 15
node.session.iscsi.InitialR2T = No
node.session.iscsi.ImmediateData = Yes
node.session.iscsi.FirstBurstLength = 262144
node.session.iscsi.MaxBurstLength = 16776192
node.conn[0].iscsi.MaxRecvDataSegmentLength = 65536
",
        user = chap.username,
        password = chap.password
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conf_carries_chap_for_session_and_discovery() {
        let conf = render_iscsid_conf(&Credential {
            username: "SL01SU501-V501".into(),
            password: "s3cret".into(),
        });
        assert!(conf.starts_with("node.startup = automatic\n"));
        assert_eq!(conf.matches("authmethod = CHAP").count(), 2);
        assert_eq!(conf.matches("username = SL01SU501-V501").count(), 2);
        assert_eq!(conf.matches("password = s3cret").count(), 2);
    }

    #[test]
    fn remount_uses_first_partition() {
        assert_eq!(
            remount("/dev/mapper/3600a0", true, "/var/vcap/store"),
            "sleep 5; mount /dev/mapper/3600a0-part1 /var/vcap/store"
        );
        assert_eq!(
            remount("/dev/sdb", false, "/var/vcap/store"),
            "sleep 5; mount /dev/sdb1 /var/vcap/store"
        );
    }

    #[test]
    fn commands() {
        assert_eq!(
            write_initiator_name("iqn.2005-05.com.softlayer:sl01su501"),
            "echo InitiatorName=iqn.2005-05.com.softlayer:sl01su501 > /etc/iscsi/initiatorname.iscsi"
        );
        assert_eq!(
            discover("10.2.0.10"),
            "sleep 5; iscsiadm -m discovery -t sendtargets -p 10.2.0.10"
        );
    }

    #[test]
    fn quoting_leaves_plain_words_alone() {
        assert_eq!(shell_quote("10.2.0.10"), "10.2.0.10");
        assert_eq!(shell_quote("/var/vcap/store"), "/var/vcap/store");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$6$salt$hash"), "'$6$salt$hash'");
    }

    #[test]
    fn embedded_single_quotes_stay_inside_one_word() {
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
        assert_eq!(
            set_vcap_password("$6$x'; reboot; echo '"),
            r"usermod -p '$6$x'\''; reboot; echo '\''' vcap"
        );
        assert_eq!(
            write_initiator_name("iqn.x'y"),
            r"echo 'InitiatorName=iqn.x'\''y' > /etc/iscsi/initiatorname.iscsi"
        );
        assert_eq!(
            discover("10.2.0.10; reboot"),
            "sleep 5; iscsiadm -m discovery -t sendtargets -p '10.2.0.10; reboot'"
        );
    }
}
