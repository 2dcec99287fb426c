use crate::settings::CreatorKind;
use std::net::IpAddr;
use stratus_common::{CpiError, NetworkSpec, NetworkType, ProvisioningRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    FreshCreate,
    ReuseByReload { ip: IpAddr },
    /// Delegate to the pool allocator, which creates or reloads itself.
    Pool,
}

/// The single dynamic network of a request. Every other network must be
/// manual; a vip network is never accepted.
pub fn dynamic_network(networks: &[NetworkSpec]) -> Result<&NetworkSpec, CpiError> {
    if let Some(vip) = networks.iter().find(|n| n.kind == NetworkType::Vip) {
        return Err(CpiError::InvalidNetworks(format!(
            "network '{}' has type vip, which is not supported",
            vip.name
        )));
    }
    let mut dynamic = networks.iter().filter(|n| n.kind == NetworkType::Dynamic);
    let first = dynamic.next().ok_or_else(|| {
        CpiError::InvalidNetworks("exactly one dynamic network is required, found none".into())
    })?;
    if dynamic.next().is_some() {
        let count = networks
            .iter()
            .filter(|n| n.kind == NetworkType::Dynamic)
            .count();
        return Err(CpiError::InvalidNetworks(format!(
            "exactly one dynamic network is required, found {}",
            count
        )));
    }
    Ok(first)
}

pub fn select_strategy(
    request: &ProvisioningRequest,
    creator: CreatorKind,
    disable_os_reload: bool,
) -> Result<Strategy, CpiError> {
    let dynamic = dynamic_network(&request.networks)?;
    let reuse_disabled = disable_os_reload || request.profile.disable_os_reload;

    let strategy = match (creator, dynamic.ip) {
        (CreatorKind::Pool, None) => Strategy::Pool,
        (_, Some(ip)) if !reuse_disabled => Strategy::ReuseByReload { ip },
        _ => Strategy::FreshCreate,
    };
    tracing::debug!(agent_id = %request.agent_id, ?strategy, network = %dynamic.name, "strategy selected");
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::{ErrorKind, NetworkCloudProperties, ResourceProfile, StemcellRef};

    fn net(name: &str, kind: NetworkType, ip: Option<&str>) -> NetworkSpec {
        NetworkSpec {
            name: name.into(),
            kind,
            ip: ip.map(|s| s.parse().unwrap()),
            netmask: None,
            gateway: None,
            dns: vec![],
            default: vec![],
            cloud_properties: NetworkCloudProperties::default(),
        }
    }

    fn request(networks: Vec<NetworkSpec>) -> ProvisioningRequest {
        ProvisioningRequest {
            agent_id: "agent-1".into(),
            stemcell: StemcellRef {
                id: 1,
                uuid: "u".into(),
            },
            profile: ResourceProfile::default(),
            networks,
            env: serde_json::Value::Null,
        }
    }

    #[test]
    fn no_address_means_fresh_create() {
        let r = request(vec![net("default", NetworkType::Dynamic, None)]);
        assert_eq!(
            select_strategy(&r, CreatorKind::VirtualGuest, false).unwrap(),
            Strategy::FreshCreate
        );
    }

    #[test]
    fn address_means_reuse_unless_disabled() {
        let mut r = request(vec![
            net("default", NetworkType::Dynamic, Some("10.0.0.5")),
            net("static", NetworkType::Manual, Some("10.0.1.5")),
        ]);
        assert_eq!(
            select_strategy(&r, CreatorKind::VirtualGuest, false).unwrap(),
            Strategy::ReuseByReload {
                ip: "10.0.0.5".parse().unwrap()
            }
        );
        assert_eq!(
            select_strategy(&r, CreatorKind::VirtualGuest, true).unwrap(),
            Strategy::FreshCreate
        );
        r.profile.disable_os_reload = true;
        assert_eq!(
            select_strategy(&r, CreatorKind::VirtualGuest, false).unwrap(),
            Strategy::FreshCreate
        );
    }

    #[test]
    fn pool_creator_only_without_preassigned_address() {
        let r = request(vec![net("default", NetworkType::Dynamic, None)]);
        assert_eq!(
            select_strategy(&r, CreatorKind::Pool, false).unwrap(),
            Strategy::Pool
        );
        let r = request(vec![net("default", NetworkType::Dynamic, Some("10.0.0.5"))]);
        assert!(matches!(
            select_strategy(&r, CreatorKind::Pool, false).unwrap(),
            Strategy::ReuseByReload { .. }
        ));
    }

    #[test]
    fn two_dynamic_networks_are_rejected() {
        let r = request(vec![
            net("a", NetworkType::Dynamic, None),
            net("b", NetworkType::Dynamic, None),
        ]);
        let err = select_strategy(&r, CreatorKind::VirtualGuest, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidNetworks);
        assert!(err.to_string().contains("found 2"));
    }

    #[test]
    fn vip_or_missing_dynamic_is_rejected() {
        let r = request(vec![
            net("a", NetworkType::Dynamic, None),
            net("v", NetworkType::Vip, Some("203.0.113.9")),
        ]);
        assert_eq!(
            select_strategy(&r, CreatorKind::VirtualGuest, false)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidNetworks
        );
        let r = request(vec![net("m", NetworkType::Manual, Some("10.0.0.2"))]);
        assert!(select_strategy(&r, CreatorKind::VirtualGuest, false).is_err());
    }
}
