use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Context};
use rustc_hash::FxHashMap;

use crate::config::WanConfig;

/// Identifier of one participating site (data center) in the WAN mesh.
pub type SiteId = u32;

/// Immutable mapping from site id to network address.
///
/// Built once at startup from the configuration and shared read-only across
///  all tasks afterwards, so no locking is needed for concurrent lookups.
#[derive(Debug)]
pub struct SiteDirectory {
    local_site_id: SiteId,
    sites: FxHashMap<SiteId, SocketAddr>,
}

impl SiteDirectory {
    pub fn new(config: &WanConfig) -> anyhow::Result<SiteDirectory> {
        if config.sites.is_empty() {
            bail!("site configuration is empty");
        }

        let mut sites = FxHashMap::default();
        for entry in &config.sites {
            let ip: IpAddr = entry.ip.parse()
                .with_context(|| format!("site {}: invalid ip address {:?}", entry.id, entry.ip))?;
            if sites.insert(entry.id, SocketAddr::new(ip, entry.port)).is_some() {
                bail!("duplicate site id {} in site configuration", entry.id);
            }
        }

        if !sites.contains_key(&config.local_site_id) {
            bail!("local site id {} has no entry in the site configuration", config.local_site_id);
        }

        Ok(SiteDirectory {
            local_site_id: config.local_site_id,
            sites,
        })
    }

    pub fn local_site_id(&self) -> SiteId {
        self.local_site_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.sites[&self.local_site_id]
    }

    /// all configured sites except the local one, in ascending site id order
    pub fn remote_sites(&self) -> Vec<(SiteId, SocketAddr)> {
        let mut result = self.sites.iter()
            .filter(|(&id, _)| id != self.local_site_id)
            .map(|(&id, &addr)| (id, addr))
            .collect::<Vec<_>>();
        result.sort_by_key(|(id, _)| *id);
        result
    }

    pub fn num_remote_sites(&self) -> usize {
        self.sites.len() - 1
    }
}
