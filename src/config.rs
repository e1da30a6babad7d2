//! Daemon configuration: listen endpoint, fabric wiring, slice definitions.
//!
//! Filters are given field-by-field; anything omitted stays wildcarded, so
//! an empty filter object claims all traffic.

use crate::topology::Link;
use crate::wire::{DatapathId, Match, Wildcards};
use anyhow::{bail, Context};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where physical switches connect in.
    pub listen: SocketAddr,
    #[serde(default)]
    pub slices: Vec<SliceConfig>,
    /// Inter-switch wiring, consumed by the static topology resolver.
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SliceConfig {
    /// Datapath id the slice's controller will see.
    pub dpid: u64,
    /// Controller endpoint the proxy dials out to.
    pub controller: SocketAddr,
    #[serde(default)]
    pub filter: FilterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    pub a_dpid: u64,
    pub a_port: u16,
    pub b_dpid: u64,
    pub b_port: u16,
}

impl LinkConfig {
    pub fn to_link(&self) -> Link {
        Link {
            a: (DatapathId(self.a_dpid), self.a_port),
            b: (DatapathId(self.b_dpid), self.b_port),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    pub in_port: Option<u16>,
    pub dl_src: Option<String>,
    pub dl_dst: Option<String>,
    pub dl_vlan: Option<u16>,
    pub dl_vlan_pcp: Option<u8>,
    pub dl_type: Option<u16>,
    pub nw_tos: Option<u8>,
    pub nw_proto: Option<u8>,
    /// Dotted quad, optionally with a /prefix length.
    pub nw_src: Option<String>,
    pub nw_dst: Option<String>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

impl FilterConfig {
    pub fn to_match(&self) -> anyhow::Result<Match> {
        let mut m = Match::any();
        let mut w = m.wildcards;
        if let Some(port) = self.in_port {
            w -= Wildcards::IN_PORT;
            m.in_port = port;
        }
        if let Some(ref mac) = self.dl_src {
            w -= Wildcards::DL_SRC;
            m.dl_src = parse_mac(mac)?;
        }
        if let Some(ref mac) = self.dl_dst {
            w -= Wildcards::DL_DST;
            m.dl_dst = parse_mac(mac)?;
        }
        if let Some(vlan) = self.dl_vlan {
            w -= Wildcards::DL_VLAN;
            m.dl_vlan = vlan;
        }
        if let Some(pcp) = self.dl_vlan_pcp {
            w -= Wildcards::DL_VLAN_PCP;
            m.dl_vlan_pcp = pcp;
        }
        if let Some(dl_type) = self.dl_type {
            w -= Wildcards::DL_TYPE;
            m.dl_type = dl_type;
        }
        if let Some(tos) = self.nw_tos {
            w -= Wildcards::NW_TOS;
            m.nw_tos = tos;
        }
        if let Some(proto) = self.nw_proto {
            w -= Wildcards::NW_PROTO;
            m.nw_proto = proto;
        }
        if let Some(ref cidr) = self.nw_src {
            let (addr, prefix) = parse_cidr(cidr)?;
            w = w.with_nw_src_ignored(32 - prefix);
            m.nw_src = addr;
        }
        if let Some(ref cidr) = self.nw_dst {
            let (addr, prefix) = parse_cidr(cidr)?;
            w = w.with_nw_dst_ignored(32 - prefix);
            m.nw_dst = addr;
        }
        if let Some(port) = self.tp_src {
            w -= Wildcards::TP_SRC;
            m.tp_src = port;
        }
        if let Some(port) = self.tp_dst {
            w -= Wildcards::TP_DST;
            m.tp_dst = port;
        }
        m.wildcards = w;
        Ok(m)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

fn parse_mac(text: &str) -> anyhow::Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 6 {
        bail!("malformed MAC address '{text}'");
    }
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16)
            .with_context(|| format!("malformed MAC address '{text}'"))?;
    }
    Ok(out)
}

fn parse_cidr(text: &str) -> anyhow::Result<(Ipv4Addr, u32)> {
    let (addr, prefix) = match text.split_once('/') {
        Some((addr, prefix)) => (
            addr,
            prefix
                .parse::<u32>()
                .with_context(|| format!("malformed prefix in '{text}'"))?,
        ),
        None => (text, 32),
    };
    if prefix > 32 {
        bail!("prefix length out of range in '{text}'");
    }
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("malformed address in '{text}'"))?;
    Ok((addr, prefix))
}
