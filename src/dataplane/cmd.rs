//! Dataplane clients backed by iproute2 and wg(8).
//!
//! Avoids a hard dependency on raw netlink sockets: `ip -j` gives structured
//! JSON for links, addresses, rules, and routes, and `wg show <if> dump`
//! gives a machine-readable device snapshot. Requires `CAP_NET_ADMIN`.

use super::{
    DataplaneError, Device, DeviceUpdate, Link, NetlinkClient, NetlinkFactory, Peer, Route,
    RouteKind, RouteScope, Rule, WireguardClient, WireguardFactory,
};
use crate::key::Key;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::trace;

async fn run(program: &str, args: &[&str]) -> Result<String, DataplaneError> {
    trace!(program, ?args, "exec");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(DataplaneError::Io)?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.to_ascii_lowercase().contains("operation not supported") {
        return Err(DataplaneError::NotSupported);
    }
    Err(DataplaneError::Failed(format!(
        "{program} {}: {stderr}",
        args.join(" ")
    )))
}

/// Netlink-shaped client driving the `ip` binary.
pub struct CommandNetlinkClient {
    /// ifindex -> ifname, filled on demand for route programming.
    link_names: Mutex<HashMap<u32, String>>,
}

impl CommandNetlinkClient {
    pub fn new() -> Self {
        Self {
            link_names: Mutex::new(HashMap::new()),
        }
    }

    /// Factory for [`crate::reconciler::Wireguard::new`].
    pub fn factory() -> NetlinkFactory {
        Box::new(|| Ok(Arc::new(CommandNetlinkClient::new()) as Arc<dyn NetlinkClient>))
    }

    async fn refresh_link_names(&self) -> Result<(), DataplaneError> {
        let out = run("ip", &["-j", "link", "show"]).await?;
        let mut names = self.link_names.lock().expect("link name cache poisoned");
        names.clear();
        for (index, name) in parse_link_list(&out)? {
            names.insert(index, name);
        }
        Ok(())
    }

    async fn name_for_index(&self, index: u32) -> Result<String, DataplaneError> {
        {
            let names = self.link_names.lock().expect("link name cache poisoned");
            if let Some(name) = names.get(&index) {
                return Ok(name.clone());
            }
        }
        self.refresh_link_names().await?;
        self.link_names
            .lock()
            .expect("link name cache poisoned")
            .get(&index)
            .cloned()
            .ok_or_else(|| DataplaneError::Failed(format!("no link with index {index}")))
    }

    async fn index_for_name(&self, name: &str) -> Result<Option<u32>, DataplaneError> {
        self.refresh_link_names().await?;
        let names = self.link_names.lock().expect("link name cache poisoned");
        Ok(names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(i, _)| *i))
    }

    fn rule_args(rule: &Rule) -> Vec<String> {
        let mut args = Vec::new();
        args.push("priority".to_string());
        args.push(rule.priority.to_string());
        if rule.invert {
            args.push("not".to_string());
        }
        args.push("fwmark".to_string());
        args.push(format!("{:#x}", rule.fwmark));
        args.push("table".to_string());
        args.push(rule.table.to_string());
        args
    }
}

impl Default for CommandNetlinkClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetlinkClient for CommandNetlinkClient {
    async fn link_by_name(&self, name: &str) -> Result<Option<Link>, DataplaneError> {
        match run("ip", &["-d", "-j", "link", "show", "dev", name]).await {
            Ok(out) => parse_link(&out),
            Err(DataplaneError::Failed(msg)) if msg.contains("does not exist") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn link_add_wireguard(&self, name: &str, mtu: u32) -> Result<Link, DataplaneError> {
        let mtu_str = mtu.to_string();
        run(
            "ip",
            &["link", "add", name, "mtu", &mtu_str, "type", "wireguard"],
        )
        .await?;
        match self.link_by_name(name).await? {
            Some(link) => Ok(link),
            None => Err(DataplaneError::Failed(format!(
                "link {name} missing right after creation"
            ))),
        }
    }

    async fn link_del(&self, name: &str) -> Result<(), DataplaneError> {
        run("ip", &["link", "del", "dev", name]).await.map(|_| ())
    }

    async fn link_set_up(&self, name: &str) -> Result<(), DataplaneError> {
        run("ip", &["link", "set", "dev", name, "up"])
            .await
            .map(|_| ())
    }

    async fn link_set_mtu(&self, name: &str, mtu: u32) -> Result<(), DataplaneError> {
        let mtu_str = mtu.to_string();
        run("ip", &["link", "set", "dev", name, "mtu", &mtu_str])
            .await
            .map(|_| ())
    }

    async fn addr_list(&self, link: &str) -> Result<Vec<Ipv4Addr>, DataplaneError> {
        let out = run("ip", &["-j", "-4", "addr", "show", "dev", link]).await?;
        parse_addrs(&out)
    }

    async fn addr_add(&self, link: &str, addr: Ipv4Addr) -> Result<(), DataplaneError> {
        let addr_str = format!("{addr}/32");
        run("ip", &["-4", "addr", "add", &addr_str, "dev", link])
            .await
            .map(|_| ())
    }

    async fn addr_del(&self, link: &str, addr: Ipv4Addr) -> Result<(), DataplaneError> {
        let addr_str = format!("{addr}/32");
        run("ip", &["-4", "addr", "del", &addr_str, "dev", link])
            .await
            .map(|_| ())
    }

    async fn rule_list(&self) -> Result<Vec<Rule>, DataplaneError> {
        let out = run("ip", &["-j", "-4", "rule", "show"]).await?;
        parse_rules(&out)
    }

    async fn rule_add(&self, rule: &Rule) -> Result<(), DataplaneError> {
        let mut args = vec!["-4".to_string(), "rule".to_string(), "add".to_string()];
        args.extend(Self::rule_args(rule));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run("ip", &args).await.map(|_| ())
    }

    async fn rule_del(&self, rule: &Rule) -> Result<(), DataplaneError> {
        let mut args = vec!["-4".to_string(), "rule".to_string(), "del".to_string()];
        args.extend(Self::rule_args(rule));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run("ip", &args).await.map(|_| ())
    }

    async fn route_list(&self, table: u32) -> Result<Vec<Route>, DataplaneError> {
        let table_str = table.to_string();
        let out = run("ip", &["-j", "-4", "route", "show", "table", &table_str]).await?;
        let mut routes = Vec::new();
        for parsed in parse_routes(&out)? {
            let link_index = match parsed.dev {
                Some(dev) => self.index_for_name(&dev).await?,
                None => None,
            };
            routes.push(Route {
                dst: parsed.dst,
                table,
                protocol: parsed.protocol,
                kind: parsed.kind,
                scope: parsed.scope,
                link_index,
            });
        }
        Ok(routes)
    }

    async fn route_add(&self, route: &Route) -> Result<(), DataplaneError> {
        let dst = route.dst.to_string();
        let table = route.table.to_string();
        let proto = route.protocol.to_string();
        let mut args = vec!["-4", "route", "replace"];
        let dev;
        match route.kind {
            RouteKind::Throw => args.extend(["throw", dst.as_str()]),
            RouteKind::Unicast => {
                let index = route.link_index.ok_or_else(|| {
                    DataplaneError::Failed(format!("unicast route {dst} has no device"))
                })?;
                dev = self.name_for_index(index).await?;
                args.extend([dst.as_str(), "dev", dev.as_str()]);
                if route.scope == RouteScope::Link {
                    args.extend(["scope", "link"]);
                }
            }
        }
        args.extend(["table", table.as_str(), "proto", proto.as_str()]);
        run("ip", &args).await.map(|_| ())
    }

    async fn route_del(&self, route: &Route) -> Result<(), DataplaneError> {
        let dst = route.dst.to_string();
        let table = route.table.to_string();
        let mut args = vec!["-4", "route", "del"];
        if route.kind == RouteKind::Throw {
            args.push("throw");
        }
        args.extend([dst.as_str(), "table", table.as_str()]);
        run("ip", &args).await.map(|_| ())
    }
}

/// WireGuard configuration client driving the `wg` binary.
pub struct CommandWireguardClient;

impl CommandWireguardClient {
    /// Factory for [`crate::reconciler::Wireguard::new`]. A missing `wg`
    /// binary is reported as the terminal `NotSupported` verdict.
    pub fn factory() -> WireguardFactory {
        Box::new(|| {
            match std::process::Command::new("wg").arg("--version").output() {
                Ok(out) if out.status.success() => {}
                Ok(out) => {
                    return Err(DataplaneError::Failed(format!(
                        "wg --version: {}",
                        String::from_utf8_lossy(&out.stderr).trim()
                    )));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(DataplaneError::NotSupported);
                }
                Err(e) => return Err(DataplaneError::Io(e)),
            }
            Ok(Arc::new(CommandWireguardClient) as Arc<dyn WireguardClient>)
        })
    }
}

#[async_trait]
impl WireguardClient for CommandWireguardClient {
    async fn device(&self, name: &str) -> Result<Device, DataplaneError> {
        let out = run("wg", &["show", name, "dump"]).await?;
        parse_device_dump(&out)
    }

    async fn configure_device(
        &self,
        name: &str,
        update: DeviceUpdate,
    ) -> Result<(), DataplaneError> {
        // Private keys only travel via file, never argv.
        let mut key_file = None;
        if let Some(private_key) = update.private_key {
            let mut file = tempfile::NamedTempFile::new().map_err(DataplaneError::Io)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
                    .map_err(DataplaneError::Io)?;
            }
            writeln!(file, "{private_key}").map_err(DataplaneError::Io)?;
            key_file = Some(file);
        }

        if key_file.is_some() || update.listen_port.is_some() || update.fwmark.is_some() {
            let mut args: Vec<String> = vec!["set".to_string(), name.to_string()];
            if let Some(file) = &key_file {
                args.push("private-key".to_string());
                args.push(file.path().to_string_lossy().into_owned());
            }
            if let Some(port) = update.listen_port {
                args.push("listen-port".to_string());
                args.push(port.to_string());
            }
            if let Some(fwmark) = update.fwmark {
                args.push("fwmark".to_string());
                args.push(if fwmark == 0 {
                    "off".to_string()
                } else {
                    format!("{fwmark:#x}")
                });
            }
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            run("wg", &args).await?;
        }

        for peer in &update.peers {
            let key = peer.public_key.to_string();
            if peer.remove {
                run("wg", &["set", name, "peer", &key, "remove"]).await?;
                continue;
            }
            let mut args: Vec<String> = vec![
                "set".to_string(),
                name.to_string(),
                "peer".to_string(),
                key,
            ];
            if let Some(endpoint) = peer.endpoint {
                args.push("endpoint".to_string());
                args.push(endpoint.to_string());
            }
            // `wg set ... allowed-ips` replaces the set natively.
            args.push("allowed-ips".to_string());
            args.push(
                peer.allowed_ips
                    .iter()
                    .map(|net| net.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            run("wg", &args).await?;
        }

        Ok(())
    }
}

fn json_array(s: &str) -> Result<Vec<Value>, DataplaneError> {
    let value: Value = serde_json::from_str(s.trim())
        .map_err(|e| DataplaneError::Failed(format!("unparseable ip output: {e}")))?;
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(DataplaneError::Failed(
            "unexpected ip output: not a JSON array".to_string(),
        )),
    }
}

fn parse_link(s: &str) -> Result<Option<Link>, DataplaneError> {
    let items = json_array(s)?;
    let Some(item) = items.first() else {
        return Ok(None);
    };
    let index = item["ifindex"].as_u64().unwrap_or(0) as u32;
    let name = item["ifname"].as_str().unwrap_or_default().to_string();
    let mtu = item["mtu"].as_u64().unwrap_or(0) as u32;
    let admin_up = item["flags"]
        .as_array()
        .map(|flags| flags.iter().any(|f| f.as_str() == Some("UP")))
        .unwrap_or(false);
    // WireGuard devices report UNKNOWN once up; there is no carrier concept.
    let operstate = item["operstate"].as_str().unwrap_or("DOWN");
    let oper_up = admin_up && matches!(operstate, "UP" | "UNKNOWN");
    let kind = item["linkinfo"]["info_kind"]
        .as_str()
        .map(|k| k.to_string());
    Ok(Some(Link {
        index,
        name,
        kind,
        mtu,
        admin_up,
        oper_up,
    }))
}

fn parse_link_list(s: &str) -> Result<Vec<(u32, String)>, DataplaneError> {
    let mut links = Vec::new();
    for item in json_array(s)? {
        let index = item["ifindex"].as_u64().unwrap_or(0) as u32;
        if let Some(name) = item["ifname"].as_str() {
            links.push((index, name.to_string()));
        }
    }
    Ok(links)
}

fn parse_addrs(s: &str) -> Result<Vec<Ipv4Addr>, DataplaneError> {
    let mut addrs = Vec::new();
    for item in json_array(s)? {
        let Some(infos) = item["addr_info"].as_array() else {
            continue;
        };
        for info in infos {
            if let Some(local) = info["local"].as_str()
                && let Ok(addr) = local.parse::<Ipv4Addr>()
            {
                addrs.push(addr);
            }
        }
    }
    Ok(addrs)
}

fn parse_table(name: &str) -> u32 {
    match name {
        "local" => 255,
        "main" => 254,
        "default" => 253,
        other => other.parse().unwrap_or(0),
    }
}

fn parse_fwmark(raw: &str) -> u32 {
    // "0xa" or "0xa/0xff".
    let mark = raw.split('/').next().unwrap_or(raw);
    if let Some(hex) = mark.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        mark.parse().unwrap_or(0)
    }
}

fn parse_rules(s: &str) -> Result<Vec<Rule>, DataplaneError> {
    let mut rules = Vec::new();
    for item in json_array(s)? {
        let Some(obj) = item.as_object() else {
            continue;
        };
        rules.push(Rule {
            priority: obj
                .get("priority")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            table: obj
                .get("table")
                .and_then(Value::as_str)
                .map(parse_table)
                .unwrap_or(0),
            fwmark: obj
                .get("fwmark")
                .and_then(Value::as_str)
                .map(parse_fwmark)
                .unwrap_or(0),
            // iproute2 emits "not" as a null-valued marker key.
            invert: obj.contains_key("not"),
        });
    }
    Ok(rules)
}

fn parse_protocol(name: &str) -> u8 {
    match name {
        "kernel" => 2,
        "boot" => 3,
        "static" => 4,
        other => other.parse().unwrap_or(0),
    }
}

struct ParsedRoute {
    dst: Ipv4Net,
    kind: RouteKind,
    scope: RouteScope,
    protocol: u8,
    dev: Option<String>,
}

fn parse_routes(s: &str) -> Result<Vec<ParsedRoute>, DataplaneError> {
    let mut routes = Vec::new();
    for item in json_array(s)? {
        let dst = match item["dst"].as_str() {
            Some("default") => "0.0.0.0/0".parse().ok(),
            Some(dst) if dst.contains('/') => dst.parse().ok(),
            Some(dst) => dst
                .parse::<Ipv4Addr>()
                .ok()
                .and_then(|addr| Ipv4Net::new(addr, 32).ok()),
            None => None,
        };
        let Some(dst) = dst else { continue };
        let kind = match item["type"].as_str() {
            Some("throw") => RouteKind::Throw,
            Some("unicast") | None => RouteKind::Unicast,
            Some(_) => continue,
        };
        let scope = match item["scope"].as_str() {
            Some("link") => RouteScope::Link,
            _ => RouteScope::Universe,
        };
        let protocol = item["protocol"]
            .as_str()
            .map(parse_protocol)
            .unwrap_or(3);
        let dev = item["dev"].as_str().map(|d| d.to_string());
        routes.push(ParsedRoute {
            dst,
            kind,
            scope,
            protocol,
            dev,
        });
    }
    Ok(routes)
}

/// Parses `wg show <if> dump` output: one device line, then one line per
/// peer, tab separated.
fn parse_device_dump(s: &str) -> Result<Device, DataplaneError> {
    let mut lines = s.lines().filter(|l| !l.trim().is_empty());
    let Some(head) = lines.next() else {
        return Ok(Device::default());
    };

    let parse_key = |raw: &str| -> Key {
        if raw == "(none)" {
            Key::ZERO
        } else {
            raw.parse().unwrap_or(Key::ZERO)
        }
    };

    let fields: Vec<&str> = head.split('\t').collect();
    if fields.len() < 4 {
        return Err(DataplaneError::Failed(format!(
            "malformed wg dump device line: {head:?}"
        )));
    }
    let private_key = parse_key(fields[0]);
    let public_key = parse_key(fields[1]);
    let listen_port = fields[2].parse().unwrap_or(0);
    let fwmark = if fields[3] == "off" {
        0
    } else {
        parse_fwmark(fields[3])
    };

    let mut peers = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 4 {
            return Err(DataplaneError::Failed(format!(
                "malformed wg dump peer line: {line:?}"
            )));
        }
        let endpoint = match fields[2] {
            "(none)" => None,
            raw => raw.parse::<SocketAddrV4>().ok(),
        };
        let allowed_ips = match fields[3] {
            "(none)" => Vec::new(),
            raw => raw
                .split(',')
                .filter_map(|net| net.trim().parse().ok())
                .collect(),
        };
        peers.push(Peer {
            public_key: parse_key(fields[0]),
            endpoint,
            allowed_ips,
        });
    }

    Ok(Device {
        private_key,
        public_key,
        listen_port,
        fwmark,
        peers,
    })
}
