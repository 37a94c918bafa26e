use crate::extracts::process::types::{Connection, ConnectionKind, Snapshot};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TCP_ESTABLISHED: &str = "01";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProbeResult {
    pub connections: Vec<Connection>,
    /// Socket introspection was at least partly denied
    pub restricted: bool,
}

/// Socket-level evidence of communication between live processes.
pub trait ConnectionProbe: Send + Sync {
    fn probe(&self, live: &HashSet<u32>) -> ProbeResult;
}

/// Probe that never finds anything. Leaves only parent-child evidence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl ConnectionProbe for NullProbe {
    fn probe(&self, _live: &HashSet<u32>) -> ProbeResult {
        ProbeResult::default()
    }
}

/// Reads loopback TCP pairs and socket ownership out of a procfs tree.
#[derive(Debug, Clone)]
pub struct ProcNetProbe {
    proc_root: PathBuf,
}

impl Default for ProcNetProbe {
    fn default() -> Self {
        Self::new("/proc")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoopbackSocket {
    local_port: u16,
    remote_port: u16,
    inode: u64,
}

impl ProcNetProbe {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn read_tcp_table(&self, file: &str, restricted: &mut bool) -> Vec<LoopbackSocket> {
        let path = self.proc_root.join("net").join(file);
        match std::fs::read_to_string(&path) {
            Ok(contents) => contents.lines().skip(1).filter_map(parse_tcp_line).collect(),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                *restricted = true;
                Vec::new()
            }
            Err(e) => {
                debug!("skipping {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    /// Socket inodes held open by `pid`.
    fn socket_inodes(&self, pid: u32, restricted: &mut bool) -> Vec<u64> {
        let fd_dir = self.proc_root.join(pid.to_string()).join("fd");
        let entries = match std::fs::read_dir(&fd_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() == ErrorKind::PermissionDenied {
                    *restricted = true;
                }
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| std::fs::read_link(entry.path()).ok())
            .filter_map(|target| parse_socket_link(&target))
            .collect()
    }
}

impl ConnectionProbe for ProcNetProbe {
    #[tracing::instrument(skip_all, fields(live = live.len()))]
    fn probe(&self, live: &HashSet<u32>) -> ProbeResult {
        let mut restricted = false;

        let mut owners: HashMap<u64, BTreeSet<u32>> = HashMap::new();
        for &pid in live {
            for inode in self.socket_inodes(pid, &mut restricted) {
                owners.entry(inode).or_default().insert(pid);
            }
        }

        let mut sockets = self.read_tcp_table("tcp", &mut restricted);
        sockets.extend(self.read_tcp_table("tcp6", &mut restricted));

        let mut found: BTreeMap<(u32, u32, ConnectionKind), Connection> = BTreeMap::new();

        let by_ports: HashMap<(u16, u16), &LoopbackSocket> = sockets
            .iter()
            .map(|s| ((s.local_port, s.remote_port), s))
            .collect();
        for socket in &sockets {
            let Some(peer) = by_ports.get(&(socket.remote_port, socket.local_port)) else {
                continue;
            };
            let (Some(ours), Some(theirs)) = (owners.get(&socket.inode), owners.get(&peer.inode))
            else {
                continue;
            };
            for &a in ours {
                for &b in theirs {
                    if let Some(conn) = Connection::between(a, b, ConnectionKind::SharedPort) {
                        let (lport, rport) = if a < b {
                            (socket.local_port, socket.remote_port)
                        } else {
                            (socket.remote_port, socket.local_port)
                        };
                        found
                            .entry((conn.id_a, conn.id_b, conn.kind))
                            .or_insert_with(|| {
                                conn.with_metadata("lport", lport).with_metadata("rport", rport)
                            });
                    }
                }
            }
        }

        for (inode, pids) in &owners {
            if pids.len() < 2 {
                continue;
            }
            let pids: Vec<u32> = pids.iter().copied().collect();
            for (i, &a) in pids.iter().enumerate() {
                for &b in &pids[i + 1..] {
                    if let Some(conn) = Connection::between(a, b, ConnectionKind::SharedSocket) {
                        found
                            .entry((conn.id_a, conn.id_b, conn.kind))
                            .or_insert_with(|| conn.with_metadata("inode", inode));
                    }
                }
            }
        }

        if restricted {
            debug!("socket introspection partly denied");
        }

        ProbeResult {
            connections: found.into_values().collect(),
            restricted,
        }
    }
}

fn connection_rank(kind: ConnectionKind) -> u8 {
    match kind {
        ConnectionKind::SharedPort => 0,
        ConnectionKind::SharedSocket => 1,
        ConnectionKind::ParentChild => 2,
    }
}

/// Merges socket evidence with the parent-child edges of the live part of `snapshot`. Socket
/// evidence ranks first, then pairs in ascending order, and the list is cut at `limit`.
pub fn collect_connections(
    probe: &dyn ConnectionProbe,
    snapshot: &Snapshot,
    limit: usize,
) -> Vec<Connection> {
    let live: HashSet<u32> = snapshot
        .values()
        .filter(|entity| entity.is_live())
        .map(|entity| entity.pid)
        .collect();

    let result = probe.probe(&live);
    if result.restricted && result.connections.is_empty() {
        warn!("connection introspection restricted, using parent-child evidence only");
    }

    let mut seen = HashSet::new();
    let mut connections: Vec<Connection> = result
        .connections
        .into_iter()
        .filter(|c| live.contains(&c.id_a) && live.contains(&c.id_b))
        .filter(|c| seen.insert((c.id_a, c.id_b, c.kind)))
        .collect();

    for entity in snapshot.values().filter(|e| e.is_live()) {
        if !live.contains(&entity.ppid) {
            continue;
        }
        if let Some(conn) = Connection::between(entity.ppid, entity.pid, ConnectionKind::ParentChild)
        {
            if seen.insert((conn.id_a, conn.id_b, conn.kind)) {
                connections.push(conn);
            }
        }
    }

    connections.sort_by_key(|c| (connection_rank(c.kind), c.id_a, c.id_b));
    connections.truncate(limit);
    connections
}

fn parse_socket_link(target: &Path) -> Option<u64> {
    target
        .to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Parses one row of `/proc/net/tcp{,6}`, keeping established loopback sockets only.
fn parse_tcp_line(line: &str) -> Option<LoopbackSocket> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 || fields[3] != TCP_ESTABLISHED {
        return None;
    }
    let (local_addr, local_port) = parse_endpoint(fields[1])?;
    let (remote_addr, remote_port) = parse_endpoint(fields[2])?;
    if !local_addr || !remote_addr {
        return None;
    }
    Some(LoopbackSocket {
        local_port,
        remote_port,
        inode: fields[9].parse().ok()?,
    })
}

/// Returns whether the endpoint address is loopback, and its port.
fn parse_endpoint(endpoint: &str) -> Option<(bool, u16)> {
    let (addr, port) = endpoint.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let loopback = match addr.len() {
        8 => {
            let raw = u32::from_str_radix(addr, 16).ok()?;
            Ipv4Addr::from(raw.to_ne_bytes()).is_loopback()
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            let v6 = Ipv6Addr::from(bytes);
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
        _ => return None,
    };
    Some((loopback, port))
}
