mod connection_probe;

pub use connection_probe::{
    collect_connections, ConnectionProbe, NullProbe, ProbeResult, ProcNetProbe,
};
