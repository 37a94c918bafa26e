use crate::extracts::process::process_utils::{memory_share, process_status_to_string};
use mockall::automock;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

/// One row of the OS process table as enumerated. Optional fields may be missing when the
/// platform withholds them; the sources substitute defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawProcess {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub name: Option<String>,
    pub exe: Option<String>,
    pub memory_percent: Option<f32>,
    pub cpu_percent: Option<f32>,
    pub num_threads: Option<u32>,
    pub status: Option<String>,
    pub cmdline: Vec<String>,
}

impl RawProcess {
    pub fn name_or_unknown(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "unknown",
        }
    }
}

/// The OS process table. Every call refreshes before reading.
#[automock]
pub trait ProcessTable: Send {
    /// Enumerates every process (not thread) currently visible.
    fn enumerate(&mut self) -> Vec<RawProcess>;

    /// Looks up a single process. Returns `None` if it has already vanished.
    fn lookup(&mut self, pid: u32) -> Option<RawProcess>;
}

/// [`ProcessTable`] backed by `sysinfo`.
pub struct SysinfoProcessTable {
    system: System,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self { system }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::everything()
            .with_exe(UpdateKind::Always)
            .with_cmd(UpdateKind::OnlyIfNotSet)
    }

    fn to_raw(process: &Process, total_memory: u64) -> RawProcess {
        RawProcess {
            pid: process.pid().as_u32(),
            ppid: process.parent().map(|p| p.as_u32()),
            name: Some(process.name().to_string_lossy().into_owned()),
            exe: process.exe().map(|p| p.to_string_lossy().into_owned()),
            memory_percent: Some(memory_share(process.memory(), total_memory)),
            cpu_percent: Some(process.cpu_usage()),
            num_threads: process.tasks().map(|tasks| tasks.len().max(1) as u32),
            status: Some(process_status_to_string(&process.status())),
            cmdline: process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    #[tracing::instrument(skip(self))]
    fn enumerate(&mut self) -> Vec<RawProcess> {
        self.system.refresh_memory();
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());

        let total_memory = self.system.total_memory();
        let processes: Vec<RawProcess> = self
            .system
            .processes()
            .values()
            .filter(|process| process.thread_kind().is_none())
            .map(|process| Self::to_raw(process, total_memory))
            .collect();

        debug!("enumerated {} processes", processes.len());
        processes
    }

    fn lookup(&mut self, pid: u32) -> Option<RawProcess> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            Self::refresh_kind(),
        );
        let total_memory = self.system.total_memory();
        self.system
            .process(pid)
            .map(|process| Self::to_raw(process, total_memory))
    }
}
