use chrono::{DateTime, Utc};

/// A new process (thread group leader) was forked.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ProcessStartTrigger {
    /// Process ID of the child
    pub pid: u32,
    /// Thread group ID of the forking parent
    pub ppid: u32,
    /// Time the notification was received
    pub started_at: DateTime<Utc>,
}

/// A process replaced its image with `execve`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ProcessExecTrigger {
    pub pid: u32,
    pub executed_at: DateTime<Utc>,
}

/// A trigger indicating a process exited. `exit_reason` is decoded from the wait status the
/// kernel reports.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ProcessEndTrigger {
    pub pid: u32,
    pub finished_at: DateTime<Utc>,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone)]
pub enum Trigger {
    ProcessStart(ProcessStartTrigger),
    ProcessExec(ProcessExecTrigger),
    ProcessEnd(ProcessEndTrigger),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExitReason {
    Signal(i32),
    Code(i32),
    Unknown,
}

impl ExitReason {
    /// Decodes a raw `wait(2)` status word.
    pub fn from_wait_status(status: u32) -> Self {
        let signal = (status & 0x7f) as i32;
        if signal == 0 {
            ExitReason::Code(((status >> 8) & 0xff) as i32)
        } else if signal != 0x7f {
            ExitReason::Signal(signal)
        } else {
            ExitReason::Unknown
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Signal(sig) => write!(f, "Signal {}", sig),
            ExitReason::Code(code) => write!(f, "Exit code {}", code),
            ExitReason::Unknown => write!(f, "Unknown"),
        }
    }
}
