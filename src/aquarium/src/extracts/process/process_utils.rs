use sysinfo::ProcessStatus;

pub fn process_status_to_string(status: &ProcessStatus) -> String {
    match status {
        ProcessStatus::Run => "running".to_string(),
        ProcessStatus::Sleep => "sleeping".to_string(),
        ProcessStatus::Idle => "idle".to_string(),
        ProcessStatus::Zombie => "zombie".to_string(),
        ProcessStatus::Stop => "stopped".to_string(),
        ProcessStatus::Parked => "parked".to_string(),
        ProcessStatus::Tracing => "tracing-stop".to_string(),
        ProcessStatus::Dead => "dead".to_string(),
        ProcessStatus::UninterruptibleDiskSleep => "disk-sleep".to_string(),
        ProcessStatus::Waking => "waking".to_string(),
        ProcessStatus::LockBlocked => "locked".to_string(),
        _ => "unknown".to_string(),
    }
}

/// Memory share of `bytes` against `total` bytes, as a percentage.
pub fn memory_share(bytes: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    ((bytes as f64 / total as f64) * 100.0) as f32
}
