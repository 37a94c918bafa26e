pub const WORKING_DIR: &str = "/tmp/aquarium";
pub const LOG_FILE_NAME: &str = "aquarium.log";

pub const PROCESS_POLLING_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_ENTITIES: usize = 300;
pub const DEFAULT_INCLUSION_PROBABILITY: f64 = 0.8;
pub const DEFAULT_GROUP_HOP_LIMIT: usize = 2;
pub const DEFAULT_COMMUNICATION_WINDOW_SECS: u64 = 60;
pub const COMMUNICATION_MIN_OBSERVATIONS: usize = 3;

pub const MEMORY_INCLUSION_THRESHOLD: f32 = 0.1;
pub const CPU_INCLUSION_THRESHOLD: f32 = 0.5;

pub const ACTIVE_TICK_HZ: u32 = 30;
pub const HEADLESS_TICK_HZ: u32 = 1;
pub const CONNECTION_REFRESH_MS: u64 = 2000;
pub const MAX_CONNECTIONS: usize = 20;

pub const WORLD_WIDTH: f64 = 1200.0;
pub const WORLD_HEIGHT: f64 = 800.0;

pub const TARGET_FPS: f64 = 30.0;
pub const RECOVERY_MARGIN_FPS: f64 = 3.0;

pub const IMPORTANT_NAMES: &[&str] = &[
    "python",
    "chrome",
    "firefox",
    "safari",
    "code",
    "terminal",
    "finder",
    "dock",
    "systemuiserver",
    "windowserver",
    "kernel_task",
    "launchd",
    "zoom",
    "slack",
    "discord",
    "spotify",
    "photoshop",
    "illustrator",
    "aftereffects",
    "node",
    "java",
    "docker",
];

pub const EXCLUDED_PATTERNS: &[&str] = &[
    "com.apple.",
    "cfprefsd",
    "distnoted",
    "trustd",
    "secd",
    "bluetoothd",
    "audiomxd",
    "logd_helper",
    "deleted",
];
