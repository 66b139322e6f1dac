use serde::{Deserialize, Serialize};

/// Request priority (matches Chromium's RequestPriority).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum RequestPriority {
    Throttled = 0,
    Idle = 1,
    Lowest = 2,
    Low = 3,
    #[default]
    Medium = 4,
    Highest = 5,
}

impl RequestPriority {
    pub const COUNT: usize = 6;

    /// All priorities, lowest first.
    pub const ALL: [RequestPriority; Self::COUNT] = [
        RequestPriority::Throttled,
        RequestPriority::Idle,
        RequestPriority::Lowest,
        RequestPriority::Low,
        RequestPriority::Medium,
        RequestPriority::Highest,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}
