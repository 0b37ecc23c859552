use std::collections::HashSet;

/// A named boolean feature flag.
pub trait Flag {
    fn flag_name(&self) -> &str;
}

/// Feature-flag lookup consulted when wiring a [`crate::Scheduler`].
pub trait FlagManager: Send + Sync {
    fn is_enabled(&self, flag: &dyn Flag) -> bool;
}

/// A `FlagManager` with every flag turned off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledFlags;

impl FlagManager for DisabledFlags {
    fn is_enabled(&self, _flag: &dyn Flag) -> bool {
        false
    }
}

/// A `FlagManager` backed by a fixed set of enabled flag names.
#[derive(Debug, Default, Clone)]
pub struct StaticFlags {
    enabled: HashSet<String>,
}

impl StaticFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(mut self, flag: &dyn Flag) -> Self {
        self.enabled.insert(flag.flag_name().to_owned());
        self
    }
}

impl FlagManager for StaticFlags {
    fn is_enabled(&self, flag: &dyn Flag) -> bool {
        self.enabled.contains(flag.flag_name())
    }
}
