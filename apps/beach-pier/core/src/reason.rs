use std::fmt;
use std::str::FromStr;

const TIMEOUT_SUFFIX: &str = "-timeout";

/// What made a viewer ask for a fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResyncTrigger {
    Connect,
    Reconnect,
    Manual,
    Visibility,
    BackendRestarting,
    Overflow,
}

impl ResyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            ResyncTrigger::Connect => "connect",
            ResyncTrigger::Reconnect => "reconnect",
            ResyncTrigger::Manual => "manual",
            ResyncTrigger::Visibility => "visibility",
            ResyncTrigger::BackendRestarting => "backend-restarting",
            ResyncTrigger::Overflow => "overflow",
        }
    }
}

/// Reason tag carried by `request-history`. Retries after an unanswered
/// request keep the trigger and gain a `-timeout` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResyncReason {
    pub trigger: ResyncTrigger,
    pub timed_out: bool,
}

impl ResyncReason {
    pub fn new(trigger: ResyncTrigger) -> Self {
        Self {
            trigger,
            timed_out: false,
        }
    }

    pub fn timed_out(self) -> Self {
        Self {
            trigger: self.trigger,
            timed_out: true,
        }
    }
}

impl From<ResyncTrigger> for ResyncReason {
    fn from(trigger: ResyncTrigger) -> Self {
        Self::new(trigger)
    }
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.trigger.as_str())?;
        if self.timed_out {
            f.write_str(TIMEOUT_SUFFIX)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resync reason '{0}'")]
pub struct UnknownReason(pub String);

impl FromStr for ResyncReason {
    type Err = UnknownReason;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (base, timed_out) = match value.strip_suffix(TIMEOUT_SUFFIX) {
            Some(base) => (base, true),
            None => (value, false),
        };
        let trigger = match base {
            "connect" => ResyncTrigger::Connect,
            "reconnect" => ResyncTrigger::Reconnect,
            "manual" => ResyncTrigger::Manual,
            "visibility" => ResyncTrigger::Visibility,
            "backend-restarting" => ResyncTrigger::BackendRestarting,
            "overflow" => ResyncTrigger::Overflow,
            _ => return Err(UnknownReason(value.to_string())),
        };
        Ok(Self { trigger, timed_out })
    }
}
