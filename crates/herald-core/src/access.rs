use serde::{Deserialize, Serialize};

/// Reachability of a single channel over the push and pull paths.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    /// Never probed.
    #[default]
    Unknown,
    PushOnly,
    PullOnly,
    Full,
    None,
}

impl AccessState {
    /// Combine the two independent path checks.
    pub fn from_paths(push: bool, pull: bool) -> Self {
        match (push, pull) {
            (true, true) => Self::Full,
            (true, false) => Self::PushOnly,
            (false, true) => Self::PullOnly,
            (false, false) => Self::None,
        }
    }

    pub fn is_usable(self) -> bool {
        matches!(self, Self::PushOnly | Self::PullOnly | Self::Full)
    }

    pub fn has_pull(self) -> bool {
        matches!(self, Self::PullOnly | Self::Full)
    }

    pub fn has_push(self) -> bool {
        matches!(self, Self::PushOnly | Self::Full)
    }

    /// Short operator-facing label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::PushOnly => "push only",
            Self::PullOnly => "pull only",
            Self::Full => "full",
            Self::None => "no access",
        }
    }
}

impl std::fmt::Display for AccessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::PushOnly => write!(f, "push_only"),
            Self::PullOnly => write!(f, "pull_only"),
            Self::Full => write!(f, "full"),
            Self::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for AccessState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "push_only" => Ok(Self::PushOnly),
            "pull_only" => Ok(Self::PullOnly),
            "full" => Ok(Self::Full),
            "none" => Ok(Self::None),
            other => Err(format!("unknown access state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combines_paths() {
        assert_eq!(AccessState::from_paths(true, true), AccessState::Full);
        assert_eq!(AccessState::from_paths(true, false), AccessState::PushOnly);
        assert_eq!(AccessState::from_paths(false, true), AccessState::PullOnly);
        assert_eq!(AccessState::from_paths(false, false), AccessState::None);
    }

    #[test]
    fn usable_states() {
        assert!(AccessState::Full.is_usable());
        assert!(AccessState::PushOnly.is_usable());
        assert!(AccessState::PullOnly.is_usable());
        assert!(!AccessState::None.is_usable());
        assert!(!AccessState::Unknown.is_usable());
    }

    #[test]
    fn path_accessors() {
        assert!(AccessState::Full.has_pull() && AccessState::Full.has_push());
        assert!(!AccessState::PushOnly.has_pull());
        assert!(!AccessState::PullOnly.has_push());
    }

    #[test]
    fn display_parses_back() {
        for state in [
            AccessState::Unknown,
            AccessState::PushOnly,
            AccessState::PullOnly,
            AccessState::Full,
            AccessState::None,
        ] {
            assert_eq!(state.to_string().parse::<AccessState>().unwrap(), state);
        }
        assert!("partial".parse::<AccessState>().is_err());
    }

    #[test]
    fn serde_matches_display() {
        let json = serde_json::to_string(&AccessState::PushOnly).unwrap();
        assert_eq!(json, "\"push_only\"");
    }
}
