use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named saga state.
///
/// Every state machine contains the `Initial` and `Final` sentinels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Cow<'static, str>);

impl State {
    pub const INITIAL: &'static str = "Initial";
    pub const FINAL: &'static str = "Final";

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub const fn initial() -> Self {
        Self::from_static(Self::INITIAL)
    }

    pub const fn final_state() -> Self {
        Self::from_static(Self::FINAL)
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_initial(&self) -> bool {
        self.name() == Self::INITIAL
    }

    pub fn is_final(&self) -> bool {
        self.name() == Self::FINAL
    }

    pub fn is_sentinel(&self) -> bool {
        self.is_initial() || self.is_final()
    }
}

impl From<&'static str> for State {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for State {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl PartialEq<str> for State {
    fn eq(&self, other: &str) -> bool {
        self.name() == other
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
