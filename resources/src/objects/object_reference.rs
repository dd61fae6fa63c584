use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Contains enough information to let you identify the referred resource.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct CrossVersionObjectReference {
    /// API version of the referent, e.g. `apps/v1`.
    #[serde(default)]
    pub api_version: String,
    /// Kind of the referent.
    pub kind: String,
    /// Name of the referent.
    pub name: String,
}

impl CrossVersionObjectReference {
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        CrossVersionObjectReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// API group part of the api version, empty for the core group.
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }
}

impl Display for CrossVersionObjectReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_of_api_version() {
        let apps = CrossVersionObjectReference::new("apps/v1", "Deployment", "web");
        assert_eq!(apps.group(), "apps");
        let core = CrossVersionObjectReference::new("v1", "ReplicationController", "web");
        assert_eq!(core.group(), "");
    }
}
