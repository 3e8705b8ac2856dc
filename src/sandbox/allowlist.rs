//! Parsing of the capability allowlist.

/// One allowlisted capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// A bare global such as `tostring`.
    Global(String),
    /// A member of a module table such as `math.floor`.
    Member { module: String, member: String },
}

impl Capability {
    fn parse(token: &str) -> Self {
        if let Some((module, rest)) = token.split_once('.') {
            let member = rest.split('.').next().unwrap_or_default();
            if !module.is_empty() && !member.is_empty() {
                return Capability::Member {
                    module: module.to_string(),
                    member: member.to_string(),
                };
            }
        }
        Capability::Global(token.to_string())
    }
}

/// A parsed, whitespace-separated allowlist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    entries: Vec<Capability>,
}

impl Allowlist {
    /// Split a whitespace-separated list into capabilities. Empty tokens
    /// are skipped; nothing is validated against the interpreter here.
    pub fn parse(list: &str) -> Self {
        Self {
            entries: list.split_whitespace().map(Capability::parse).collect(),
        }
    }

    /// Capabilities in the order they were listed.
    pub fn entries(&self) -> &[Capability] {
        &self.entries
    }

    /// Module names in order of first appearance.
    pub fn modules(&self) -> Vec<&str> {
        let mut modules: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if let Capability::Member { module, .. } = entry {
                if !modules.contains(&module.as_str()) {
                    modules.push(module);
                }
            }
        }
        modules
    }

    /// Number of listed capabilities, duplicates included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<&str> for Allowlist {
    fn from(list: &str) -> Self {
        Allowlist::parse(list)
    }
}
