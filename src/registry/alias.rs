use std::collections::HashMap;

/// Maps a short, user-facing model alias to the display names that may serve
/// it, most preferred first.
#[derive(Debug, Clone, Default)]
pub(crate) struct AliasTable {
    aliases: HashMap<String, Vec<String>>,
}

impl AliasTable {
    pub(crate) fn new(aliases: HashMap<String, Vec<String>>) -> AliasTable {
        AliasTable { aliases }
    }

    pub(crate) fn resolve(&self, alias: &str) -> Option<&[String]> {
        self.aliases.get(alias).map(|names| names.as_slice())
    }
}
