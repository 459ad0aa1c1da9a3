//! Whitelist matching for immediate forwarding

/// Configured addresses and bare domains whose mail is forwarded on arrival.
///
/// Comparison is exact: no wildcards and no case folding.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: Vec<String>,
}

impl Whitelist {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// True if any address matches any entry
    pub fn matches<S: AsRef<str>>(&self, addresses: &[S]) -> bool {
        addresses.iter().any(|address| {
            self.entries
                .iter()
                .any(|entry| entry_matches(entry, address.as_ref()))
        })
    }
}

/// An entry with `@` is a full address; otherwise it names the domain after
/// the last `@` of the address.
fn entry_matches(entry: &str, address: &str) -> bool {
    if entry.contains('@') {
        return entry == address;
    }
    address
        .rsplit_once('@')
        .map_or(false, |(_, domain)| domain == entry)
}
