/// Inspects trainer output for signs of failure the exit code does not carry.
pub trait FailureSniffer: Send + Sync {
    /// Returns the matched marker when `line` reports a failure.
    fn inspect(&self, line: &str) -> Option<String>;
}

/// Matches fixed substrings, case-sensitively.
#[derive(Debug, Clone)]
pub struct MarkerSniffer {
    markers: Vec<String>,
}

impl MarkerSniffer {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        }
    }
}

impl Default for MarkerSniffer {
    fn default() -> Self {
        Self::new(["No data found"])
    }
}

impl FailureSniffer for MarkerSniffer {
    fn inspect(&self, line: &str) -> Option<String> {
        self.markers
            .iter()
            .find(|marker| line.contains(marker.as_str()))
            .cloned()
    }
}
