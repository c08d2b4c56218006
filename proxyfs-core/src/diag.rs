//! Read-only diagnostic status endpoints.

use std::fmt;

/// Directory name the endpoints are published under.
pub const DIAG_DIR: &str = "proxyfs";

/// The three informational endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Channel unit identifier
    UnitId,
    /// Notification filters
    Filters,
    /// Registered subscribers
    Pids,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] = [Endpoint::UnitId, Endpoint::Filters, Endpoint::Pids];

    /// File name of the endpoint.
    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::UnitId => "unit_id",
            Endpoint::Filters => "filters",
            Endpoint::Pids => "pids",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Content source for the diagnostic endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    unit_id: u32,
}

impl Diagnostics {
    pub fn new(unit_id: u32) -> Self {
        Self { unit_id }
    }

    /// Text served by `endpoint`, newline terminated.
    pub fn render(&self, endpoint: Endpoint) -> String {
        match endpoint {
            Endpoint::UnitId => format!("{}\n", self.unit_id),
            Endpoint::Filters => "filters - NOT IMPLEMENTED YET\n".to_string(),
            Endpoint::Pids => "pids - NOT IMPLEMENTED YET\n".to_string(),
        }
    }

    /// Every endpoint with its content.
    pub fn snapshot(&self) -> Vec<(Endpoint, String)> {
        Endpoint::ALL.into_iter().map(|e| (e, self.render(e))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_endpoints() {
        let diag = Diagnostics::new(25);
        assert_eq!(diag.render(Endpoint::UnitId), "25\n");
        assert_eq!(diag.render(Endpoint::Filters), "filters - NOT IMPLEMENTED YET\n");
        assert_eq!(diag.render(Endpoint::Pids), "pids - NOT IMPLEMENTED YET\n");
        assert_eq!(diag.snapshot().len(), 3);
    }

    #[test]
    fn test_endpoint_names() {
        for endpoint in Endpoint::ALL {
            assert_eq!(Endpoint::from_name(endpoint.name()), Some(endpoint));
        }
        assert_eq!(Endpoint::from_name("stats"), None);
    }
}
