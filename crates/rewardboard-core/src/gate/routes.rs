use serde::{Deserialize, Serialize};

/// Which routes the gate leaves alone, and where it sends everyone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutePolicy {
    /// Routes that are public only when matched exactly (e.g. the landing page)
    pub public_exact: Vec<String>,
    /// Route prefixes that are public along with everything below them
    pub public_prefixes: Vec<String>,
    pub login_route: String,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            public_exact: vec!["/".to_string()],
            public_prefixes: vec!["/login".to_string(), "/register".to_string()],
            login_route: "/login".to_string(),
        }
    }
}

impl RoutePolicy {
    pub fn is_public(&self, route: &str) -> bool {
        let path = route.split(['?', '#']).next().unwrap_or(route);
        self.public_exact.iter().any(|p| p == path)
            || self
                .public_prefixes
                .iter()
                .any(|prefix| Self::is_under(path, prefix))
    }

    /// `/login` covers `/login` and `/login/sso` but not `/loginx`. A bare `/` covers only itself.
    fn is_under(path: &str, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return path == "/";
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}
