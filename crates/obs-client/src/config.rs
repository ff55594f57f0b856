//! Client configuration

use std::time::Duration;

/// Client configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Service endpoint URL
    pub endpoint: String,
    /// Bearer token sent with every request
    pub access_token: Option<String>,
    /// Request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Re-sends of a request that failed to connect or timed out
    pub max_retries: u32,
    /// Address buckets as `endpoint/bucket/key` instead of `bucket.endpoint/key`
    pub path_style: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            access_token: None,
            timeout: Duration::from_secs(60),
            user_agent: format!("obs-client/{}", env!("CARGO_PKG_VERSION")),
            max_retries: 3,
            path_style: true,
        }
    }
}

impl Config {
    /// Create a new config with the given endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the access token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connection retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Use virtual-hosted bucket addressing
    pub fn with_virtual_host_style(mut self) -> Self {
        self.path_style = false;
        self
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}
