//! Backend server identity.
//!
//! # Responsibilities
//! - Represent one federated resource server
//! - Build search URLs under its base address
//! - Answer capability questions (does it support these parameters?)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::config::{AuthConfig, ServerConfig};

/// Wildcard entry in a capability map.
const ANY: &str = "*";

/// A single backend server. Immutable after configuration load.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendServer {
    pub id: String,
    pub name: String,
    pub base_url: Url,
    pub priority: u32,
    pub auth: AuthConfig,
    pub timeout: Option<Duration>,
    pub enabled: bool,
    pub headers: Vec<(String, String)>,
    pub capabilities: HashMap<String, Vec<String>>,
}

impl BackendServer {
    pub fn from_config(config: &ServerConfig) -> Result<Self, url::ParseError> {
        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();

        Ok(Self {
            id: config.id.clone(),
            name: if config.name.is_empty() { config.id.clone() } else { config.name.clone() },
            base_url: Url::parse(&config.base_url)?,
            priority: config.priority,
            auth: config.auth.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            enabled: config.enabled,
            headers,
            capabilities: config.capabilities.clone(),
        })
    }

    /// A minimal enabled server, mostly for tests and tooling.
    pub fn new(id: impl Into<String>, base_url: Url, priority: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            base_url,
            priority,
            auth: AuthConfig::None,
            timeout: None,
            enabled: true,
            headers: Vec::new(),
            capabilities: HashMap::new(),
        }
    }

    /// `{base_url}/{resource_type}`, or the base itself for system-wide search.
    pub fn search_url(&self, resource_type: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Some(resource_type) = resource_type {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().push(resource_type);
            }
        }
        url
    }

    /// Checks the advertised capabilities. Returns the first unsupported
    /// item on failure.
    pub fn supports(&self, resource_type: Option<&str>, params: &[String]) -> Result<(), String> {
        if self.capabilities.is_empty() {
            return Ok(());
        }

        let supported = match resource_type {
            Some(ty) => self.capabilities.get(ty).or_else(|| self.capabilities.get(ANY)),
            None => self.capabilities.get(ANY),
        };
        let supported = match (supported, resource_type) {
            (Some(list), _) => list,
            (None, Some(ty)) => return Err(format!("resource type {}", ty)),
            (None, None) => return Ok(()),
        };

        if supported.iter().any(|p| p == ANY) {
            return Ok(());
        }
        match params.iter().find(|p| !supported.contains(p)) {
            Some(missing) => Err(format!("search parameter {}", missing)),
            None => Ok(()),
        }
    }
}

/// Build server definitions, skipping (and logging) invalid entries.
pub fn servers_from_config(configs: &[ServerConfig]) -> Vec<Arc<BackendServer>> {
    configs
        .iter()
        .filter_map(|config| match BackendServer::from_config(config) {
            Ok(server) => Some(Arc::new(server)),
            Err(e) => {
                tracing::warn!(server = %config.id, error = %e, "Invalid server base_url, skipping");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_caps(caps: &[(&str, &[&str])]) -> BackendServer {
        let mut server = BackendServer::new("a", Url::parse("http://a.test/fhir/").unwrap(), 1);
        for (ty, params) in caps {
            server
                .capabilities
                .insert(ty.to_string(), params.iter().map(|p| p.to_string()).collect());
        }
        server
    }

    #[test]
    fn test_search_url() {
        let server = BackendServer::new("a", Url::parse("http://a.test/fhir/").unwrap(), 1);
        assert_eq!(server.search_url(Some("Patient")).as_str(), "http://a.test/fhir/Patient");
        assert_eq!(server.search_url(None).as_str(), "http://a.test/fhir/");

        let bare = BackendServer::new("b", Url::parse("http://b.test").unwrap(), 1);
        assert_eq!(bare.search_url(Some("Observation")).as_str(), "http://b.test/Observation");
    }

    #[test]
    fn test_capabilities() {
        let open = server_with_caps(&[]);
        assert!(open.supports(Some("Patient"), &["anything".into()]).is_ok());

        let server = server_with_caps(&[("Patient", &["name", "birthdate"])]);
        assert!(server.supports(Some("Patient"), &["name".into()]).is_ok());
        assert_eq!(
            server.supports(Some("Patient"), &["name".into(), "gender".into()]),
            Err("search parameter gender".to_string())
        );
        assert_eq!(
            server.supports(Some("Observation"), &[]),
            Err("resource type Observation".to_string())
        );

        let wildcard = server_with_caps(&[("*", &["*"])]);
        assert!(wildcard.supports(Some("Observation"), &["code".into()]).is_ok());
    }
}
