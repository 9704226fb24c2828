//! Default implementations of the collaborators of the sync engine

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::{Host, Url};

use crate::error::BoxError;
use crate::resource::SourceCredentials;
use crate::source::Source;
use crate::traits::{CredentialStore, Notifier, UrlValidator};


/// Credentials kept in memory
#[derive(Clone, Debug, Default)]
pub struct StaticCredentialStore {
    credentials: HashMap<String, SourceCredentials>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load credentials from a JSON file that maps source IDs to `{ "source": {..}, "destination": {..} }`
    pub fn from_file(path: &Path) -> Result<Self, BoxError> {
        let credentials = match std::fs::File::open(path) {
            Err(err) => {
                return Err(format!("Unable to open file {:?}: {}", path, err).into());
            },
            Ok(file) => serde_json::from_reader(std::io::BufReader::new(file))?,
        };
        Ok(Self { credentials })
    }

    pub fn insert<S: ToString>(&mut self, source_id: S, credentials: SourceCredentials) {
        self.credentials.insert(source_id.to_string(), credentials);
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn credentials(&self, source_id: &str) -> Result<SourceCredentials, BoxError> {
        self.credentials
            .get(source_id)
            .cloned()
            .ok_or_else(|| format!("no credentials for source {}", source_id).into())
    }
}


/// Only lets HTTPS URLs to public hosts through
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpsOnlyValidator;

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified() || v4.is_broadcast()),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_public(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        },
    }
}

impl UrlValidator for HttpsOnlyValidator {
    fn validate(&self, url: &Url) -> Result<(), String> {
        if url.scheme() != "https" {
            return Err(format!("scheme {} is not allowed, HTTPS is required", url.scheme()));
        }
        match url.host() {
            None => Err("the URL has no host".to_string()),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if domain == "localhost" || domain.ends_with(".localhost") {
                    Err(format!("host {} is not allowed", domain))
                } else {
                    Ok(())
                }
            },
            Some(Host::Ipv4(ip)) if is_public(IpAddr::V4(ip)) == false => Err(format!("address {} is not allowed", ip)),
            Some(Host::Ipv6(ip)) if is_public(IpAddr::V6(ip)) == false => Err(format!("address {} is not allowed", ip)),
            Some(_) => Ok(()),
        }
    }
}


/// Reports stale sources in the log
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn source_stale(&self, source: &Source, last_success: Option<DateTime<Utc>>) {
        match last_success {
            Some(when) => log::warn!("Source {} ({}) has not synced successfully since {}", source.name, source.id, when),
            None => log::warn!("Source {} ({}) has never synced successfully", source.name, source.id),
        }
    }

    async fn source_recovered(&self, source: &Source) {
        log::info!("Source {} ({}) is syncing again", source.name, source.id);
    }
}
