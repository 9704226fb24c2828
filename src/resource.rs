use std::fmt::{Debug, Formatter};

use serde::{Deserialize, Serialize};
use url::Url;

/// Basic-auth credentials for one CalDAV server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<T: ToString, U: ToString>(username: T, password: U) -> Self {
        Self { username: username.to_string(), password: password.to_string() }
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The decrypted credentials of both ends of a [`Source`](crate::source::Source)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCredentials {
    pub source: Credentials,
    pub destination: Credentials,
}


/// Just a wrapper around a URL and credentials
#[derive(Clone, Debug)]
pub struct Resource {
    url: Url,
    credentials: Credentials,
}

impl Resource {
    pub fn new(url: Url, credentials: Credentials) -> Self {
        Self { url, credentials }
    }

    pub fn url(&self) -> &Url { &self.url }
    pub fn username(&self) -> &str { &self.credentials.username }
    pub fn password(&self) -> &str { &self.credentials.password }

    /// Build a new Resource by keeping the same credentials, scheme and server from `base` but changing the path part
    pub fn combine(&self, new_path: &str) -> Resource {
        let mut built = (*self).clone();
        built.url.set_path(new_path);
        built
    }

    /// Resolve a `href` returned by the server (either an absolute path or a full URL) against this resource
    pub fn join(&self, href: &str) -> Option<Url> {
        self.url.join(href).ok()
    }
}
