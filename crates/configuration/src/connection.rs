//! Database connection URL handling.
//!
//! The connection URL is resolved once at startup from three sources, in
//! increasing precedence:
//!
//! 1. the built-in [`DEFAULT_DATABASE_URL`],
//! 2. the `sqlalchemy.url` setting, which replaces the default wholesale,
//! 3. the `PG_*` environment variables, each overriding a single component.
//!
//! The result is re-serialized into canonical form, validated, written back
//! into the settings and logged with the password redacted.

use crate::error::ConfigError;
use crate::settings::{DEFAULT_PREFIX, Settings};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use url::{Host, Url};

pub const DEFAULT_DATABASE_URL: &str = "postgresql://postgres:@localhost:5432/test";

pub const ENV_USER: &str = "PG_USER";
pub const ENV_PASSWORD: &str = "PG_PASSWORD";
pub const ENV_HOST: &str = "PG_HOST";
pub const ENV_PORT: &str = "PG_PORT";
pub const ENV_DBNAME: &str = "PG_DBNAME";

/// Replaces the password whenever a URL is rendered for humans.
pub const REDACTED_PASSWORD: &str = "***";

/// Characters escaped inside the user, password and database segments before
/// they are handed to [`Url`]. `Url` leaves `%` alone in these segments, so
/// it has to be escaped here.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// A parsed database connection URL.
///
/// `username`, `password` and `database` hold the decoded values; encoding
/// happens only when the URL is rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUrl {
    pub scheme: String,
    pub username: Option<String>,
    /// `Some("")` is a set but empty password (`user:@host`).
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    /// Everything after `?`, kept verbatim.
    pub query: Option<String>,
}

impl ConnectionUrl {
    /// Parses `scheme://[user[:password]@][host][:port][/database][?query]`.
    ///
    /// IPv6 hosts are written in brackets (`[::1]`).
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: redact_raw(raw),
            reason,
        };

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        if !url.has_authority() {
            return Err(invalid("missing '://'".to_string()));
        }

        let userinfo = raw_userinfo(raw);
        let username = userinfo.map(|_| decode(url.username()));
        // `Url` forgets an empty password; the separator in the raw text does not.
        let password = match url.password() {
            Some(password) => Some(decode(password)),
            None if userinfo.is_some_and(|info| info.contains(':')) => Some(String::new()),
            None => None,
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) => Some(decode(domain)).filter(|host| !host.is_empty()),
            Some(Host::Ipv4(address)) => Some(address.to_string()),
            Some(Host::Ipv6(address)) => Some(address.to_string()),
            None => None,
        };

        let database = match url.path() {
            "" => None,
            path => Some(decode(path.strip_prefix('/').unwrap_or(path))),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            username,
            password,
            host,
            port: url.port(),
            database,
            query: url.query().map(str::to_string),
        })
    }

    /// The `host[:port]` part, with IPv6 literals bracketed.
    pub fn netloc(&self) -> String {
        let mut netloc = String::new();
        if let Some(host) = &self.host {
            if host.contains(':') {
                netloc.push('[');
                netloc.push_str(host);
                netloc.push(']');
            } else {
                netloc.push_str(host);
            }
        }
        if let Some(port) = self.port {
            netloc.push(':');
            netloc.push_str(&port.to_string());
        }
        netloc
    }

    /// The canonical form, including the encoded password.
    pub fn to_canonical(&self) -> Result<String, ConfigError> {
        self.render(false)
    }

    /// Renders the URL with the password replaced by [`REDACTED_PASSWORD`].
    pub fn redacted(&self) -> Result<String, ConfigError> {
        self.render(true)
    }

    fn render(&self, hide_password: bool) -> Result<String, ConfigError> {
        let base = format!("{}://{}", self.scheme, self.netloc());
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: base.clone(),
            reason,
        };

        let mut url = Url::parse(&base).map_err(|e| invalid(e.to_string()))?;
        let mut empty_password = false;
        if let Some(username) = &self.username {
            url.set_username(&encode(username))
                .map_err(|()| invalid("credentials require a host".to_string()))?;
            let password = match self.password.as_deref() {
                Some(_) if hide_password => Some(REDACTED_PASSWORD.to_string()),
                Some("") => {
                    empty_password = true;
                    None
                }
                Some(password) => Some(encode(password)),
                None => None,
            };
            url.set_password(password.as_deref())
                .map_err(|()| invalid("credentials require a host".to_string()))?;
        }
        if let Some(database) = &self.database {
            url.set_path(&format!("/{}", encode(database)));
        }
        url.set_query(self.query.as_deref());

        let mut rendered = url.to_string();
        if empty_password {
            let end_of_username = url.scheme().len() + "://".len() + url.username().len();
            rendered.insert(end_of_username, ':');
        }
        Ok(rendered)
    }
}

/// Resolves the connection URL and stores it back under `sqlalchemy.url`.
///
/// `env` looks up an environment variable; a variable that is set, even to
/// an empty string, wins over the file and default values.
///
/// # Errors
///
/// Returns [`ConfigError::MissingDatabaseName`] when the resolved URL has no
/// database name, and URL/port errors when a source cannot be parsed. No
/// connection is attempted here.
pub fn resolve_connection_url<F>(
    settings: &mut Settings,
    env: F,
) -> Result<ConnectionUrl, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let url_key = format!("{DEFAULT_PREFIX}url");

    let mut url = match settings.get(&url_key) {
        Some(configured) => ConnectionUrl::parse(configured)?,
        None => ConnectionUrl::parse(DEFAULT_DATABASE_URL)?,
    };

    if let Some(user) = env(ENV_USER) {
        url.username = Some(user);
    }
    if let Some(password) = env(ENV_PASSWORD) {
        url.password = Some(password);
    }
    if let Some(host) = env(ENV_HOST) {
        url.host = Some(host);
    }
    if let Some(port) = env(ENV_PORT) {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
        url.port = Some(port);
    }
    if let Some(database) = env(ENV_DBNAME) {
        url.database = Some(database);
    }

    // Round-trip through the canonical form so the stored value and the
    // returned value agree byte for byte.
    let canonical = url.to_canonical()?;
    let url = ConnectionUrl::parse(&canonical)?;

    if url.database.as_deref().is_none_or(str::is_empty) {
        return Err(ConfigError::MissingDatabaseName);
    }

    let redacted = url.redacted()?;
    settings.insert(url_key, canonical);
    tracing::info!(url = %redacted, "Resolved database connection URL.");
    Ok(url)
}

/// [`resolve_connection_url`] against the process environment.
pub fn resolve_from_env(settings: &mut Settings) -> Result<ConnectionUrl, ConfigError> {
    resolve_connection_url(settings, |key| std::env::var(key).ok())
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

fn decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// The raw `user[:password]` text of an authority, if it has one. The last
/// `@` before the path wins, as in [`Url::parse`].
fn raw_userinfo(raw: &str) -> Option<&str> {
    let (_, rest) = raw.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    authority.rfind('@').map(|at| &authority[..at])
}

/// Best-effort redaction for URLs that failed to parse, used in error messages.
fn redact_raw(raw: &str) -> String {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return raw.to_string();
    };
    match rest.rfind('@') {
        Some(at) => match rest[..at].split_once(':') {
            Some((user, _)) => format!("{scheme}://{user}:{REDACTED_PASSWORD}{}", &rest[at..]),
            None => raw.to_string(),
        },
        None => raw.to_string(),
    }
}
