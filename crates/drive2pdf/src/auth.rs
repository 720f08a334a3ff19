//! OAuth credentials for the Drive API.
//!
//! Tokens are persisted in the "authorized user" JSON layout Google's client
//! libraries use, so an existing `token.json` keeps working. A stale access
//! token is refreshed in place; a rejected refresh token is discarded and the
//! user is sent through the installed-app flow again, a bounded number of
//! times.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::Error;

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Access tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

/// An access token bundle for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// The bearer access token.
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl Credential {
    /// Whether the access token is past (or about to pass) its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => now + TimeDelta::seconds(EXPIRY_SKEW_SECS) >= expiry,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Usable as-is: has a token and it has not expired.
    pub fn is_valid(&self) -> bool {
        !self.token.is_empty() && !self.is_expired()
    }

    fn apply(&mut self, response: TokenResponse) {
        self.token = response.access_token;
        if response.refresh_token.is_some() {
            self.refresh_token = response.refresh_token;
        }
        self.expiry = response
            .expires_in
            .map(|secs| Utc::now() + TimeDelta::seconds(secs));
    }
}

/// JSON file holding the persisted [`Credential`].
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored credential; `None` if the file does not exist.
    pub fn load(&self) -> Result<Option<Credential>, Error> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the credential, readable only by the owner on Unix.
    pub fn save(&self, credential: &Credential) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(credential)?;
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(json.as_bytes())?;
        debug!(path = %self.path.display(), "saved credential");
        Ok(())
    }

    /// Remove the stored credential. Missing files are not an error.
    pub fn delete(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// OAuth client registration read from the client secret file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    /// Parse a client secret file in either the `installed` or `web` layout.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let file: ClientSecretsFile = serde_json::from_str(text)?;
        file.installed
            .or(file.web)
            .ok_or_else(|| Error::Auth("client secrets contain no installed or web client".into()))
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Auth(format!("cannot read client secrets {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Consent page URL for the authorization-code flow.
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        scopes: &[String],
        state: &str,
    ) -> Result<String, Error> {
        let scope = scopes.join(" ");
        let url = url::Url::parse_with_params(
            &self.auth_uri,
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", scope.as_str()),
                ("state", state),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| Error::Auth(format!("invalid auth_uri {}: {e}", self.auth_uri)))?;
        Ok(url.into())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

fn post_token(http: &Client, token_uri: &str, form: &[(&str, &str)]) -> Result<TokenResponse, Error> {
    let response = http.post(token_uri).form(form).send()?;
    let status = response.status();
    let body = response.text()?;
    if status.is_success() {
        return Ok(serde_json::from_str(&body)?);
    }

    match serde_json::from_str::<TokenErrorResponse>(&body) {
        Ok(err) if err.error == "invalid_grant" => Err(Error::InvalidGrant(
            err.error_description.unwrap_or(err.error),
        )),
        Ok(err) => Err(Error::Auth(format!(
            "token endpoint returned {status}: {}",
            err.error_description.unwrap_or(err.error)
        ))),
        Err(_) => Err(Error::Auth(format!(
            "token endpoint returned {status}: {}",
            body.trim()
        ))),
    }
}

/// Exchange the refresh token for a new access token.
pub fn refresh(http: &Client, credential: &Credential) -> Result<Credential, Error> {
    let refresh_token = credential
        .refresh_token
        .as_deref()
        .ok_or_else(|| Error::Auth("credential has no refresh token".into()))?;
    let response = post_token(
        http,
        &credential.token_uri,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.as_str()),
        ],
    )?;

    let mut refreshed = credential.clone();
    refreshed.apply(response);
    debug!(expiry = ?refreshed.expiry, "refreshed access token");
    Ok(refreshed)
}

/// Exchange an authorization code obtained from the consent page.
pub fn exchange_code(
    http: &Client,
    secrets: &ClientSecrets,
    code: &str,
    redirect_uri: &str,
    scopes: &[String],
) -> Result<Credential, Error> {
    let response = post_token(
        http,
        &secrets.token_uri,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
        ],
    )?;

    let mut credential = Credential {
        token: String::new(),
        refresh_token: None,
        token_uri: secrets.token_uri.clone(),
        client_id: secrets.client_id.clone(),
        client_secret: secrets.client_secret.clone(),
        scopes: scopes.to_vec(),
        expiry: None,
    };
    credential.apply(response);
    Ok(credential)
}

/// Produces a brand-new credential, typically by asking the user.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, scopes: &[String]) -> Result<Credential, Error>;
}

/// Installed-app flow with a loopback redirect.
///
/// Prints the consent URL to stderr and waits for the browser to be
/// redirected back to a one-shot listener on `127.0.0.1`.
pub struct LocalServerFlow {
    client_secret_path: PathBuf,
    http: Client,
}

impl LocalServerFlow {
    pub fn new(client_secret_path: impl Into<PathBuf>, http: Client) -> Self {
        Self {
            client_secret_path: client_secret_path.into(),
            http,
        }
    }
}

fn loopback_port(server: &tiny_http::Server) -> Result<u16, Error> {
    server
        .server_addr()
        .to_ip()
        .map(|addr| addr.port())
        .ok_or_else(|| Error::Auth("loopback listener has no IP address".into()))
}

impl Authorizer for LocalServerFlow {
    fn authorize(&self, scopes: &[String]) -> Result<Credential, Error> {
        let secrets = ClientSecrets::load(&self.client_secret_path)?;
        let server = tiny_http::Server::http("127.0.0.1:0")
            .map_err(|e| Error::Auth(format!("failed to bind loopback listener: {e}")))?;
        let port = loopback_port(&server)?;
        let redirect_uri = format!("http://127.0.0.1:{port}/");
        let state = oauth_state();
        let url = secrets.authorization_url(&redirect_uri, scopes, &state)?;

        eprintln!("Please visit this URL to authorize this application:\n{url}");
        let code = wait_for_code(&server, &state)?;
        info!("authorization code received");
        exchange_code(&self.http, &secrets, &code, &redirect_uri, scopes)
    }
}

fn oauth_state() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{:x}{:x}", nanos, std::process::id())
}

fn html_response(status: u16, body: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let response = tiny_http::Response::from_string(body).with_status_code(status);
    match tiny_http::Header::from_bytes("Content-Type", "text/html; charset=utf-8") {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

/// Serve redirects until one carries an authorization code (or an error).
fn wait_for_code(server: &tiny_http::Server, expected_state: &str) -> Result<String, Error> {
    for request in server.incoming_requests() {
        let Ok(url) = url::Url::parse(&format!("http://127.0.0.1{}", request.url())) else {
            let _ = request.respond(html_response(400, "Bad request"));
            continue;
        };
        let param = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        };

        if let Some(error) = param("error") {
            let _ = request.respond(html_response(400, "Authorization was denied."));
            return Err(Error::Auth(format!("authorization denied: {error}")));
        }
        let Some(code) = param("code") else {
            // Browsers also ask for /favicon.ico and the like.
            let _ = request.respond(html_response(404, "Not found"));
            continue;
        };
        if param("state").as_deref() != Some(expected_state) {
            let _ = request.respond(html_response(400, "State mismatch."));
            return Err(Error::Auth("authorization state mismatch".into()));
        }

        let _ = request.respond(html_response(
            200,
            "The authentication flow has completed. You may close this window.",
        ));
        return Ok(code);
    }
    Err(Error::Auth("loopback listener closed before a code arrived".into()))
}

/// Loads, refreshes, or re-issues credentials on behalf of a session.
pub struct CredentialProvider<A> {
    store: TokenStore,
    authorizer: A,
    http: Client,
    scopes: Vec<String>,
    max_reauth_attempts: u32,
}

impl<A: Authorizer> CredentialProvider<A> {
    pub fn new(config: &AuthConfig, authorizer: A, http: Client) -> Self {
        Self {
            store: TokenStore::new(&config.token_path),
            authorizer,
            http,
            scopes: config.scopes.clone(),
            max_reauth_attempts: config.max_reauth_attempts,
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Return a valid credential, persisting it if anything changed.
    ///
    /// An expired credential is refreshed. If there is nothing usable, or the
    /// refresh token is rejected (which deletes the stored credential), the
    /// authorizer is asked for a new one; whatever it returns goes through the
    /// same checks. At most `max_reauth_attempts` authorizations are made.
    pub fn obtain(&self) -> Result<Credential, Error> {
        let mut current = self.store.load()?;
        let mut authorizations = 0;
        loop {
            match current.take() {
                Some(credential) if credential.is_valid() => {
                    if authorizations > 0 {
                        self.store.save(&credential)?;
                    }
                    return Ok(credential);
                }
                Some(credential) if credential.refresh_token.is_some() => {
                    match refresh(&self.http, &credential) {
                        Ok(fresh) => {
                            self.store.save(&fresh)?;
                            return Ok(fresh);
                        }
                        Err(Error::InvalidGrant(reason)) => {
                            warn!(%reason, "refresh token rejected, discarding stored credential");
                            self.store.delete()?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => {}
            }

            if authorizations >= self.max_reauth_attempts {
                return Err(Error::ReauthLimit(authorizations));
            }
            authorizations += 1;
            info!(attempt = authorizations, "no usable credential, starting authorization");
            current = Some(self.authorizer.authorize(&self.scopes)?);
        }
    }
}
