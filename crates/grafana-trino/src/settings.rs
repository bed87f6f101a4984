//! Data source settings, as configured in Grafana.
//!
//! Grafana stores settings in two places: `jsonData`, which is visible to the
//! frontend, and `secureJsonData`, which is encrypted and only ever decrypted
//! for the backend. [`TrinoJsonData`] and [`TrinoSecureJsonData`] mirror those,
//! and [`TrinoSettings`] is the validated combination used by the client.
use std::{collections::BTreeMap, time::Duration};

use grafana_plugin_sdk::backend::DataSourceInstanceSettings;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr, NoneAsEmptyString, PickFirst};
use thiserror::Error;
use tracing::info;

/// The user sent to Trino when basic auth is not configured.
pub const DEFAULT_USER: &str = "grafana";

/// Errors that can occur when resolving settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    /// The data source URL could not be parsed.
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl {
        /// The configured URL.
        url: String,
        /// Why parsing failed.
        reason: String,
    },

    /// Custom HTTP headers were configured.
    #[error("Custom headers are not supported and must be not set")]
    CustomHeaders,

    /// Both a static access token and OAuth client credentials were configured.
    #[error("access token must not be set within 'OAuth Trino Authentication' settings")]
    AccessTokenWithOAuth,

    /// OAuth was partially configured.
    #[error("missing parameters for 'OAuth Trino Authentication': {}", .0.join(", "))]
    MissingOAuthParameters(Vec<&'static str>),

    /// A role mapping was not of the form `catalog:role`.
    #[error("Invalid role format. expected catalog:role, got '{0}'")]
    InvalidRole(String),

    /// A client certificate was configured without its key.
    #[error("client certificate was configured without a client key")]
    ClientCertWithoutKey,
}

/// The `jsonData` of a Trino data source.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrinoJsonData {
    /// Send the logged in Grafana user as the Trino user.
    #[serde(default)]
    pub enable_impersonation: bool,

    /// The OAuth token endpoint for client credentials.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub token_url: Option<String>,

    /// The OAuth client id.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub client_id: Option<String>,

    /// The user to send along with OAuth authenticated requests.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub impersonation_user: Option<String>,

    /// Client tags sent with every query, unless overridden by the query.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub client_tags: Option<String>,

    /// Catalog roles, formatted as `catalog:role;catalog2:role2`.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub roles: Option<String>,

    /// Skip TLS certificate verification.
    #[serde(default)]
    pub tls_skip_verify: bool,

    /// Authenticate with a TLS client certificate.
    #[serde(default)]
    pub tls_auth: bool,

    /// Verify the server with a custom CA certificate.
    #[serde(default, rename = "tlsAuthWithCACert")]
    pub tls_auth_with_ca_cert: bool,

    /// HTTP timeout in seconds.
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub timeout: Option<u64>,

    /// Any other settings saved by the frontend.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// The decrypted `secureJsonData` of a Trino data source.
#[serde_as]
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrinoSecureJsonData {
    /// A static bearer token.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub access_token: Option<String>,

    /// The OAuth client secret.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub client_secret: Option<String>,

    /// The basic auth password.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub basic_auth_password: Option<String>,

    /// PEM encoded CA certificate.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default, rename = "tlsCACert")]
    pub tls_ca_cert: Option<String>,

    /// PEM encoded client certificate.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub tls_client_cert: Option<String>,

    /// PEM encoded client key.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub tls_client_key: Option<String>,
}

impl std::fmt::Debug for TrinoSecureJsonData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrinoSecureJsonData").finish_non_exhaustive()
    }
}

/// Credentials for the OAuth client credentials flow.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    /// The token endpoint.
    pub token_url: String,
    /// The client id.
    pub client_id: String,
    /// The client secret.
    pub client_secret: String,
    /// The user to send as `X-Trino-User`, if any.
    pub impersonation_user: Option<String>,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("impersonation_user", &self.impersonation_user)
            .finish_non_exhaustive()
    }
}

/// How requests to Trino are authenticated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Auth {
    /// No bearer token is configured.
    None,
    /// A static bearer token.
    AccessToken(String),
    /// Bearer tokens obtained using the OAuth client credentials flow.
    ClientCredentials(ClientCredentials),
}

/// A client certificate and its key, both PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// The certificate.
    pub cert: String,
    /// The private key.
    pub key: String,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity").finish_non_exhaustive()
    }
}

/// TLS options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// Skip certificate verification.
    pub skip_verify: bool,
    /// An additional trusted CA certificate.
    pub ca_cert: Option<String>,
    /// A client certificate to present.
    pub identity: Option<ClientIdentity>,
}

/// Validated settings for a Trino data source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrinoSettings {
    /// The coordinator URL.
    pub url: Url,
    /// The Trino user.
    pub user: String,
    /// The basic auth password, if basic auth is configured with one.
    pub password: Option<String>,
    /// Whether to send the Grafana user's login as the Trino user.
    pub enable_impersonation: bool,
    /// How to obtain bearer tokens.
    pub auth: Auth,
    /// Catalog roles.
    pub roles: BTreeMap<String, String>,
    /// Default client tags.
    pub client_tags: Option<String>,
    /// TLS options.
    pub tls: TlsSettings,
    /// HTTP timeout.
    pub timeout: Option<Duration>,
}

impl TrinoSettings {
    /// Resolve settings from a Grafana data source instance.
    pub fn from_instance(
        instance: &DataSourceInstanceSettings<TrinoJsonData, TrinoSecureJsonData>,
    ) -> Result<Self, SettingsError> {
        let basic_auth_user = instance
            .basic_auth_enabled
            .then_some(instance.basic_auth_user.as_str());
        Self::from_parts(
            &instance.url,
            basic_auth_user,
            &instance.json_data,
            &instance.decrypted_secure_json_data,
        )
    }

    /// Resolve settings from their individual parts.
    ///
    /// `basic_auth_user` should be `Some` only if basic auth is enabled.
    pub fn from_parts(
        url: &str,
        basic_auth_user: Option<&str>,
        json_data: &TrinoJsonData,
        secure: &TrinoSecureJsonData,
    ) -> Result<Self, SettingsError> {
        info!("Loading Trino data source settings");
        if json_data
            .other
            .keys()
            .any(|k| k.starts_with("httpHeaderName"))
        {
            return Err(SettingsError::CustomHeaders);
        }
        let url = Url::parse(url).map_err(|e| SettingsError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let (user, password) = match basic_auth_user {
            Some(user) => (user.to_string(), secure.basic_auth_password.clone()),
            None => (DEFAULT_USER.to_string(), None),
        };
        Ok(Self {
            url,
            user,
            password,
            enable_impersonation: json_data.enable_impersonation,
            auth: resolve_auth(json_data, secure)?,
            roles: parse_roles(json_data.roles.as_deref().unwrap_or_default())?,
            client_tags: json_data.client_tags.clone(),
            tls: resolve_tls(json_data, secure)?,
            timeout: json_data.timeout.map(Duration::from_secs),
        })
    }
}

fn resolve_auth(
    json_data: &TrinoJsonData,
    secure: &TrinoSecureJsonData,
) -> Result<Auth, SettingsError> {
    let oauth_configured = json_data.token_url.is_some()
        || json_data.client_id.is_some()
        || secure.client_secret.is_some();
    if !oauth_configured {
        return Ok(secure
            .access_token
            .clone()
            .map_or(Auth::None, Auth::AccessToken));
    }
    if secure.access_token.is_some() {
        return Err(SettingsError::AccessTokenWithOAuth);
    }
    match (
        &json_data.token_url,
        &json_data.client_id,
        &secure.client_secret,
    ) {
        (Some(token_url), Some(client_id), Some(client_secret)) => {
            Ok(Auth::ClientCredentials(ClientCredentials {
                token_url: token_url.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                impersonation_user: json_data.impersonation_user.clone(),
            }))
        }
        (token_url, client_id, client_secret) => {
            let missing = [
                (token_url.is_none(), "Token URL"),
                (client_id.is_none(), "Client id"),
                (client_secret.is_none(), "Client secret"),
            ]
            .into_iter()
            .filter_map(|(missing, name)| missing.then_some(name))
            .collect();
            Err(SettingsError::MissingOAuthParameters(missing))
        }
    }
}

fn resolve_tls(
    json_data: &TrinoJsonData,
    secure: &TrinoSecureJsonData,
) -> Result<TlsSettings, SettingsError> {
    let ca_cert = if json_data.tls_auth_with_ca_cert {
        secure.tls_ca_cert.clone()
    } else {
        None
    };
    let identity = match (json_data.tls_auth, &secure.tls_client_cert) {
        (true, Some(cert)) => {
            let key = secure
                .tls_client_key
                .clone()
                .ok_or(SettingsError::ClientCertWithoutKey)?;
            Some(ClientIdentity {
                cert: cert.clone(),
                key,
            })
        }
        _ => None,
    };
    Ok(TlsSettings {
        skip_verify: json_data.tls_skip_verify,
        ca_cert,
        identity,
    })
}

/// Parse catalog roles of the form `catalog:role;catalog2:role2`.
///
/// Whitespace around catalogs and roles is ignored, and pairs with an empty
/// catalog or role are skipped.
pub fn parse_roles(roles: &str) -> Result<BTreeMap<String, String>, SettingsError> {
    let mut parsed = BTreeMap::new();
    if roles.trim().is_empty() {
        return Ok(parsed);
    }
    for pair in roles.split(';') {
        let (catalog, role) = pair
            .split_once(':')
            .ok_or_else(|| SettingsError::InvalidRole(pair.to_string()))?;
        let (catalog, role) = (catalog.trim(), role.trim());
        if !catalog.is_empty() && !role.is_empty() {
            parsed.insert(catalog.to_string(), role.to_string());
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn json_data(value: Value) -> TrinoJsonData {
        serde_json::from_value(value).unwrap()
    }

    fn secure(value: Value) -> TrinoSecureJsonData {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn defaults_to_grafana_user() {
        let settings = TrinoSettings::from_parts(
            "http://localhost:8080",
            None,
            &TrinoJsonData::default(),
            &TrinoSecureJsonData::default(),
        )
        .unwrap();
        assert_eq!(settings.user, "grafana");
        assert_eq!(settings.password, None);
        assert_eq!(settings.auth, Auth::None);
        assert_eq!(settings.url.as_str(), "http://localhost:8080/");
    }

    #[test]
    fn basic_auth_user_and_password() {
        let settings = TrinoSettings::from_parts(
            "https://trino.example.com",
            Some("alice"),
            &TrinoJsonData::default(),
            &secure(json!({"basicAuthPassword": "s3cret"})),
        )
        .unwrap();
        assert_eq!(settings.user, "alice");
        assert_eq!(settings.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn empty_strings_are_absent() {
        let jd = json_data(json!({
            "tokenUrl": "",
            "clientId": "",
            "clientTags": "",
            "roles": "",
        }));
        let settings = TrinoSettings::from_parts(
            "http://localhost:8080",
            None,
            &jd,
            &secure(json!({"accessToken": "abc", "clientSecret": ""})),
        )
        .unwrap();
        assert_eq!(settings.auth, Auth::AccessToken("abc".to_string()));
        assert_eq!(settings.client_tags, None);
        assert!(settings.roles.is_empty());
    }

    #[test]
    fn oauth_client_credentials() {
        let jd = json_data(json!({
            "tokenUrl": "http://idp/token",
            "clientId": "grafana",
            "impersonationUser": "svc",
        }));
        let settings = TrinoSettings::from_parts(
            "http://localhost:8080",
            None,
            &jd,
            &secure(json!({"clientSecret": "shh"})),
        )
        .unwrap();
        assert_eq!(
            settings.auth,
            Auth::ClientCredentials(ClientCredentials {
                token_url: "http://idp/token".to_string(),
                client_id: "grafana".to_string(),
                client_secret: "shh".to_string(),
                impersonation_user: Some("svc".to_string()),
            })
        );
    }

    #[test]
    fn oauth_rejects_access_token() {
        let jd = json_data(json!({"clientId": "grafana"}));
        let err = TrinoSettings::from_parts(
            "http://localhost:8080",
            None,
            &jd,
            &secure(json!({"accessToken": "abc"})),
        )
        .unwrap_err();
        assert_eq!(err, SettingsError::AccessTokenWithOAuth);
    }

    #[test]
    fn oauth_lists_missing_parameters() {
        let jd = json_data(json!({"clientId": "grafana"}));
        let err = TrinoSettings::from_parts(
            "http://localhost:8080",
            None,
            &jd,
            &TrinoSecureJsonData::default(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing parameters for 'OAuth Trino Authentication': Token URL, Client secret"
        );
    }

    #[test]
    fn rejects_custom_headers() {
        let jd = json_data(json!({"httpHeaderName1": "X-Foo"}));
        let err = TrinoSettings::from_parts(
            "http://localhost:8080",
            None,
            &jd,
            &TrinoSecureJsonData::default(),
        )
        .unwrap_err();
        assert_eq!(err, SettingsError::CustomHeaders);
    }

    #[test]
    fn rejects_invalid_url() {
        let err = TrinoSettings::from_parts(
            "not a url",
            None,
            &TrinoJsonData::default(),
            &TrinoSecureJsonData::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SettingsError::InvalidUrl { .. }));
    }

    #[test]
    fn timeout_accepts_number_or_string() {
        assert_eq!(json_data(json!({"timeout": 30})).timeout, Some(30));
        assert_eq!(json_data(json!({"timeout": "45"})).timeout, Some(45));
    }

    #[test]
    fn client_cert_requires_key() {
        let jd = json_data(json!({"tlsAuth": true}));
        let err = TrinoSettings::from_parts(
            "https://localhost:8443",
            None,
            &jd,
            &secure(json!({"tlsClientCert": "-----BEGIN CERTIFICATE-----"})),
        )
        .unwrap_err();
        assert_eq!(err, SettingsError::ClientCertWithoutKey);
    }

    #[test]
    fn roles() {
        assert!(parse_roles("  ").unwrap().is_empty());
        let roles = parse_roles("hive: admin ;system:reader; :skipped").unwrap();
        assert_eq!(
            roles,
            BTreeMap::from([
                ("hive".to_string(), "admin".to_string()),
                ("system".to_string(), "reader".to_string()),
            ])
        );
        assert_eq!(
            parse_roles("hive").unwrap_err().to_string(),
            "Invalid role format. expected catalog:role, got 'hive'"
        );
    }
}
