//! Authorization of private and presence channel subscriptions.
//!
//! Before subscribing to a `private-` or `presence-` channel the client obtains a
//! signature over `socket_id:channel_name` from an [`Authorizer`]. Usually that is the
//! application's own backend, reached through [`HttpAuthorizer`]; trusted environments
//! holding the application secret can sign locally with [`SigningAuthorizer`].

use std::collections::HashMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use bon::Builder;
use hmac::{Hmac, Mac as _};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;
use url::Url;

use super::ChannelKind;
use crate::Result;
use crate::error::{Error, Kind};

/// Authorization ticket sent along with the subscribe frame.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    pub auth: String,
    /// JSON-encoded member data, required for presence channels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

impl AuthData {
    #[must_use]
    pub fn new<S: Into<String>>(auth: S, channel_data: Option<String>) -> Self {
        Self {
            auth: auth.into(),
            channel_data,
        }
    }
}

/// Produces [`AuthData`] for a channel subscription.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn authorize(&self, socket_id: &str, channel_name: &str) -> Result<AuthData>;
}

/// Settings for the [`HttpAuthorizer`] a client creates by default.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Builder)]
pub struct AuthConfig {
    /// Absolute URL of the auth endpoint. Without one, private and presence channels
    /// need a custom [`Authorizer`].
    pub endpoint: Option<Url>,
    /// Extra request headers
    #[builder(default)]
    pub headers: HashMap<String, String>,
    /// Extra form parameters sent after `socket_id` and `channel_name`
    #[builder(default)]
    pub params: Vec<(String, String)>,
}

/// Posts `socket_id` and `channel_name` as a form to an auth endpoint, which answers
/// with the JSON encoding of [`AuthData`].
#[derive(Debug, Clone)]
pub struct HttpAuthorizer {
    client: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    params: Vec<(String, String)>,
}

impl HttpAuthorizer {
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            headers: HeaderMap::new(),
            params: Vec::new(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| Error::validation("auth endpoint is not configured"))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }

        Ok(Self {
            headers,
            params: config.params.clone(),
            ..Self::new(endpoint)
        })
    }

    /// Use `client` for requests, e.g. to share a connection pool.
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, socket_id: &str, channel_name: &str) -> Result<AuthData> {
        let mut form = vec![("socket_id", socket_id), ("channel_name", channel_name)];
        form.extend(
            self.params
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        );
        let body = serde_html_form::to_string(&form)
            .map_err(|e| Error::with_source(Kind::Internal, e))?;

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            #[cfg(feature = "tracing")]
            tracing::warn!(%status, channel = channel_name, "Auth endpoint refused subscription");
            return Err(Error::authorization(Some(status), text));
        }

        serde_json::from_str(&text).map_err(|e| {
            Error::authorization(Some(status), format!("unexpected auth response: {e}"))
        })
    }
}

/// Signs subscriptions locally with the application secret.
///
/// Only for environments trusted with the secret, such as servers and tests.
#[derive(Debug, Clone)]
pub struct SigningAuthorizer {
    key: String,
    secret: SecretString,
    member: Option<Value>,
}

impl SigningAuthorizer {
    #[must_use]
    pub fn new<K: Into<String>, S: Into<String>>(key: K, secret: S) -> Self {
        Self {
            key: key.into(),
            secret: SecretString::from(secret.into()),
            member: None,
        }
    }

    /// Member identity announced on presence channels.
    #[must_use]
    pub fn with_member<S: Into<String>>(mut self, user_id: S, user_info: Value) -> Self {
        self.member = Some(json!({ "user_id": user_id.into(), "user_info": user_info }));
        self
    }

    /// `key:signature` over `socket_id:channel_name[:channel_data]`.
    pub fn sign(
        &self,
        socket_id: &str,
        channel_name: &str,
        channel_data: Option<&str>,
    ) -> Result<String> {
        let mut message = format!("{socket_id}:{channel_name}");
        if let Some(channel_data) = channel_data {
            message.push(':');
            message.push_str(channel_data);
        }

        Ok(format!("{}:{}", self.key, hmac(&self.secret, &message)?))
    }
}

#[async_trait]
impl Authorizer for SigningAuthorizer {
    async fn authorize(&self, socket_id: &str, channel_name: &str) -> Result<AuthData> {
        let channel_data = match (ChannelKind::from_name(channel_name), &self.member) {
            (ChannelKind::Presence, Some(member)) => Some(member.to_string()),
            (ChannelKind::Presence, None) => {
                return Err(Error::authorization(
                    None,
                    "presence channels need a member identity",
                ));
            }
            _ => None,
        };
        let auth = self.sign(socket_id, channel_name, channel_data.as_deref())?;

        Ok(AuthData { auth, channel_data })
    }
}

/// Hex-encoded HMAC-SHA256.
fn hmac(secret: &SecretString, message: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| Error::validation(format!("invalid signing secret: {e}")))?;
    mac.update(message.as_bytes());

    let result = mac.finalize().into_bytes();
    Ok(result
        .iter()
        .fold(String::with_capacity(result.len() * 2), |mut hex, byte| {
            _ = write!(hex, "{byte:02x}");
            hex
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "278d425bdf160c739803";
    const SECRET: &str = "7ad3773142a6692b25b8";

    #[test]
    fn private_channel_signature_matches_reference() {
        let authorizer = SigningAuthorizer::new(KEY, SECRET);

        let auth = authorizer
            .sign("1234.1234", "private-foobar", None)
            .unwrap();

        assert_eq!(
            auth,
            "278d425bdf160c739803:58df8b0c36d6982b82c3ecf6b4662e34fe8c25bba48f5369f135bf843651c3a4"
        );
    }

    #[tokio::test]
    async fn presence_channel_signs_member_data() {
        let authorizer = SigningAuthorizer::new(KEY, SECRET)
            .with_member("10", json!({ "name": "Mr. Channels" }));

        let data = authorizer
            .authorize("1234.1234", "presence-foobar")
            .await
            .unwrap();

        assert_eq!(
            data.channel_data.as_deref(),
            Some(r#"{"user_id":"10","user_info":{"name":"Mr. Channels"}}"#)
        );
        assert_eq!(
            data.auth,
            "278d425bdf160c739803:4c6d8fc42a207ba96a0779844171b0bb819d96ffceef9609f5cce596ab17a800"
        );
    }

    #[tokio::test]
    async fn presence_without_member_is_refused() {
        let authorizer = SigningAuthorizer::new(KEY, SECRET);

        let error = authorizer
            .authorize("1.1", "presence-room")
            .await
            .unwrap_err();

        assert_eq!(error.kind(), Kind::Authorization);
    }

    #[test]
    fn http_authorizer_requires_endpoint() {
        let error = HttpAuthorizer::from_config(&AuthConfig::default()).unwrap_err();

        assert_eq!(error.kind(), Kind::Validation);
    }

    #[test]
    fn http_authorizer_rejects_invalid_headers() {
        let config = AuthConfig::builder()
            .endpoint(Url::parse("https://example.com/pusher/auth").unwrap())
            .headers(HashMap::from([("bad header".to_owned(), "v".to_owned())]))
            .build();

        let error = HttpAuthorizer::from_config(&config).unwrap_err();
        assert_eq!(error.kind(), Kind::Internal);
    }

    #[test]
    fn auth_data_omits_missing_channel_data() {
        let encoded = serde_json::to_value(AuthData::new("k:s", None)).unwrap();

        assert_eq!(encoded, json!({ "auth": "k:s" }));
    }
}
