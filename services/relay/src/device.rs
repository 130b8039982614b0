//! Camera device model: identity, endpoint construction and the
//! failure-count state machine that decides when a camera is disabled.

use bytes::Bytes;
use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Errors raised while constructing a device from a roster entry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid camera address {address}: {message}")]
    InvalidAddress { address: String, message: String },

    #[error("Model class {0} requires camera credentials but none are configured")]
    MissingCredentials(String),
}

/// Camera credentials supplied by configuration.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Known camera families. Anything unrecognised is kept verbatim in `Other`
/// and served by the default snapshot template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelClass {
    Advidia,
    Hikvision,
    Other(String),
}

impl ModelClass {
    /// Parse a roster model name (case-insensitive).
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_lowercase().as_str() {
            "advidia" => ModelClass::Advidia,
            "hikvision" => ModelClass::Hikvision,
            _ => ModelClass::Other(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ModelClass::Advidia => "advidia",
            ModelClass::Hikvision => "hikvision",
            ModelClass::Other(name) => name,
        }
    }
}

/// How a request to the camera is authenticated. Resolved once when the
/// device is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// Basic credentials are already part of the endpoint URL.
    EmbeddedBasicAuth,
    /// HTTP digest challenge/response with the given credentials.
    DigestAuth(Credentials),
    NoAuth,
}

/// Classified reason for a failed cycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connect error, timeout or broken body.
    Network,
    /// HTTP 5xx from the camera.
    Server,
    /// HTTP 4xx from the camera. Will not resolve by retrying.
    Client,
    /// The camera answered with something that is not an image.
    ContentType,
    /// The object store write failed.
    Publish,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Server => "server",
            FailureKind::Client => "client",
            FailureKind::ContentType => "content_type",
            FailureKind::Publish => "publish",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the next publish step should write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingPublish {
    /// Fresh image from the last fetch.
    Image(Bytes),
    /// Placeholder, because no fresh image is available.
    Fallback(Bytes),
    /// The fallback is already live and nothing newer exists.
    Skip,
}

/// One polled camera and its runtime state.
///
/// A `Device` is owned by exactly one task at a time; the scheduler moves it
/// between workers, so none of the mutating methods need locking.
#[derive(Debug)]
pub struct Device {
    id: String,
    address: String,
    model: ModelClass,
    endpoint: Url,
    auth: AuthScheme,
    last_image: Option<Bytes>,
    fallback_image: Bytes,
    fallback_published: bool,
    consecutive_failures: u32,
    failure_limit: u32,
}

impl Device {
    /// Build a device from raw roster values.
    pub fn new(
        id: &str,
        address: &str,
        model: &str,
        fallback_image: Bytes,
        failure_limit: u32,
        credentials: Option<&Credentials>,
    ) -> Result<Self, DeviceError> {
        let id = non_empty(id, "id")?;
        let address = non_empty(address, "address")?;
        let model = ModelClass::parse(non_empty(model, "model")?);

        let (endpoint, auth) = build_endpoint(address, &model, credentials)?;

        Ok(Self {
            id: id.to_string(),
            address: address.to_string(),
            model,
            endpoint,
            auth,
            last_image: None,
            fallback_image,
            fallback_published: false,
            consecutive_failures: 0,
            failure_limit,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn model(&self) -> &ModelClass {
        &self.model
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Endpoint with any embedded password masked, for logs.
    pub fn endpoint_redacted(&self) -> String {
        let mut url = self.endpoint.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("***"));
        }
        url.to_string()
    }

    pub fn auth(&self) -> &AuthScheme {
        &self.auth
    }

    pub fn last_image(&self) -> Option<&Bytes> {
        self.last_image.as_ref()
    }

    pub fn fallback_published(&self) -> bool {
        self.fallback_published
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn failure_limit(&self) -> u32 {
        self.failure_limit
    }

    pub fn is_disabled(&self) -> bool {
        self.consecutive_failures >= self.failure_limit
    }

    /// Drop the previous image so a failed fetch can never republish it.
    pub fn begin_fetch(&mut self) {
        self.last_image = None;
    }

    pub fn record_success(&mut self, image: Bytes) {
        self.last_image = Some(image);
        self.consecutive_failures = 0;
    }

    /// Count a failure. Returns `true` when this call disabled the device.
    pub fn record_failure(&mut self, kind: FailureKind) -> bool {
        let was_disabled = self.is_disabled();

        self.consecutive_failures = match kind {
            FailureKind::Client => self.failure_limit,
            _ => self
                .consecutive_failures
                .saturating_add(1)
                .min(self.failure_limit),
        };

        !was_disabled && self.is_disabled()
    }

    pub fn pending_publish(&self) -> PendingPublish {
        match &self.last_image {
            Some(image) => PendingPublish::Image(image.clone()),
            None if self.fallback_published => PendingPublish::Skip,
            None => PendingPublish::Fallback(self.fallback_image.clone()),
        }
    }

    /// Record a confirmed store write.
    pub fn mark_published(&mut self, wrote_fallback: bool) {
        self.fallback_published = wrote_fallback;
    }
}

fn non_empty<'a>(value: &'a str, field: &'static str) -> Result<&'a str, DeviceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DeviceError::MissingField(field));
    }
    Ok(trimmed)
}

/// Derive the snapshot URL and auth scheme for a camera.
///
/// | model       | path                                   | auth              |
/// |-------------|----------------------------------------|-------------------|
/// | `advidia`   | `/ISAPI/Streaming/channels/101/picture` | basic, in the URL |
/// | `hikvision` | `/ISAPI/Streaming/channels/101/picture` | digest            |
/// | other       | `/jpeg?id=2`                           | none              |
pub fn build_endpoint(
    address: &str,
    model: &ModelClass,
    credentials: Option<&Credentials>,
) -> Result<(Url, AuthScheme), DeviceError> {
    let path = match model {
        ModelClass::Advidia | ModelClass::Hikvision => "/ISAPI/Streaming/channels/101/picture",
        ModelClass::Other(_) => "/jpeg?id=2",
    };

    let mut url = Url::parse(&format!("http://{}{}", address, path)).map_err(|e| {
        DeviceError::InvalidAddress {
            address: address.to_string(),
            message: e.to_string(),
        }
    })?;

    let auth = match model {
        ModelClass::Advidia => {
            let creds = credentials
                .ok_or_else(|| DeviceError::MissingCredentials(model.as_str().to_string()))?;
            // Url percent-encodes userinfo
            url.set_username(&creds.username)
                .and_then(|_| url.set_password(Some(&creds.password)))
                .map_err(|_| DeviceError::InvalidAddress {
                    address: address.to_string(),
                    message: "address cannot carry credentials".to_string(),
                })?;
            AuthScheme::EmbeddedBasicAuth
        }
        ModelClass::Hikvision => {
            let creds = credentials
                .ok_or_else(|| DeviceError::MissingCredentials(model.as_str().to_string()))?;
            AuthScheme::DigestAuth(creds.clone())
        }
        ModelClass::Other(_) => AuthScheme::NoAuth,
    };

    Ok((url, auth))
}
