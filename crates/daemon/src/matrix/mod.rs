//! Homeserver client
//!
//! [`MatrixClient`] implements the engine's [`RoomStateProvider`] on top of
//! the Matrix client-server API: records are state events of type
//! `matrixfs.entry` keyed by path, catch-up is a full-state `/sync`, and the
//! live feed is a `/sync` long-poll restricted to the mounted room.

mod types;

pub use types::{StateEvent, SyncResponse, POWER_LEVELS_TYPE};

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use url::Url;

use common::auth::PowerLevels;
use common::entry::{StateRecord, RECORD_TYPE};
use common::remote::{RemoteError, RemoteRecord, RoomEvent, RoomStateProvider};

use crate::config::Credentials;
use types::{
    LoginRequest, LoginResponse, MatrixErrorBody, SendResponse, UserIdentifier, WhoAmI,
};

/// How long the homeserver may hold a `/sync` request open
pub const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("homeserver returned {status} {errcode}: {message}")]
    Api {
        status: u16,
        errcode: String,
        message: String,
    },
    #[error("cannot build request url from {0}")]
    Url(String),
}

impl From<MatrixError> for RemoteError {
    fn from(err: MatrixError) -> Self {
        match err {
            MatrixError::Http(err) if err.is_decode() => RemoteError::Malformed(err.to_string()),
            MatrixError::Http(err) => RemoteError::Transport(err.to_string()),
            MatrixError::Api {
                status,
                errcode,
                message,
            } => RemoteError::Rejected {
                status,
                message: format!("{}: {}", errcode, message),
            },
            MatrixError::Url(url) => RemoteError::Transport(format!("bad url {}", url)),
        }
    }
}

pub struct MatrixClient {
    homeserver: Url,
    room: String,
    user_id: String,
    access_token: String,
    http: Client,
    filter: String,
    /// `next_batch` of the last `/sync`
    since: Mutex<Option<String>>,
}

impl std::fmt::Debug for MatrixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixClient")
            .field("homeserver", &self.homeserver.as_str())
            .field("room", &self.room)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl MatrixClient {
    /// Authenticate and return a client bound to `room`
    pub async fn connect(
        homeserver: &Url,
        room: &str,
        credentials: &Credentials,
    ) -> Result<Self, MatrixError> {
        let http = Self::http_client()?;
        let mut client = Self::with_token(homeserver, room, "", "", http);

        match credentials {
            Credentials::Password { user, password } => {
                let request = LoginRequest {
                    kind: "m.login.password",
                    identifier: UserIdentifier {
                        kind: "m.id.user",
                        user,
                    },
                    password,
                    initial_device_display_name: "matrixfs",
                };
                let url = client.endpoint(&["login"])?;
                let response: LoginResponse =
                    Self::send(client.http.post(url).json(&request)).await?;
                client.access_token = response.access_token;
                client.user_id = response.user_id;
            }
            Credentials::AccessToken(token) => {
                client.access_token = token.clone();
                let url = client.endpoint(&["account", "whoami"])?;
                let response: WhoAmI = client.authed(client.http.get(url)).await?;
                client.user_id = response.user_id;
            }
        }

        tracing::info!(
            "connected to {} as {}",
            client.homeserver,
            client.user_id
        );
        Ok(client)
    }

    /// A client for an already known session; does no I/O
    pub fn with_token(
        homeserver: &Url,
        room: &str,
        user_id: &str,
        access_token: &str,
        http: Client,
    ) -> Self {
        Self {
            homeserver: homeserver.clone(),
            room: room.to_string(),
            user_id: user_id.to_string(),
            access_token: access_token.to_string(),
            http,
            filter: types::sync_filter(room).to_string(),
            since: Mutex::new(None),
        }
    }

    pub fn http_client() -> Result<Client, MatrixError> {
        Ok(Client::builder()
            .timeout(POLL_TIMEOUT + REQUEST_SLACK)
            .user_agent(concat!("matrixfs/", env!("CARGO_PKG_VERSION")))
            .build()?)
    }

    /* Getters */

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /* Requests */

    /// `{homeserver}/_matrix/client/v3/{segments..}`, each segment escaped
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, MatrixError> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| MatrixError::Url(self.homeserver.to_string()))?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        Ok(url)
    }

    pub fn state_url(&self, event_type: &str, key: &str) -> Result<Url, MatrixError> {
        self.endpoint(&["rooms", self.room.as_str(), "state", event_type, key])
    }

    async fn authed<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, MatrixError> {
        Self::send(request.bearer_auth(&self.access_token)).await
    }

    /// Like [`Self::authed`], but a 404 is an absent resource
    async fn authed_optional<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Option<T>, MatrixError> {
        match self.authed(request).await {
            Ok(value) => Ok(Some(value)),
            Err(MatrixError::Api { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, MatrixError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body: MatrixErrorBody = response.json().await.unwrap_or_default();
        Err(MatrixError::Api {
            status: status.as_u16(),
            errcode: body.errcode,
            message: if body.error.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body.error
            },
        })
    }

    async fn put_state(
        &self,
        key: &str,
        content: &serde_json::Value,
    ) -> Result<Option<String>, MatrixError> {
        let url = self.state_url(RECORD_TYPE, key)?;
        let response: SendResponse = self.authed(self.http.put(url).json(content)).await?;
        Ok(response.event_id)
    }

    async fn sync(&self, since: Option<&str>, timeout: Duration) -> Result<Vec<RoomEvent>, MatrixError> {
        let url = self.endpoint(&["sync"])?;
        let timeout_ms = timeout.as_millis().to_string();
        let mut query = vec![("filter", self.filter.as_str()), ("timeout", timeout_ms.as_str())];
        match since {
            Some(since) => query.push(("since", since)),
            None => query.push(("full_state", "true")),
        }

        let response: SyncResponse = self.authed(self.http.get(url).query(&query)).await?;
        *self.since.lock() = Some(response.next_batch.clone());
        Ok(response.room_events(&self.room))
    }
}

#[async_trait]
impl RoomStateProvider for MatrixClient {
    fn actor(&self) -> &str {
        &self.user_id
    }

    async fn put_record(&self, key: &str, record: &StateRecord) -> Result<Option<String>, RemoteError> {
        tracing::debug!("PUT state {}", key);
        Ok(self.put_state(key, &record.to_content()).await?)
    }

    async fn delete_record(&self, key: &str) -> Result<Option<String>, RemoteError> {
        tracing::debug!("clearing state {}", key);
        let empty = serde_json::Value::Object(Default::default());
        Ok(self.put_state(key, &empty).await?)
    }

    async fn get_record(&self, key: &str) -> Result<Option<RemoteRecord>, RemoteError> {
        let url = self
            .state_url(RECORD_TYPE, key)
            .map_err(RemoteError::from)?;
        let request = self.http.get(url).query(&[("format", "event")]);
        let Some(body) = self
            .authed_optional::<serde_json::Value>(request)
            .await?
        else {
            return Ok(None);
        };

        // Servers without `format=event` hand back the bare content
        let (content, meta) = match serde_json::from_value::<StateEvent>(body.clone()) {
            Ok(event) if event.state_key.is_some() => {
                let meta = event.meta();
                (event.content, meta)
            }
            _ => (body, Default::default()),
        };

        let record = StateRecord::from_content(&content)
            .map_err(|err| RemoteError::Malformed(format!("{}: {}", key, err)))?;
        Ok(record.map(|record| RemoteRecord { record, meta }))
    }

    async fn power_levels(&self) -> Result<Option<PowerLevels>, RemoteError> {
        let url = self
            .state_url(POWER_LEVELS_TYPE, "")
            .map_err(RemoteError::from)?;
        Ok(self.authed_optional(self.http.get(url)).await?)
    }

    async fn catch_up(&self) -> Result<Vec<RoomEvent>, RemoteError> {
        let events = self.sync(None, Duration::ZERO).await?;
        tracing::info!("fetched {} state events from {}", events.len(), self.room);
        Ok(events)
    }

    async fn poll(&self) -> Result<Vec<RoomEvent>, RemoteError> {
        let since = self.since.lock().clone();
        Ok(self.sync(since.as_deref(), POLL_TIMEOUT).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MatrixClient {
        MatrixClient::with_token(
            &Url::parse("https://matrix.example.org").unwrap(),
            "!room:example.org",
            "@me:example.org",
            "secret",
            Client::new(),
        )
    }

    #[test]
    fn test_state_key_slashes_are_escaped() {
        let url = client().state_url(RECORD_TYPE, "/dir/file.txt").unwrap();
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!room:example.org/state/matrixfs.entry/%2Fdir%2Ffile.txt"
        );
    }

    #[test]
    fn test_power_levels_url_has_empty_key() {
        let url = client().state_url(POWER_LEVELS_TYPE, "").unwrap();
        assert!(url.path().ends_with("/state/m.room.power_levels/"));
    }

    #[test]
    fn test_homeserver_path_prefix_is_kept() {
        let client = MatrixClient::with_token(
            &Url::parse("https://example.org/matrix/").unwrap(),
            "!r:example.org",
            "@me:example.org",
            "secret",
            Client::new(),
        );
        let url = client.endpoint(&["sync"]).unwrap();
        assert_eq!(url.path(), "/matrix/_matrix/client/v3/sync");
    }

    #[test]
    fn test_debug_hides_token() {
        let printed = format!("{:?}", client());
        assert!(!printed.contains("secret"));
        assert!(printed.contains("@me:example.org"));
    }

    #[test]
    fn test_api_errors_become_rejections() {
        let err: RemoteError = MatrixError::Api {
            status: 403,
            errcode: "M_FORBIDDEN".to_string(),
            message: "You don't have permission".to_string(),
        }
        .into();
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 403,
                message: "M_FORBIDDEN: You don't have permission".to_string()
            }
        );
    }
}
