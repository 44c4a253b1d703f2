use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config;

use super::{AccessError, AccessProvider};

/// key: access-gateway-plex -> shared-server invites and friend removal
#[derive(Clone)]
pub struct PlexGateway {
    http: reqwest::Client,
    api_base: String,
    server_url: String,
    token: String,
    machine_id: String,
    client_identifier: String,
}

impl PlexGateway {
    pub fn new(
        api_base: impl Into<String>,
        server_url: impl Into<String>,
        token: impl Into<String>,
        machine_id: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            machine_id: machine_id.into(),
            client_identifier: "gatekeeper".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, AccessError> {
        let token = config::PLEX_TOKEN
            .clone()
            .ok_or_else(|| AccessError::Transport("PLEX_TOKEN is not configured".into()))?;
        let machine_id = config::PLEX_MACHINE_ID
            .clone()
            .ok_or_else(|| AccessError::Transport("PLEX_MACHINE_ID is not configured".into()))?;
        let mut gateway = Self::new(
            config::PLEX_API_BASE.as_str(),
            config::PLEX_SERVER_URL.as_str(),
            token,
            machine_id,
        );
        gateway.client_identifier = config::PLEX_CLIENT_IDENTIFIER.clone();
        Ok(gateway)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("X-Plex-Token", &self.token)
            .header("X-Plex-Client-Identifier", &self.client_identifier)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn sections(&self) -> Result<Vec<LibrarySection>, AccessError> {
        let url = format!("{}/library/sections", self.server_url);
        let response = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(AccessError::Transport(format!(
                "library listing failed with {}",
                response.status()
            )));
        }
        let body: SectionsEnvelope = response.json().await.map_err(transport)?;
        Ok(body.media_container.directory)
    }

    async fn friends(&self) -> Result<Vec<Friend>, AccessError> {
        let url = format!("{}/api/v2/friends", self.api_base);
        let response = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(AccessError::Transport(format!(
                "friend listing failed with {}",
                response.status()
            )));
        }
        response.json().await.map_err(transport)
    }
}

#[async_trait]
impl AccessProvider for PlexGateway {
    async fn grant(
        &self,
        identity: &str,
        collections: &[String],
        allow_downloads: bool,
    ) -> Result<(), AccessError> {
        let section_ids: Vec<String> = self
            .sections()
            .await?
            .into_iter()
            .filter(|section| collections.iter().any(|name| name == &section.title))
            .map(|section| section.key)
            .collect();
        let shared = section_ids.len();
        if shared < collections.len() {
            warn!(
                identity,
                requested = collections.len(),
                resolved = shared,
                "some collections are not present on the media server"
            );
        }

        let url = format!(
            "{}/api/servers/{}/shared_servers",
            self.api_base, self.machine_id
        );
        let payload = json!({
            "server_id": self.machine_id,
            "shared_server": {
                "library_section_ids": section_ids,
                "invited_email": identity,
            },
            "sharing_settings": {
                "allowSync": if allow_downloads { "1" } else { "0" },
            },
        });
        let response = self
            .authorized(self.http.post(url))
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            info!(identity, collections = shared, "shared server invite sent");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_grant_failure(status, &body))
    }

    async fn revoke(&self, identity: &str) -> Result<(), AccessError> {
        let needle = identity.to_lowercase();
        let friend = self.friends().await?.into_iter().find(|friend| {
            [&friend.username, &friend.email, &friend.title]
                .into_iter()
                .flatten()
                .any(|value| value.to_lowercase() == needle)
        });
        let Some(friend) = friend else {
            debug!(identity, "no shared access to revoke");
            return Ok(());
        };

        let url = format!("{}/api/v2/friends/{}", self.api_base, friend.id);
        let response = self
            .authorized(self.http.delete(url))
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            status if status.is_success() => {
                info!(identity, friend_id = friend.id, "shared access removed");
                Ok(())
            }
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(AccessError::Transport(format!(
                "friend removal failed with {status}"
            ))),
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>, AccessError> {
        Ok(self
            .sections()
            .await?
            .into_iter()
            .map(|section| section.title)
            .collect())
    }
}

fn transport(err: reqwest::Error) -> AccessError {
    AccessError::Transport(err.to_string())
}

fn classify_grant_failure(status: StatusCode, body: &str) -> AccessError {
    let lowered = body.to_lowercase();
    if lowered.contains("already") {
        return AccessError::AlreadyGranted;
    }
    if status == StatusCode::NOT_FOUND
        || lowered.contains("not found")
        || lowered.contains("could not be found")
    {
        return AccessError::UserNotFound;
    }
    AccessError::Transport(format!("invite rejected with {status}: {body}"))
}

#[derive(Debug, Deserialize)]
struct SectionsEnvelope {
    #[serde(rename = "MediaContainer")]
    media_container: SectionsContainer,
}

#[derive(Debug, Deserialize)]
struct SectionsContainer {
    #[serde(rename = "Directory", default)]
    directory: Vec<LibrarySection>,
}

#[derive(Debug, Deserialize)]
struct LibrarySection {
    key: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct Friend {
    id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    title: Option<String>,
}
