//! REST client for the Discord HTTP API (v10)
//!
//! Only the endpoints the resource engine needs are wrapped. Error statuses
//! map onto [`BotError`]: 404 becomes `NotFound` so callers can treat it as
//! drift, 429 becomes a terminal `Platform` error (pacing is the caller's job).

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    ChannelInfo, ChannelSpec, ChannelType, MemberInfo, Overwrite, Permissions, Platform,
    RoleInfo, RoleSpec,
};
use crate::types::{BotError, ChannelId, Result, RoleId};

/// Page size of the member listing endpoint
const MEMBER_PAGE_SIZE: usize = 1000;

/// Overwrite target type for roles
const OVERWRITE_ROLE: u8 = 0;

#[derive(Debug, Clone)]
pub struct DiscordHttpConfig {
    pub api_url: String,
    pub token: String,
    pub request_timeout: Duration,
}

impl DiscordHttpConfig {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// [`Platform`] implementation talking to the Discord REST API
pub struct DiscordHttp {
    config: DiscordHttpConfig,
    http_client: reqwest::Client,
    bot_user_id: Option<String>,
}

impl DiscordHttp {
    pub fn new(config: DiscordHttpConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent("DiscordBot (studybot, 0.1)")
            .build()
            .unwrap_or_default();

        Self {
            config,
            http_client,
            bot_user_id: None,
        }
    }

    /// Create the client and resolve the bot's own user ID
    pub async fn connect(config: DiscordHttpConfig) -> Result<Self> {
        let mut client = Self::new(config);
        let me: RawUser = client
            .send_json(client.request(Method::GET, "/users/@me"))
            .await?;
        info!(bot_user_id = %me.id, "Authenticated against platform API");
        client.bot_user_id = Some(me.id);
        Ok(client)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http_client
            .request(method, format!("{}{}", self.config.api_url, path))
            .header("Authorization", format!("Bot {}", self.config.token))
    }

    fn with_reason(builder: RequestBuilder, reason: &str) -> RequestBuilder {
        if reason.is_empty() {
            builder
        } else {
            builder.header("X-Audit-Log-Reason", urlencoding::encode(reason).into_owned())
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().path().to_string();
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &url, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| BotError::Platform(format!("invalid response body: {}", e)))
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<()> {
        self.send(builder).await.map(|_| ())
    }

    /// Probe for a single object, mapping 404 to `None`
    async fn probe<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<Option<T>> {
        match self.send_json(builder).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn patch_member_roles(
        &self,
        guild_id: &str,
        member_id: &str,
        roles: Vec<RoleId>,
        reason: &str,
    ) -> Result<()> {
        let builder = self
            .request(
                Method::PATCH,
                &format!("/guilds/{}/members/{}", guild_id, member_id),
            )
            .json(&json!({ "roles": roles }));
        self.send_empty(Self::with_reason(builder, reason)).await
    }

    async fn require_member(&self, guild_id: &str, member_id: &str) -> Result<MemberInfo> {
        self.member(guild_id, member_id)
            .await?
            .ok_or_else(|| BotError::NotFound(format!("member {}", member_id)))
    }
}

fn status_error(status: StatusCode, path: &str, body: &str) -> BotError {
    match status {
        StatusCode::NOT_FOUND => BotError::NotFound(path.to_string()),
        StatusCode::TOO_MANY_REQUESTS => {
            warn!(path = %path, "Rate limited by platform");
            BotError::Platform(format!("rate limited on {}", path))
        }
        _ => BotError::Platform(format!("{} on {}: {}", status, path, body)),
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawUser {
    id: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct RawRole {
    id: String,
    name: String,
    #[serde(default)]
    position: i64,
    #[serde(default)]
    hoist: bool,
    #[serde(default)]
    mentionable: bool,
}

impl From<RawRole> for RoleInfo {
    fn from(raw: RawRole) -> Self {
        RoleInfo {
            id: raw.id,
            name: raw.name,
            position: raw.position,
            hoist: raw.hoist,
            mentionable: raw.mentionable,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawOverwrite {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    allow: String,
    deny: String,
}

impl From<&Overwrite> for RawOverwrite {
    fn from(overwrite: &Overwrite) -> Self {
        RawOverwrite {
            id: overwrite.role_id.clone(),
            kind: OVERWRITE_ROLE,
            allow: overwrite.allow.bits().to_string(),
            deny: overwrite.deny.bits().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    position: i64,
    #[serde(default)]
    permission_overwrites: Vec<RawOverwrite>,
}

impl From<RawChannel> for ChannelInfo {
    fn from(raw: RawChannel) -> Self {
        let overwrites = raw
            .permission_overwrites
            .into_iter()
            .filter(|o| o.kind == OVERWRITE_ROLE)
            .map(|o| Overwrite {
                role_id: o.id,
                allow: Permissions(o.allow.parse().unwrap_or(0)),
                deny: Permissions(o.deny.parse().unwrap_or(0)),
            })
            .collect();

        ChannelInfo {
            id: raw.id,
            name: raw.name.unwrap_or_default(),
            kind: channel_type(raw.kind),
            parent_id: raw.parent_id,
            position: raw.position,
            overwrites,
        }
    }
}

fn channel_type(code: u8) -> ChannelType {
    match code {
        0 => ChannelType::Text,
        2 => ChannelType::Voice,
        4 => ChannelType::Category,
        other => ChannelType::Other(other),
    }
}

fn channel_type_code(kind: ChannelType) -> u8 {
    match kind {
        ChannelType::Text => 0,
        ChannelType::Voice => 2,
        ChannelType::Category => 4,
        ChannelType::Other(code) => code,
    }
}

#[derive(Debug, Deserialize)]
struct RawMember {
    #[serde(default)]
    user: Option<RawUser>,
    #[serde(default)]
    roles: Vec<String>,
}

impl RawMember {
    fn into_info(self) -> Option<MemberInfo> {
        let user = self.user?;
        Some(MemberInfo {
            id: user.id,
            roles: self.roles,
            bot: user.bot,
        })
    }
}

fn role_body(spec: &RoleSpec) -> serde_json::Value {
    json!({
        "name": spec.name,
        "hoist": spec.hoist,
        "mentionable": spec.mentionable,
        "color": spec.color,
        "permissions": "0",
    })
}

fn channel_body(spec: &ChannelSpec) -> serde_json::Value {
    let overwrites: Vec<RawOverwrite> = spec.overwrites.iter().map(RawOverwrite::from).collect();
    let mut body = json!({
        "name": spec.name,
        "type": channel_type_code(spec.kind),
        "permission_overwrites": overwrites,
    });
    if let Some(parent_id) = &spec.parent_id {
        body["parent_id"] = json!(parent_id);
    }
    if let Some(topic) = &spec.topic {
        body["topic"] = json!(topic);
    }
    body
}

// ============================================================================
// Platform
// ============================================================================

#[async_trait]
impl Platform for DiscordHttp {
    fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    async fn roles(&self, guild_id: &str) -> Result<Vec<RoleInfo>> {
        let raw: Vec<RawRole> = self
            .send_json(self.request(Method::GET, &format!("/guilds/{}/roles", guild_id)))
            .await?;
        Ok(raw.into_iter().map(RoleInfo::from).collect())
    }

    async fn create_role(&self, guild_id: &str, spec: &RoleSpec) -> Result<RoleId> {
        let raw: RawRole = self
            .send_json(
                self.request(Method::POST, &format!("/guilds/{}/roles", guild_id))
                    .json(&role_body(spec)),
            )
            .await?;
        debug!(guild_id = %guild_id, role_id = %raw.id, name = %raw.name, "Created role");
        Ok(raw.id)
    }

    async fn delete_role(&self, guild_id: &str, role_id: &str) -> Result<()> {
        self.send_empty(self.request(
            Method::DELETE,
            &format!("/guilds/{}/roles/{}", guild_id, role_id),
        ))
        .await
    }

    async fn channels(&self, guild_id: &str) -> Result<Vec<ChannelInfo>> {
        let raw: Vec<RawChannel> = self
            .send_json(self.request(Method::GET, &format!("/guilds/{}/channels", guild_id)))
            .await?;
        Ok(raw.into_iter().map(ChannelInfo::from).collect())
    }

    async fn channel(&self, guild_id: &str, channel_id: &str) -> Result<Option<ChannelInfo>> {
        let raw: Option<RawChannel> = self
            .probe(self.request(Method::GET, &format!("/channels/{}", channel_id)))
            .await?;
        // The channel endpoint is global; make sure it belongs to this guild
        Ok(raw
            .filter(|c| c.guild_id.as_deref().map_or(true, |g| g == guild_id))
            .map(ChannelInfo::from))
    }

    async fn create_channel(&self, guild_id: &str, spec: &ChannelSpec) -> Result<ChannelId> {
        let raw: RawChannel = self
            .send_json(
                self.request(Method::POST, &format!("/guilds/{}/channels", guild_id))
                    .json(&channel_body(spec)),
            )
            .await?;
        debug!(guild_id = %guild_id, channel_id = %raw.id, name = %spec.name, "Created channel");
        Ok(raw.id)
    }

    async fn delete_channel(&self, _guild_id: &str, channel_id: &str) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, &format!("/channels/{}", channel_id)))
            .await
    }

    async fn set_channel_parent(
        &self,
        _guild_id: &str,
        channel_id: &str,
        parent_id: &str,
    ) -> Result<()> {
        self.send_empty(
            self.request(Method::PATCH, &format!("/channels/{}", channel_id))
                .json(&json!({ "parent_id": parent_id })),
        )
        .await
    }

    async fn set_channel_positions(
        &self,
        guild_id: &str,
        positions: &[(ChannelId, i64)],
    ) -> Result<()> {
        let body: Vec<serde_json::Value> = positions
            .iter()
            .map(|(id, position)| json!({ "id": id, "position": position }))
            .collect();
        self.send_empty(
            self.request(Method::PATCH, &format!("/guilds/{}/channels", guild_id))
                .json(&body),
        )
        .await
    }

    async fn set_channel_overwrites(
        &self,
        _guild_id: &str,
        channel_id: &str,
        overwrites: &[Overwrite],
    ) -> Result<()> {
        let raw: Vec<RawOverwrite> = overwrites.iter().map(RawOverwrite::from).collect();
        self.send_empty(
            self.request(Method::PATCH, &format!("/channels/{}", channel_id))
                .json(&json!({ "permission_overwrites": raw })),
        )
        .await
    }

    async fn members(&self, guild_id: &str) -> Result<Vec<MemberInfo>> {
        let mut members = Vec::new();
        let mut after = String::from("0");

        loop {
            let page: Vec<RawMember> = self
                .send_json(
                    self.request(Method::GET, &format!("/guilds/{}/members", guild_id))
                        .query(&[
                            ("limit", MEMBER_PAGE_SIZE.to_string()),
                            ("after", after.clone()),
                        ]),
                )
                .await?;
            let page_len = page.len();
            members.extend(page.into_iter().filter_map(RawMember::into_info));

            match members.last() {
                Some(last) if page_len == MEMBER_PAGE_SIZE => after = last.id.clone(),
                _ => break,
            }
        }

        debug!(guild_id = %guild_id, count = members.len(), "Fetched members");
        Ok(members)
    }

    async fn member(&self, guild_id: &str, member_id: &str) -> Result<Option<MemberInfo>> {
        let raw: Option<RawMember> = self
            .probe(self.request(
                Method::GET,
                &format!("/guilds/{}/members/{}", guild_id, member_id),
            ))
            .await?;
        Ok(raw.and_then(RawMember::into_info))
    }

    async fn add_member_roles(
        &self,
        guild_id: &str,
        member_id: &str,
        role_ids: &[RoleId],
        reason: &str,
    ) -> Result<()> {
        let member = self.require_member(guild_id, member_id).await?;
        let mut roles = member.roles;
        for role_id in role_ids {
            if !roles.contains(role_id) {
                roles.push(role_id.clone());
            }
        }
        self.patch_member_roles(guild_id, member_id, roles, reason)
            .await
    }

    async fn remove_member_roles(
        &self,
        guild_id: &str,
        member_id: &str,
        role_ids: &[RoleId],
        reason: &str,
    ) -> Result<()> {
        let member = self.require_member(guild_id, member_id).await?;
        let roles: Vec<RoleId> = member
            .roles
            .into_iter()
            .filter(|r| !role_ids.contains(r))
            .collect();
        self.patch_member_roles(guild_id, member_id, roles, reason)
            .await
    }

    async fn kick_member(&self, guild_id: &str, member_id: &str, reason: &str) -> Result<()> {
        let builder = self.request(
            Method::DELETE,
            &format!("/guilds/{}/members/{}", guild_id, member_id),
        );
        self.send_empty(Self::with_reason(builder, reason)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mapping() {
        let raw: RawChannel = serde_json::from_str(
            r#"{
                "id": "10",
                "name": "cs-1000",
                "type": 2,
                "parent_id": "5",
                "position": 3,
                "permission_overwrites": [
                    {"id": "1", "type": 0, "allow": "1024", "deny": "0"},
                    {"id": "77", "type": 1, "allow": "0", "deny": "1024"}
                ]
            }"#,
        )
        .unwrap();

        let channel = ChannelInfo::from(raw);
        assert_eq!(channel.kind, ChannelType::Voice);
        assert_eq!(channel.parent_id.as_deref(), Some("5"));
        assert_eq!(channel.position, 3);
        // Member-targeted overwrites are ignored
        assert_eq!(channel.overwrites.len(), 1);
        assert!(channel.overwrites[0].allow.contains(Permissions::VIEW_CHANNEL));
    }

    #[test]
    fn test_member_without_user_is_skipped() {
        let raw: Vec<RawMember> = serde_json::from_str(
            r#"[{"roles": ["1"]}, {"user": {"id": "9", "bot": true}, "roles": []}]"#,
        )
        .unwrap();
        let members: Vec<MemberInfo> = raw.into_iter().filter_map(RawMember::into_info).collect();
        assert_eq!(members.len(), 1);
        assert!(members[0].bot);
    }

    #[test]
    fn test_channel_body() {
        let spec = ChannelSpec {
            name: "cs-1000".to_string(),
            kind: ChannelType::Text,
            parent_id: Some("5".to_string()),
            topic: None,
            overwrites: vec![Overwrite::deny("g", Permissions::VIEW_CHANNEL)],
        };
        let body = channel_body(&spec);
        assert_eq!(body["type"], 0);
        assert_eq!(body["parent_id"], "5");
        assert!(body.get("topic").is_none());
        assert_eq!(body["permission_overwrites"][0]["deny"], "1024");
    }

    #[test]
    fn test_status_errors() {
        assert!(status_error(StatusCode::NOT_FOUND, "/x", "").is_not_found());
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "/x", ""),
            BotError::Platform(_)
        ));
    }
}
