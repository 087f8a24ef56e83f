//! Typed platform endpoints on top of [`RestClient`].

use crate::config::RestConfig;
use crate::error::Error;
use crate::model::{Channel, GatewayBotInfo, Message, Snowflake, User};
use crate::rest::{MultipartFile, RestClient, Route, NO_BODY};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::form_urlencoded::byte_serialize;

/// Which mentions in a message may ping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedMentions {
    #[serde(default)]
    pub parse: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<Snowflake>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<Snowflake>,
    #[serde(default)]
    pub replied_user: bool,
}

impl AllowedMentions {
    /// Nothing pings
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Snowflake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<Snowflake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<Snowflake>,
}

/// Attachment metadata sent alongside uploaded files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub id: u64,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Body of a create-message call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_mentions: Option<AllowedMentions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_reference: Option<MessageReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u64>,
}

impl MessageRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

/// Body of an edit-message call.
///
/// Absent fields are left unchanged; an explicit `Some(None)` clears them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageEditRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeds: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_mentions: Option<AllowedMentions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u64>,
}

/// Body of a webhook execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_mentions: Option<AllowedMentions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u64>,
}

/// Emoji as used in reaction routes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionEmoji {
    Unicode(String),
    Custom { name: String, id: Snowflake },
}

impl ReactionEmoji {
    /// Path segment form: the unicode character, or `name:id`, URL-encoded
    pub fn encode(&self) -> String {
        let raw = match self {
            Self::Unicode(emoji) => emoji.clone(),
            Self::Custom { name, id } => format!("{}:{}", name, id),
        };
        byte_serialize(raw.as_bytes()).collect()
    }
}

#[derive(Serialize)]
struct CreateDmRequest {
    recipient_id: Snowflake,
}

/// Platform API client.
///
/// Cheap to clone; clones share the underlying [`RestClient`].
#[derive(Clone)]
pub struct ApiClient {
    rest: RestClient,
}

impl ApiClient {
    pub fn new(config: RestConfig) -> Result<Self, Error> {
        Ok(Self {
            rest: RestClient::new(config)?,
        })
    }

    pub fn from_rest(rest: RestClient) -> Self {
        Self { rest }
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Gateway URL, recommended shard count and session start limits
    pub async fn get_gateway_bot(&self) -> Result<GatewayBotInfo, Error> {
        self.rest
            .get("/gateway/bot", Route::new("get_gateway_bot", 0))
            .await?
            .ok_or(Error::EmptyResponse)
    }

    pub async fn get_user(&self, user_id: Snowflake) -> Result<Option<User>, Error> {
        self.rest
            .get(&format!("/users/{}", user_id), Route::new("get_user", 0))
            .await
    }

    pub async fn get_current_user(&self) -> Result<User, Error> {
        self.rest
            .get("/users/@me", Route::new("get_current_user", 0))
            .await?
            .ok_or(Error::EmptyResponse)
    }

    pub async fn get_channel(&self, channel_id: Snowflake) -> Result<Option<Channel>, Error> {
        self.rest
            .get(
                &format!("/channels/{}", channel_id),
                Route::new("get_channel", channel_id.get()),
            )
            .await
    }

    pub async fn get_message(
        &self,
        channel_id: Snowflake,
        message_id: Snowflake,
    ) -> Result<Option<Message>, Error> {
        self.rest
            .get(
                &format!("/channels/{}/messages/{}", channel_id, message_id),
                Route::new("get_message", channel_id.get()),
            )
            .await
    }

    /// Send a message; with files it goes out as a multipart upload
    pub async fn create_message(
        &self,
        channel_id: Snowflake,
        mut request: MessageRequest,
        files: Vec<MultipartFile>,
    ) -> Result<Message, Error> {
        let path = format!("/channels/{}/messages", channel_id);
        let route = Route::new("create_message", channel_id.get());

        let message = if files.is_empty() {
            self.rest.post(&path, route, Some(&request)).await?
        } else {
            request.attachments = attachment_infos(&files);
            self.rest.post_multipart(&path, route, &request, files).await?
        };
        message.ok_or(Error::EmptyResponse)
    }

    pub async fn edit_message(
        &self,
        channel_id: Snowflake,
        message_id: Snowflake,
        request: &MessageEditRequest,
    ) -> Result<Message, Error> {
        self.rest
            .patch(
                &format!("/channels/{}/messages/{}", channel_id, message_id),
                Route::new("edit_message", channel_id.get()),
                Some(request),
            )
            .await?
            .ok_or(Error::EmptyResponse)
    }

    pub async fn delete_message(&self, channel_id: Snowflake, message_id: Snowflake) -> Result<(), Error> {
        self.rest
            .delete(
                &format!("/channels/{}/messages/{}", channel_id, message_id),
                Route::new("delete_message", channel_id.get()),
            )
            .await
    }

    pub async fn create_reaction(
        &self,
        channel_id: Snowflake,
        message_id: Snowflake,
        emoji: &ReactionEmoji,
    ) -> Result<(), Error> {
        self.rest
            .put::<Value, _>(
                &format!(
                    "/channels/{}/messages/{}/reactions/{}/@me",
                    channel_id,
                    message_id,
                    emoji.encode()
                ),
                Route::new("create_reaction", channel_id.get()),
                NO_BODY,
            )
            .await
            .map(|_| ())
    }

    pub async fn delete_own_reaction(
        &self,
        channel_id: Snowflake,
        message_id: Snowflake,
        emoji: &ReactionEmoji,
    ) -> Result<(), Error> {
        self.rest
            .delete(
                &format!(
                    "/channels/{}/messages/{}/reactions/{}/@me",
                    channel_id,
                    message_id,
                    emoji.encode()
                ),
                Route::new("delete_own_reaction", channel_id.get()),
            )
            .await
    }

    pub async fn delete_all_reactions(&self, channel_id: Snowflake, message_id: Snowflake) -> Result<(), Error> {
        self.rest
            .delete(
                &format!("/channels/{}/messages/{}/reactions", channel_id, message_id),
                Route::new("delete_all_reactions", channel_id.get()),
            )
            .await
    }

    /// Open (or fetch) the DM channel with a user
    pub async fn create_dm(&self, recipient_id: Snowflake) -> Result<Channel, Error> {
        self.rest
            .post(
                "/users/@me/channels",
                Route::new("create_dm", 0),
                Some(&CreateDmRequest { recipient_id }),
            )
            .await?
            .ok_or(Error::EmptyResponse)
    }

    /// Execute a webhook and wait for the created message
    pub async fn execute_webhook(
        &self,
        webhook_id: Snowflake,
        token: &str,
        mut request: WebhookRequest,
        files: Vec<MultipartFile>,
        thread_id: Option<Snowflake>,
    ) -> Result<Message, Error> {
        let mut path = format!("/webhooks/{}/{}?wait=true", webhook_id, token);
        if let Some(thread_id) = thread_id {
            path.push_str(&format!("&thread_id={}", thread_id));
        }

        request.attachments = attachment_infos(&files);
        self.rest
            .post_multipart(&path, Route::new("execute_webhook", webhook_id.get()), &request, files)
            .await?
            .ok_or(Error::EmptyResponse)
    }

    pub async fn edit_webhook_message(
        &self,
        webhook_id: Snowflake,
        token: &str,
        message_id: Snowflake,
        request: &MessageEditRequest,
        thread_id: Option<Snowflake>,
    ) -> Result<Message, Error> {
        let mut path = format!("/webhooks/{}/{}/messages/{}", webhook_id, token, message_id);
        if let Some(thread_id) = thread_id {
            path.push_str(&format!("?thread_id={}", thread_id));
        }

        self.rest
            .patch(&path, Route::new("edit_webhook_message", webhook_id.get()), Some(request))
            .await?
            .ok_or(Error::EmptyResponse)
    }
}

fn attachment_infos(files: &[MultipartFile]) -> Vec<AttachmentInfo> {
    files
        .iter()
        .enumerate()
        .map(|(i, file)| AttachmentInfo {
            id: i as u64,
            filename: file.filename.clone(),
            description: file.description.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> ApiClient {
        ApiClient::new(
            RestConfig::builder("Bot token")
                .base_url(server.uri())
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    fn message_json(id: &str) -> Value {
        json!({
            "id": id,
            "channel_id": "10",
            "author": {"id": "1", "username": "bot"},
            "content": "hi"
        })
    }

    #[test]
    fn test_emoji_encoding() {
        assert_eq!(ReactionEmoji::Unicode("👍".to_string()).encode(), "%F0%9F%91%8D");
        let custom = ReactionEmoji::Custom {
            name: "blob".to_string(),
            id: Snowflake(42),
        };
        assert_eq!(custom.encode(), "blob%3A42");
    }

    #[test]
    fn test_edit_request_serialization() {
        let request = MessageEditRequest {
            content: Some(None),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&request).unwrap(), json!({"content": null}));
        assert_eq!(
            serde_json::to_value(MessageEditRequest::default()).unwrap(),
            json!({})
        );
    }

    #[tokio::test]
    async fn test_get_gateway_bot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gateway/bot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": "wss://gateway.example",
                "shards": 2,
                "session_start_limit": {"total": 1000, "remaining": 998, "reset_after": 1000, "max_concurrency": 1}
            })))
            .mount(&server)
            .await;

        let info = api(&server).get_gateway_bot().await.unwrap();
        assert_eq!(info.shards, 2);
        assert_eq!(info.url, "wss://gateway.example");
    }

    #[tokio::test]
    async fn test_create_message_json_and_missing_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/10/messages"))
            .and(body_json(json!({"content": "hi"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(message_json("5")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channels/11"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = api(&server);
        let message = api
            .create_message(Snowflake(10), MessageRequest::text("hi"), Vec::new())
            .await
            .unwrap();
        assert_eq!(message.id, Snowflake(5));
        assert!(api.get_channel(Snowflake(11)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execute_webhook_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhooks/7/secret"))
            .and(query_param("wait", "true"))
            .and(query_param("thread_id", "99"))
            .and(body_string_contains("\"username\":\"proxy\""))
            .and(body_string_contains("\"description\":\"a cat\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(message_json("6")))
            .expect(1)
            .mount(&server)
            .await;

        let request = WebhookRequest {
            content: Some("meow".to_string()),
            username: Some("proxy".to_string()),
            ..Default::default()
        };
        let files = vec![MultipartFile::new("cat.png", vec![1u8, 2, 3]).with_description("a cat")];

        let message = api(&server)
            .execute_webhook(Snowflake(7), "secret", request, files, Some(Snowflake(99)))
            .await
            .unwrap();
        assert_eq!(message.id, Snowflake(6));
    }

    #[tokio::test]
    async fn test_create_reaction_and_delete() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/channels/10/messages/5/reactions/blob%3A42/@me"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/channels/10/messages/5"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = api(&server);
        let emoji = ReactionEmoji::Custom {
            name: "blob".to_string(),
            id: Snowflake(42),
        };
        api.create_reaction(Snowflake(10), Snowflake(5), &emoji).await.unwrap();
        api.delete_message(Snowflake(10), Snowflake(5)).await.unwrap();
    }
}
