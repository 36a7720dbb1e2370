use super::*;
use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::error::ErrorCode;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct Recorded {
    authorization: Arc<Mutex<Vec<String>>>,
    media_fields: Arc<Mutex<Vec<(String, String)>>>,
    edits: Arc<Mutex<Vec<(String, String)>>>,
    reads: Arc<Mutex<Vec<String>>>,
    deletes: Arc<Mutex<Vec<String>>>,
}

fn message_json(id: &str, conversation_id: &str, content: &str) -> Value {
    json!({
        "_id": id,
        "conversationId": conversation_id,
        "sender": "u1",
        "content": content,
        "createdAt": "2024-05-01T10:00:00Z"
    })
}

async fn handle_list_conversations(
    State(state): State<Recorded>,
    headers: HeaderMap,
) -> Json<Value> {
    if let Some(value) = headers.get("authorization") {
        state
            .authorization
            .lock()
            .await
            .push(value.to_str().unwrap_or_default().to_string());
    }
    Json(json!({
        "data": [
            { "_id": "c1", "userId1": "u1", "userId2": "u2", "unreadCount": 2 },
            { "_id": "broken" },
            { "_id": "c2", "userId1": "u1", "userId2": { "_id": "u3", "name": "Cara" } }
        ]
    }))
}

async fn handle_list_messages(Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    if id == "missing" {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({
        "data": [message_json("m1", &id, "hi"), message_json("m2", &id, "there")]
    })))
}

async fn handle_media(State(state): State<Recorded>, mut multipart: Multipart) -> Json<Value> {
    let mut conversation_id = String::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let value = if name == "file" {
            let mime = field.content_type().unwrap_or_default().to_string();
            let file_name = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.unwrap_or_default();
            format!("{file_name}|{mime}|{}", bytes.len())
        } else {
            field.text().await.unwrap_or_default()
        };
        if name == "conversationId" {
            conversation_id = value.clone();
        }
        state.media_fields.lock().await.push((name, value));
    }
    let mut message = message_json("m9", &conversation_id, "caption");
    message["media"] = json!({ "url": "https://cdn/m9.png", "kind": "image" });
    Json(json!({ "data": message }))
}

async fn handle_edit(
    State(state): State<Recorded>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let content = body["content"].as_str().unwrap_or_default().to_string();
    state.edits.lock().await.push((id.clone(), content.clone()));
    let mut message = message_json(&id, "c1", &content);
    message["isEdited"] = json!(true);
    Json(json!({ "data": message }))
}

async fn handle_delete(State(state): State<Recorded>, Path(id): Path<String>) -> StatusCode {
    if id == "forbidden" {
        return StatusCode::FORBIDDEN;
    }
    state.deletes.lock().await.push(id);
    StatusCode::NO_CONTENT
}

async fn handle_read(
    State(state): State<Recorded>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    if id == "locked" {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "message": "conversation is archived" })),
        );
    }
    state.reads.lock().await.push(id);
    (StatusCode::OK, Json(json!({ "success": true })))
}

async fn spawn_api_server() -> (String, Recorded) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Recorded::default();
    let app = Router::new()
        .route("/api/conversations", get(handle_list_conversations))
        .route("/api/conversations/:id/messages", get(handle_list_messages))
        .route("/api/conversations/:id/read", post(handle_read))
        .route("/api/messages/media", post(handle_media))
        .route("/api/messages/:id", patch(handle_edit).delete(handle_delete))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api/"), state)
}

#[tokio::test]
async fn list_conversations_sends_bearer_and_skips_malformed_entries() {
    let (base_url, recorded) = spawn_api_server().await;
    let api = RestApi::new(base_url);
    api.set_credential(Some("token-123".to_string())).await;

    let conversations = api.list_conversations().await.expect("list conversations");

    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[0].unread_count, 2);
    assert_eq!(conversations[1].user_id2.display_name(), "Cara");
    assert_eq!(
        recorded.authorization.lock().await.as_slice(),
        ["Bearer token-123".to_string()]
    );
}

#[tokio::test]
async fn list_messages_decodes_envelope_in_server_order() {
    let (base_url, _recorded) = spawn_api_server().await;
    let api = RestApi::new(base_url);

    let messages = api
        .list_messages(&ConversationId::from("c7"))
        .await
        .expect("list messages");

    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["m1", "m2"]);
    assert!(messages
        .iter()
        .all(|m| m.conversation_id == ConversationId::from("c7")));
}

#[tokio::test]
async fn non_success_status_maps_to_api_exception() {
    let (base_url, _recorded) = spawn_api_server().await;
    let api = RestApi::new(base_url);

    let err = api
        .list_messages(&ConversationId::from("missing"))
        .await
        .expect_err("404 should fail");
    let exception = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(exception.code, ErrorCode::NotFound);

    let err = api
        .mark_conversation_read(&ConversationId::from("locked"))
        .await
        .expect_err("422 should fail");
    let exception = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(exception.code, ErrorCode::Validation);
    assert_eq!(exception.message, "conversation is archived");
}

#[tokio::test]
async fn send_media_posts_multipart_fields() {
    let (base_url, recorded) = spawn_api_server().await;
    let api = RestApi::new(base_url);

    let message = api
        .send_media(
            &ConversationId::from("c3"),
            Some("caption"),
            MediaUpload {
                filename: "flat.png".to_string(),
                mime_type: "image/png".to_string(),
                bytes: vec![1, 2, 3, 4],
            },
        )
        .await
        .expect("send media");

    assert_eq!(message.id, MessageId::from("m9"));
    assert_eq!(message.conversation_id, ConversationId::from("c3"));
    assert!(message.media.is_some());

    let fields = recorded.media_fields.lock().await.clone();
    assert!(fields.contains(&("conversationId".to_string(), "c3".to_string())));
    assert!(fields.contains(&("content".to_string(), "caption".to_string())));
    assert!(fields.contains(&("file".to_string(), "flat.png|image/png|4".to_string())));
}

#[tokio::test]
async fn edit_delete_and_read_hit_expected_routes() {
    let (base_url, recorded) = spawn_api_server().await;
    let api = RestApi::new(base_url);

    let edited = api
        .edit_message(&MessageId::from("m3"), "hi")
        .await
        .expect("edit");
    assert!(edited.is_edited);
    assert_eq!(edited.content.as_deref(), Some("hi"));

    api.delete_message(&MessageId::from("m4"))
        .await
        .expect("delete");
    api.mark_conversation_read(&ConversationId::from("c1"))
        .await
        .expect("read");

    assert_eq!(
        recorded.edits.lock().await.as_slice(),
        [("m3".to_string(), "hi".to_string())]
    );
    assert_eq!(recorded.deletes.lock().await.as_slice(), ["m4".to_string()]);
    assert_eq!(recorded.reads.lock().await.as_slice(), ["c1".to_string()]);

    let err = api
        .delete_message(&MessageId::from("forbidden"))
        .await
        .expect_err("403 should fail");
    assert_eq!(
        err.downcast_ref::<ApiException>().expect("api exception").code,
        ErrorCode::Forbidden
    );
}
