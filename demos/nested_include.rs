use std::error::Error;

use fireloop_sdk::rest::{Filter, Include, RestClient, RestClientOptions};
use fireloop_sdk::{Model, RecordId};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RecordId>,
    text: String,
    #[serde(default, skip_serializing)]
    likes: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RecordId>,
    text: String,
    #[serde(default, skip_serializing)]
    replies: Vec<Reply>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Room {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RecordId>,
    name: String,
    #[serde(default, skip_serializing)]
    messages: Vec<Message>,
}

impl Model for Room {
    const COLLECTION: &'static str = "Room";

    fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let options = RestClientOptions {
        access_token: Some(SecretString::new("REPLACE_WITH_ACCESS_TOKEN".to_string())),
        ..RestClientOptions::default()
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RestClient::with_options("http://localhost:3000", options)?;
        let rooms = client.model::<Room>("Rooms");

        let room = rooms
            .create(&Room {
                id: None,
                name: "X".to_string(),
                messages: Vec::new(),
            })
            .await?;
        let room_id = room.id.clone().ok_or("created room has no id")?;

        let message: Message = rooms
            .create_related(
                &room_id,
                "messages",
                &Message {
                    id: None,
                    text: "Hi".to_string(),
                    replies: Vec::new(),
                },
            )
            .await?;
        println!("created message id={:?} in room {room_id}", message.id);

        let include = Include::path(["messages", "replies", "likes"]).ok_or("empty include")?;
        let filter = Filter::new()
            .with_where(json!({ "id": room_id }))
            .with_include(include);
        for room in rooms.find(&filter).await? {
            for message in &room.messages {
                for reply in &message.replies {
                    println!(
                        "room={} message={} reply={} likes={}",
                        room.name,
                        message.text,
                        reply.text,
                        reply.likes.len()
                    );
                }
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
