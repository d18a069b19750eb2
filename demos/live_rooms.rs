use std::error::Error;
use std::time::{SystemTime, UNIX_EPOCH};

use fireloop_sdk::realtime::{EventKind, RealtimeClient, RealtimeSession};
use fireloop_sdk::{Model, RecordId};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Room {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RecordId>,
    name: String,
}

impl Model for Room {
    const COLLECTION: &'static str = "Room";

    fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RecordId>,
    text: String,
}

impl Model for Message {
    const COLLECTION: &'static str = "Message";

    fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let base_url = "http://localhost:3000".to_string();
    let access_token = "REPLACE_WITH_ACCESS_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client =
            RealtimeClient::new(base_url).with_access_token(SecretString::new(access_token));
        let session = RealtimeSession::connect(&client).await?;
        session.ping(now_ms())?;

        let rooms = session.reference::<Room>()?;
        let _rooms_added = rooms.on(EventKind::ChildAdded).subscribe(|room: Room| {
            println!("room added id={:?} name={}", room.id, room.name);
        });

        let room = rooms
            .create(&Room {
                id: None,
                name: "lobby".to_string(),
            })
            .await?;
        println!("created room id={:?}", room.id);

        let messages = rooms.make(&room)?.child::<Message>("messages");
        let mut added = messages.on(EventKind::ChildAdded).listen();
        messages
            .create(&Message {
                id: None,
                text: "Hi".to_string(),
            })
            .await?;

        if let Some(message) = added.recv().await {
            println!("message added id={:?} text={}", message.id, message.text);
        }

        let closed = rooms.release();
        println!("released {closed} subscriptions");
        session.close();

        Ok::<(), Box<dyn Error>>(())
    })
}
