//! Headless room client.
//!
//! Runs the same controller a browser player would, against a simulated
//! media element, and logs what it does. Useful for soak-testing the
//! sync loop without a browser: start the server, run a couple of these,
//! and watch the drift corrections (ideally: none).

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncjam_core::clock::{Clock, SystemClock};
use syncjam_core::controller::{ClientController, MediaSink};
use syncjam_core::messages::{ClientMessage, ServerMessage};
use syncjam_core::queue::Track;

#[derive(Parser, Debug)]
#[command(about = "Headless SyncJam room client")]
struct Args {
    /// WebSocket URL of the room server
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Display name announced to the room
    #[arg(long, default_value = "cli-listener")]
    name: String,

    /// Queue this track id after connecting and start playback
    #[arg(long)]
    play: Option<String>,

    /// Duration in seconds reported for a --play track
    #[arg(long, default_value_t = 180.0)]
    duration: f64,
}

/// Stand-in for a browser media element. Data is always "buffered", the
/// position advances with real time and the playback rate, and every
/// action is logged.
struct SimulatedPlayer {
    track: Option<Track>,
    playing: bool,
    rate: f64,
    base_pos: f64,
    anchor: Instant,
}

impl SimulatedPlayer {
    fn new() -> Self {
        Self {
            track: None,
            playing: false,
            rate: 1.0,
            base_pos: 0.0,
            anchor: Instant::now(),
        }
    }

    fn freeze(&mut self) {
        self.base_pos = self.position();
        self.anchor = Instant::now();
    }
}

impl MediaSink for SimulatedPlayer {
    fn load(&mut self, track: &Track) {
        tracing::info!(id = %track.id, "player: load");
        self.track = Some(track.clone());
        self.playing = false;
        self.rate = 1.0;
        self.base_pos = 0.0;
        self.anchor = Instant::now();
    }

    fn seek(&mut self, seconds: f64) {
        tracing::info!(seconds, "player: seek");
        self.base_pos = seconds;
        self.anchor = Instant::now();
    }

    fn play(&mut self) {
        tracing::info!("player: play");
        self.freeze();
        self.playing = true;
    }

    fn pause(&mut self) {
        tracing::info!("player: pause");
        self.freeze();
        self.playing = false;
    }

    fn set_rate(&mut self, rate: f64) {
        if (rate - self.rate).abs() > f64::EPSILON {
            tracing::info!(rate, "player: rate");
        }
        self.freeze();
        self.rate = rate;
    }

    fn position(&self) -> f64 {
        if self.playing {
            self.base_pos + self.anchor.elapsed().as_secs_f64() * self.rate
        } else {
            self.base_pos
        }
    }

    fn buffered_ahead(&self, from: f64) -> f64 {
        match &self.track {
            Some(track) => (track.duration - from).max(0.0),
            None => 0.0,
        }
    }
}

async fn send<S>(write: &mut S, msg: &ClientMessage) -> anyhow::Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(msg)?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncjam_cli=info,syncjam_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let (ws_stream, _) = connect_async(args.url.as_str()).await?;
    tracing::info!(url = %args.url, "connected");
    let (mut write, mut read) = ws_stream.split();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let mut controller = ClientController::new(clock, SimulatedPlayer::new());

    send(
        &mut write,
        &ClientMessage::Join {
            name: args.name.clone(),
        },
    )
    .await?;

    if let Some(id) = &args.play {
        send(
            &mut write,
            &ClientMessage::AddToQueue {
                track: Track {
                    id: id.clone(),
                    source: "youtube".into(),
                    duration: args.duration,
                    meta: serde_json::Value::Null,
                },
            },
        )
        .await?;
        if let Some(msg) = controller.request_play() {
            send(&mut write, &msg).await?;
        }
    }

    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut report = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            for reply in controller.handle_server(msg) {
                                send(&mut write, &reply).await?;
                            }
                        }
                        Err(e) => tracing::debug!(error = %e, "unparseable frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("server closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(error = %e, "socket error");
                    break;
                }
            },
            _ = tick.tick() => {
                for msg in controller.poll() {
                    send(&mut write, &msg).await?;
                }
            }
            _ = report.tick() => {
                tracing::info!(
                    state = ?controller.state(),
                    position = %format!("{:.2}", controller.sink().position()),
                    latency_ms = controller.latency_ms(),
                    "status"
                );
            }
        }
    }

    Ok(())
}
