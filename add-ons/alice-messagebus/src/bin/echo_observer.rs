//! Print every envelope seen on the bus, one JSON line each.
//!
//! Usage: `alice-echo-observer [ws://127.0.0.1:8181/core] [pattern,pattern]`

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8181/core";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let base = args.next().unwrap_or_else(|| DEFAULT_URL.to_string());
    let subscribe = args.next().unwrap_or_else(|| "*".to_string());
    let url = format!("{}?name=echo-observer&subscribe={}", base, subscribe);

    let (socket, _) = connect_async(url.as_str()).await?;
    eprintln!("[alice-echo-observer] connected to {}", base);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => println!("{}", text),
                Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            _ = tokio::signal::ctrl_c() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    eprintln!("[alice-echo-observer] disconnected");
    Ok(())
}
