use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use picochat_core::{encode, Packet, MAX_MSG_LENGTH};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time::{timeout, Duration},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to a relay, registers `name`, then relays stdin lines as chat and
/// prints every broadcast until either side closes.
pub async fn run_debug_client(url: String, name: String) -> Result<()> {
    debug!("connecting to {}", url);

    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", url, e);
            return Err(anyhow!("connection failed: {}", e));
        }
        Err(_) => return Err(anyhow!("connection to {} timed out", url)),
    };
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(outbound_frame(&name)?))
        .await
        .context("failed to send name")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) => {
                    write
                        .send(Message::Text(outbound_frame(&line)?))
                        .await
                        .context("failed to send message")?;
                }
                None => break,
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match Packet::from_json(&text) {
                    Ok(packet) => println!("{}", packet.body()),
                    Err(e) => warn!("ignoring malformed packet: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(anyhow!("websocket error: {}", e)),
            },
        }
    }

    let _ = write.close().await;
    Ok(())
}

/// Packet for one line of user input. The relay drops anything past
/// `MAX_MSG_LENGTH`, so the line is cut here to keep the frame honest.
fn outbound_frame(line: &str) -> Result<String> {
    let bounded: String = line.chars().take(MAX_MSG_LENGTH).collect();
    Ok(encode(&bounded)?.to_json())
}
