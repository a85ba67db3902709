use std::time::Duration;

use tracing::trace;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::message::Args;

/// Emit `send` and resolve with the first payload that arrives on `reply`.
///
/// The reply listener is armed before the request leaves, so a reply can
/// never overtake it. On timeout the listener is removed and the call fails
/// with [`Error::Timeout`]; a channel closing underneath fails with
/// [`Error::ConnectionClosed`]. Exactly one outcome per call, no retries.
pub async fn request_reply(
    channel: &Channel,
    send: &str,
    reply: &str,
    args: Args,
    timeout: Duration,
) -> Result<Args> {
    let once = channel.once(reply);
    channel.emit(send, args)?;
    trace!(send, reply, "awaiting reply");

    // Dropping `once` on timeout unregisters it.
    match tokio::time::timeout(timeout, once).await {
        Ok(Some(payload)) => Ok(payload),
        Ok(None) => Err(Error::ConnectionClosed),
        Err(_) => Err(Error::Timeout(reply.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_with_first_reply() {
        let (client, server) = Channel::pair();
        let mut requests = server.on("ask");
        let responder = server.clone();
        tokio::spawn(async move {
            let args = requests.recv().await.unwrap();
            responder.emit("answer", vec![json!(null), args[0].clone()]).unwrap();
            responder.emit("answer", vec![json!("late")]).unwrap();
        });

        let reply = request_reply(&client, "ask", "answer", vec![json!(7)], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, vec![json!(null), json!(7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_removes_listener() {
        let (client, _server) = Channel::pair();
        let result = request_reply(
            &client,
            "ask",
            "answer",
            vec![],
            Duration::from_millis(2500),
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(ref event)) if event == "answer"));
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test]
    async fn closed_channel_fails_fast() {
        let (client, server) = Channel::pair();
        server.close();
        let result = request_reply(&client, "ask", "answer", vec![], Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }
}
