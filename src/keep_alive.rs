use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};

use crate::server_message::ServerMessage;

/// Returns the lazy keep-alive stream: one `ka` message every `interval`,
/// the first of them one `interval` after the stream is first polled. The
/// stream is infinite and ends only when its consumer drops it.
pub(crate) fn keep_alive_stream(interval: Duration) -> BoxStream<'static, ServerMessage> {
    stream::unfold((), move |()| async move {
        tokio::time::sleep(interval).await;
        Some((ServerMessage::ConnectionKeepAlive, ()))
    })
    .boxed()
}
