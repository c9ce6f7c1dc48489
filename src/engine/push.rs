use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Frames forwarded from the push listener to the run monitor.
#[derive(Debug)]
pub(crate) enum PushFrame {
    Connected,
    Text(String),
    /// Connect failed; the monitor carries on with polling alone.
    Unavailable(String),
    Closed(Option<String>),
}

/// Listen on the run's push channel and forward text frames until the socket closes.
///
/// The server never expects anything from the client, so nothing is sent.
/// There is no reconnect: polling covers the gap.
pub(crate) async fn listen(url: Url, connect_timeout: Duration, tx: UnboundedSender<PushFrame>) {
    let connect = tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await;
    let mut ws = match connect {
        Ok(Ok((ws, _resp))) => ws,
        Ok(Err(e)) => {
            warn!(url = %url, error = %e, "push channel connect failed");
            let _ = tx.send(PushFrame::Unavailable(e.to_string()));
            return;
        }
        Err(_) => {
            warn!(url = %url, "push channel connect timed out");
            let _ = tx.send(PushFrame::Unavailable("connect timed out".into()));
            return;
        }
    };
    let _ = tx.send(PushFrame::Connected);

    let reason = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if tx.send(PushFrame::Text(text.as_str().to_owned())).is_err() {
                    // Monitor is gone.
                    break None;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame.map(|f| format!("code={} reason={}", f.code, f.reason));
            }
            Some(Ok(other)) => {
                debug!(kind = ?other, "ignoring non-text push frame");
            }
            Some(Err(e)) => {
                warn!(error = %e, "push channel error");
                break Some(e.to_string());
            }
            None => break None,
        }
    };
    let _ = tx.send(PushFrame::Closed(reason));
}
