//! DNS plane: answers discovery queries over UDP.

mod handler;

pub use handler::DnsHandler;

use std::sync::Arc;

use tokio::net::UdpSocket;

/// Standard DNS UDP payload limit.
const MAX_DATAGRAM: usize = 512;

/// Serve queries on the given socket until the task is dropped. Each
/// datagram is answered from its own task so a slow alias lookup never
/// blocks the receive loop.
pub async fn serve(handler: DnsHandler, socket: UdpSocket) {
    let socket = Arc::new(socket);
    let handler = Arc::new(handler);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "dns socket recv error");
                continue;
            }
        };

        let query = buf[..len].to_vec();
        let socket = socket.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            match handler.handle(&query).await {
                Some(response) => {
                    if let Err(e) = socket.send_to(&response, src).await {
                        tracing::debug!(error = %e, "dns send error");
                    }
                }
                None => {
                    tracing::debug!(len = query.len(), "unparseable dns query dropped");
                }
            }
        });
    }
}
