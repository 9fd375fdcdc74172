/*
 * CHAPPS postfix policy delegate
 * Copyright (C) 2023 The CHAPPS developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
 */

use anyhow::Context;
use chapps_common::Action;
use chapps_config::Config;
use chapps_policy::CascadingPolicyHandler;
use chapps_protocol::{Reader, Writer};
use tokio_stream::StreamExt;

/// Everything one request needs, swapped atomically on reload.
pub struct ServiceState {
    /// The validated configuration snapshot.
    pub config: std::sync::Arc<Config>,
    /// The policy pipeline built from that snapshot.
    pub handler: CascadingPolicyHandler,
}

/// Create a `TcpListener` ready to be listened to.
///
/// # Errors
///
/// * failed to bind to the socket address
/// * failed to set the listener to non blocking
pub fn socket_bind_anyhow<A: std::net::ToSocketAddrs + std::fmt::Debug>(
    addr: A,
) -> anyhow::Result<std::net::TcpListener> {
    let socket = std::net::TcpListener::bind(&addr)
        .with_context(|| format!("Failed to bind socket on addr: '{addr:?}'"))?;

    socket
        .set_nonblocking(true)
        .with_context(|| format!("Failed to set non-blocking socket on addr: '{addr:?}'"))?;

    Ok(socket)
}

/// TCP/IP policy-delegation server.
pub struct Server {
    state: tokio::sync::watch::Receiver<std::sync::Arc<ServiceState>>,
}

impl Server {
    /// Create a server over a hot-swappable service state.
    #[must_use]
    pub const fn new(state: tokio::sync::watch::Receiver<std::sync::Arc<ServiceState>>) -> Self {
        Self { state }
    }

    /// Main accept loop: one spawned task per Postfix connection, drained
    /// cleanly when `shutdown` flips.
    ///
    /// # Errors
    ///
    /// * failed to convert the socket to a `tokio::net::TcpListener`
    #[tracing::instrument(skip_all)]
    pub async fn listen(
        self,
        socket: std::net::TcpListener,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::from_std(socket)?;
        tracing::info!(
            interface = %listener.local_addr().expect("retrieve local address"),
            "Listening for policy requests.",
        );

        let client_counter =
            std::sync::Arc::new(std::sync::atomic::AtomicI64::new(0));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            self.handle_client(client_counter.clone(), stream, client_addr);
                        }
                        Err(error) => {
                            tracing::error!(%error, "Connection acceptance failure.");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain(&client_counter).await;
        Ok(())
    }

    /// Wait for in-flight requests, at most one request budget.
    async fn drain(&self, client_counter: &std::sync::atomic::AtomicI64) {
        let budget = self.state.borrow().config.core.request_budget;
        tracing::info!(?budget, "Draining connections before exit.");
        let deadline = tokio::time::Instant::now() + budget;
        while client_counter.load(std::sync::atomic::Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    #[tracing::instrument(name = "handle-client", skip_all, fields(client = %client_addr))]
    fn handle_client(
        &self,
        client_counter: std::sync::Arc<std::sync::atomic::AtomicI64>,
        mut stream: tokio::net::TcpStream,
        client_addr: std::net::SocketAddr,
    ) {
        tracing::debug!("Connection accepted.");
        let state = self.state.clone();

        let client_count_max = state.borrow().config.core.client_count_max;
        if client_count_max != -1
            && client_counter.load(std::sync::atomic::Ordering::SeqCst) >= client_count_max
        {
            tracing::warn!(
                max = client_count_max,
                "Connection count max reached, dismissing connection.",
            );
            tokio::spawn(async move {
                let _err = tokio::io::AsyncWriteExt::write_all(
                    &mut stream,
                    b"action=DUNNO\n\n",
                )
                .await;
                let _err = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
            });
            return;
        }

        client_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let session = uuid::Uuid::new_v4();
        tokio::spawn(async move {
            serve_connection(state, stream, session).await;
            client_counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        });
    }
}

/// One Postfix connection: requests in order, one action each, connection
/// held open until the peer closes. No error on this path may take the
/// process down.
#[tracing::instrument(name = "session", skip_all, fields(uuid = %session))]
async fn serve_connection(
    state: tokio::sync::watch::Receiver<std::sync::Arc<ServiceState>>,
    stream: tokio::net::TcpStream,
    session: uuid::Uuid,
) {
    let (read, write) = stream.into_split();
    let (size_limit, encoding) = {
        let snapshot = state.borrow();
        (
            snapshot.config.core.payload_size_limit,
            chapps_protocol::payload_encoding(&snapshot.config.core.payload_encoding)
                .unwrap_or_else(chapps_protocol::default_payload_encoding),
        )
    };
    let mut reader = Reader::new(read, size_limit, encoding);
    let mut writer = Writer::new(write);

    let requests = reader.as_request_stream();
    tokio::pin!(requests);

    while let Some(request) = requests.next().await {
        let request = match request {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(%error, "Unreadable policy request.");
                let _err = writer.send_action(&Action::Dunno).await;
                continue;
            }
        };

        // a fresh snapshot per request: SIGHUP lands between requests,
        // never in the middle of one.
        let snapshot = state.borrow().clone();
        let budget = snapshot.config.core.request_budget;
        let action =
            match tokio::time::timeout(budget, snapshot.handler.handle(&request)).await {
                Ok(action) => action,
                Err(_elapsed) => {
                    tracing::error!(
                        instance = request.instance().unwrap_or("-"),
                        ?budget,
                        "Request budget exceeded, answering the fallback.",
                    );
                    Action::Dunno
                }
            };

        if let Err(error) = writer.send_action(&action).await {
            tracing::warn!(%error, "Action delivery failure.");
            return;
        }
    }
    tracing::debug!("Connection ended.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapps_common::SpfResult;
    use chapps_policy::StaticSpfEvaluator;
    use chapps_store::{MemoryCache, TestAdapter};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn start(
        handler: CascadingPolicyHandler,
        config: Config,
    ) -> (std::net::SocketAddr, tokio::sync::watch::Sender<bool>) {
        let state = std::sync::Arc::new(ServiceState {
            config: std::sync::Arc::new(config),
            handler,
        });
        // the sender may drop: receivers keep serving the last snapshot.
        let (_state_tx, state_rx) = tokio::sync::watch::channel(state);
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let socket = socket_bind_anyhow("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            Server::new(state_rx).listen(socket, shutdown_rx).await.unwrap();
        });
        (addr, shutdown_tx)
    }

    fn outbound_handler() -> (CascadingPolicyHandler, Config) {
        let config = Config::from_ini_str("").unwrap();
        let cache = std::sync::Arc::new(MemoryCache::new());
        let adapter = std::sync::Arc::new(
            TestAdapter::new()
                .with_quota("bob", 10)
                .with_domain("bob", "ok.com"),
        );
        let handler =
            CascadingPolicyHandler::outbound(&config, cache, adapter).unwrap();
        (handler, config)
    }

    async fn roundtrip(
        stream: &mut tokio::net::TcpStream,
        request: &str,
    ) -> String {
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        let mut byte = [0_u8; 1];
        while !response.ends_with(b"\n\n") {
            assert!(stream.read(&mut byte).await.unwrap() == 1, "early close");
            response.push(byte[0]);
        }
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn a_connection_serves_multiple_requests_in_order() {
        let (handler, config) = outbound_handler();
        let (addr, _shutdown) = start(handler, config);

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();

        let accepted = roundtrip(
            &mut stream,
            "instance=w.0\nsasl_username=bob\nsender=x@ok.com\nrecipient=r@y\n\n",
        )
        .await;
        assert_eq!(accepted, "action=DUNNO\n\n");

        let rejected = roundtrip(
            &mut stream,
            "instance=w.1\nsasl_username=mallory\nsender=x@evil.com\nrecipient=r@y\n\n",
        )
        .await;
        assert_eq!(
            rejected,
            "action=REJECT Sender address not authorized for this user\n\n",
        );
    }

    #[tokio::test]
    async fn malformed_lines_answer_the_fallback_and_keep_the_connection() {
        let (handler, config) = outbound_handler();
        let (addr, _shutdown) = start(handler, config);

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();

        let fallback = roundtrip(&mut stream, "this is not an attribute\n\n").await;
        assert_eq!(fallback, "action=DUNNO\n\n");

        // the framing survived; a well-formed request still works.
        let accepted = roundtrip(
            &mut stream,
            "instance=w.2\nsasl_username=bob\nsender=x@ok.com\nrecipient=r@y\n\n",
        )
        .await;
        assert_eq!(accepted, "action=DUNNO\n\n");
    }

    #[tokio::test]
    async fn a_blown_request_budget_answers_the_fallback() {
        let config = Config::from_ini_str("[CHAPPS]\nrequest_budget = 50ms\n").unwrap();
        let cache = std::sync::Arc::new(MemoryCache::new());
        let adapter = std::sync::Arc::new(
            TestAdapter::new().with_domain_flags("y", false, true),
        );
        let evaluator = std::sync::Arc::new(
            StaticSpfEvaluator::returning(SpfResult::Pass, "slow")
                .with_delay(std::time::Duration::from_secs(5)),
        );
        let handler =
            CascadingPolicyHandler::inbound(&config, cache, adapter, evaluator).unwrap();
        let (addr, _shutdown) = start(handler, config);

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let fallback = roundtrip(
            &mut stream,
            "instance=w.3\nclient_address=1.2.3.4\nsender=s@x\nrecipient=r@y\n\n",
        )
        .await;
        assert_eq!(fallback, "action=DUNNO\n\n");
    }

    #[tokio::test]
    async fn greylisting_defers_then_delivers_over_the_wire() {
        let config = Config::from_ini_str("").unwrap();
        let cache = std::sync::Arc::new(MemoryCache::new());
        let adapter = std::sync::Arc::new(
            TestAdapter::new().with_domain_flags("y", true, false),
        );
        let handler =
            CascadingPolicyHandler::greylisting(&config, cache, adapter).unwrap();
        let (addr, _shutdown) = start(handler, config);

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = "instance=w.4\nclient_address=1.2.3.4\nsender=s@x\nrecipient=r@y\n\n";
        let retry = "instance=w.5\nclient_address=1.2.3.4\nsender=s@x\nrecipient=r@y\n\n";

        assert_eq!(
            roundtrip(&mut stream, request).await,
            "action=DEFER_IF_PERMIT Service temporarily unavailable - greylisted\n\n",
        );
        assert_eq!(roundtrip(&mut stream, retry).await, "action=DUNNO\n\n");
    }
}
